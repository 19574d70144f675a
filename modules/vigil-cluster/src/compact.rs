//! Log compaction: fold the instruction log to the minimal set that
//! reconstructs the current state, without racing followers.
//!
//! Per-component grouping is sound because every publish passed `verify`
//! against the state of its time; only the bootstrap needs inter-component
//! ordering, and the rewritten log preserves dependency order anyway
//! (deletes, then definitions in bootstrap order, then lifecycles).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::time::sleep;
use tracing::{info, warn};

use vigil_common::{ComponentKey, ComponentType};

use crate::error::ClusterError;
use crate::instruction::{Instruction, Op};
use crate::keys;
use crate::log::read_entry;
use crate::state::ClusterState;
use crate::sync::CompactionMsg;
use crate::FOLLOWER_IDLE_TIMEOUT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub original_entries: i64,
    pub kept_entries: i64,
}

/// Folded view of one component's history.
#[derive(Default)]
struct Folded {
    definition: Option<Instruction>,
    lifecycle: Option<Instruction>,
    deleted: Option<Instruction>,
    /// First version seen, for stable ordering of the rewritten log.
    first_seen: i64,
}

pub struct CompactionController {
    state: Arc<ClusterState>,
}

impl CompactionController {
    pub fn new(state: Arc<ClusterState>) -> Self {
        Self { state }
    }

    pub async fn compact(&self) -> Result<CompactionStats, ClusterError> {
        self.state.require_leader()?;
        if !self.state.begin_compaction() {
            return Err(ClusterError::CompactionInProgress);
        }
        let result = self.run().await;
        self.state.end_compaction();
        result
    }

    async fn run(&self) -> Result<CompactionStats, ClusterError> {
        let registry = self.state.registry();
        let original = self.state.current_version();
        if original == 0 {
            return Ok(CompactionStats {
                original_entries: 0,
                kept_entries: 0,
            });
        }

        self.wait_for_followers_idle().await;

        let start = CompactionMsg::CompactionStart {
            original_version: original,
        };
        registry
            .publish(keys::TOPIC_COMPACTION, &start.to_json())
            .await?;
        // Sentinel: any follower that syncs mid-compaction short-circuits.
        self.state.set_current(0);
        registry.set(keys::INSTRUCTION_CURRENT, "0", None).await?;

        let kept = self.fold(original).await?;

        // Drop the old entries, rewrite survivors densely from 1.
        for version in 1..=original {
            registry.del(&keys::instruction_key(version)).await?;
        }
        let mut new_version = 0i64;
        for mut instr in kept {
            new_version += 1;
            instr.version = new_version;
            registry
                .set(&keys::instruction_key(new_version), &instr.to_json(), None)
                .await?;
        }
        registry
            .set(keys::INSTRUCTION_CURRENT, &new_version.to_string(), None)
            .await?;
        self.state.set_current(new_version);

        let complete = CompactionMsg::CompactionComplete { new_version };
        registry
            .publish(keys::TOPIC_COMPACTION, &complete.to_json())
            .await?;

        info!(
            original_entries = original,
            kept_entries = new_version,
            "Compaction complete"
        );
        Ok(CompactionStats {
            original_entries: original,
            kept_entries: new_version,
        })
    }

    /// Scan entries 1..=original chronologically, folding each component
    /// to its final definition, final project lifecycle, or terminal
    /// delete.
    async fn fold(&self, original: i64) -> Result<Vec<Instruction>, ClusterError> {
        let registry = self.state.registry();
        let mut groups: HashMap<ComponentKey, Folded> = HashMap::new();

        for version in 1..=original {
            let Some(instr) = read_entry(registry, version).await? else {
                continue;
            };
            if instr.version == 0 {
                continue;
            }
            let key = ComponentKey::new(instr.component_type, &instr.component_id);
            let folded = groups.entry(key).or_default();
            if folded.first_seen == 0 {
                folded.first_seen = version;
            }
            match instr.op {
                op if op.is_definition() => {
                    folded.definition = Some(instr);
                    folded.deleted = None;
                }
                Op::Delete => {
                    folded.deleted = Some(instr);
                    folded.definition = None;
                    folded.lifecycle = None;
                }
                op if op.is_lifecycle() => folded.lifecycle = Some(instr),
                _ => {}
            }
        }

        // Rewritten order: deletes first (they only matter to followers
        // holding stale state), then definitions in dependency order,
        // then project lifecycles.
        let mut deletes: Vec<(i64, Instruction)> = Vec::new();
        let mut definitions: Vec<(usize, i64, Instruction)> = Vec::new();
        let mut lifecycles: Vec<(i64, Instruction)> = Vec::new();
        for (key, folded) in groups {
            if let Some(instr) = folded.deleted {
                deletes.push((folded.first_seen, instr));
                continue;
            }
            if let Some(instr) = folded.definition {
                let rank = ComponentType::BOOTSTRAP_ORDER
                    .iter()
                    .position(|ty| *ty == key.component_type)
                    .unwrap_or(ComponentType::BOOTSTRAP_ORDER.len());
                definitions.push((rank, folded.first_seen, instr));
            }
            if let Some(instr) = folded.lifecycle {
                lifecycles.push((folded.first_seen, instr));
            }
        }
        deletes.sort_by_key(|(seen, _)| *seen);
        definitions.sort_by_key(|(rank, seen, _)| (*rank, *seen));
        lifecycles.sort_by_key(|(seen, _)| *seen);

        let mut kept: Vec<Instruction> = Vec::new();
        kept.extend(deletes.into_iter().map(|(_, i)| i));
        kept.extend(definitions.into_iter().map(|(_, _, i)| i));
        kept.extend(lifecycles.into_iter().map(|(_, i)| i));
        Ok(kept)
    }

    /// Poll execution flags until no follower is mid-replay, or give up
    /// after the timeout and proceed with a warning.
    async fn wait_for_followers_idle(&self) {
        let registry = self.state.registry();
        let deadline = Instant::now() + FOLLOWER_IDLE_TIMEOUT;
        loop {
            match registry.keys(keys::EXECUTION_FLAG_PATTERN).await {
                Ok(flags) if flags.is_empty() => return,
                Ok(flags) => {
                    if Instant::now() >= deadline {
                        warn!(
                            executing = flags.len(),
                            "Followers still executing at timeout; compacting anyway"
                        );
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Cannot poll execution flags; compacting anyway");
                    return;
                }
            }
            sleep(std::time::Duration::from_millis(500)).await;
        }
    }
}
