//! The leader side of the instruction log: verify, append, notify.
//!
//! Every publish verifies first, persists the entry and the new current
//! version, applies the instruction locally (the leader executes
//! pipelines like any node), then broadcasts a sync notification. A
//! persistence failure leaves the in-memory version untouched, so a
//! failed publish cannot create a gap.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use vigil_common::ComponentType;
use vigil_pipeline::RestartReason;
use vigil_registry::Registry;

use crate::compact::CompactionController;
use crate::error::ClusterError;
use crate::instruction::{Instruction, Op};
use crate::keys;
use crate::state::ClusterState;
use crate::sync::SyncCommand;
use crate::COMPACTION_THRESHOLD;

pub struct InstructionLog {
    state: Arc<ClusterState>,
}

impl InstructionLog {
    pub fn new(state: Arc<ClusterState>) -> Self {
        Self { state }
    }

    /// Publish a definition (`add`/`update`/`local_push`/`push_change`).
    /// Verification must pass; the log never carries a config that fails
    /// `verify`.
    pub async fn publish_definition(
        &self,
        component_type: ComponentType,
        id: &str,
        op: Op,
        content: &str,
    ) -> Result<i64, ClusterError> {
        self.guard_publish()?;
        if !op.is_definition() {
            return Err(ClusterError::Payload(format!(
                "{op:?} is not a definition op"
            )));
        }
        self.state
            .runtime()
            .tables()
            .verify(component_type, id, content)
            .map_err(|detail| ClusterError::VerifyRejected {
                what: format!("{component_type}.{id}"),
                detail,
            })?;

        self.commit(|version| {
            Instruction::definition(version, component_type, id, op, content)
        })
        .await
    }

    /// Publish a delete. Rejected while any project still references the
    /// component; the error names the blockers.
    pub async fn publish_delete(
        &self,
        component_type: ComponentType,
        id: &str,
    ) -> Result<i64, ClusterError> {
        self.guard_publish()?;
        let tables = self.state.runtime().tables();
        if !tables.contains(component_type, id) {
            return Err(ClusterError::VerifyRejected {
                what: format!("{component_type}.{id}"),
                detail: "component does not exist".to_string(),
            });
        }
        let referencing = tables.projects_referencing(component_type, id);
        if component_type != ComponentType::Project && !referencing.is_empty() {
            return Err(ClusterError::DeleteBlocked {
                what: format!("{component_type}.{id}"),
                projects: referencing.join(", "),
            });
        }

        if component_type == ComponentType::Project {
            self.state.clear_intent(id).await?;
        }
        self.commit(|version| Instruction::delete(version, component_type, id, referencing))
            .await
    }

    /// Publish a project lifecycle change and record the operator's
    /// intent for crash recovery.
    pub async fn publish_lifecycle(
        &self,
        project_id: &str,
        op: Op,
    ) -> Result<i64, ClusterError> {
        self.guard_publish()?;
        if !op.is_lifecycle() {
            return Err(ClusterError::Payload(format!(
                "{op:?} is not a lifecycle op"
            )));
        }
        if !self
            .state
            .runtime()
            .tables()
            .contains(ComponentType::Project, project_id)
        {
            return Err(ClusterError::VerifyRejected {
                what: format!("project.{project_id}"),
                detail: "project does not exist".to_string(),
            });
        }
        match op {
            Op::Start => self.state.record_intent(project_id, true).await?,
            Op::Stop => self.state.record_intent(project_id, false).await?,
            _ => {}
        }
        self.commit(|version| Instruction::lifecycle(version, project_id, op))
            .await
    }

    fn guard_publish(&self) -> Result<(), ClusterError> {
        self.state.require_leader()?;
        if self.state.is_compacting() {
            return Err(ClusterError::CompactionInProgress);
        }
        Ok(())
    }

    async fn commit(
        &self,
        build: impl FnOnce(i64) -> Instruction,
    ) -> Result<i64, ClusterError> {
        // Fold the log down first when it has grown past the threshold.
        if self.state.current_version() >= COMPACTION_THRESHOLD {
            let controller = CompactionController::new(self.state.clone());
            if let Err(e) = controller.compact().await {
                warn!(error = %e, "Opportunistic compaction failed; publishing anyway");
            }
        }

        let registry = self.state.registry();
        let version = self.state.current_version() + 1;
        let instr = build(version);

        registry
            .set(&keys::instruction_key(version), &instr.to_json(), None)
            .await?;
        if let Err(e) = registry
            .set(keys::INSTRUCTION_CURRENT, &version.to_string(), None)
            .await
        {
            // Roll the entry back; the in-memory version was never bumped.
            let _ = registry.del(&keys::instruction_key(version)).await;
            return Err(e.into());
        }
        self.state.set_current(version);

        // The leader executes its own instruction like any node would.
        if let Err(e) = self
            .state
            .apply_instruction(&instr, RestartReason::Operator)
            .await
        {
            self.state.count_apply_failure();
            warn!(version, error = %e, "Leader-side apply failed");
        }

        let notify = SyncCommand::PublishComplete {
            leader_version: version,
        };
        if let Err(e) = registry
            .publish(keys::TOPIC_SYNC, &notify.to_json())
            .await
        {
            // Followers will still converge on the next heartbeat check.
            warn!(version, error = %e, "Publish notification failed");
        }

        info!(
            version,
            op = ?instr.op,
            component = %format!("{}.{}", instr.component_type, instr.component_id),
            "Published instruction"
        );
        Ok(version)
    }

    /// Bootstrap the log after winning the election: fresh session epoch,
    /// one `add` per component in dependency order, then one `start` per
    /// project whose persisted intent is Running. The published current
    /// version stays 0 until the very end, so followers see either
    /// nothing or the complete bootstrap.
    pub async fn initialize_leader_instructions(&self) -> Result<i64, ClusterError> {
        self.state.require_leader()?;
        let registry = self.state.registry();
        let tables = self.state.runtime().tables();

        let base = Uuid::new_v4().to_string();
        info!(base = %base, "Initializing leader instruction log");

        // Drop entries from any previous session. The pattern also matches
        // the current/base keys; the numeric filter keeps those alive.
        for key in registry.keys(keys::INSTRUCTION_PATTERN).await? {
            let suffix = key.rsplit(':').next().unwrap_or_default();
            if suffix.parse::<i64>().is_ok() {
                registry.del(&key).await?;
            }
        }
        registry.set(keys::INSTRUCTION_BASE, &base, None).await?;
        registry.set(keys::INSTRUCTION_CURRENT, "0", None).await?;
        self.state.set_base(&base);
        self.state.set_current(0);

        let mut version = 0i64;
        let mut entries: Vec<Instruction> = Vec::new();
        for component_type in ComponentType::BOOTSTRAP_ORDER {
            for id in tables.ids(component_type) {
                let Some(content) = tables.get(component_type, &id) else {
                    continue;
                };
                version += 1;
                let instr =
                    Instruction::definition(version, component_type, &id, Op::Add, content);
                registry
                    .set(&keys::instruction_key(version), &instr.to_json(), None)
                    .await?;
                entries.push(instr);
            }
        }
        for id in tables.ids(ComponentType::Project) {
            if self.state.intent(&id).await?.unwrap_or(false) {
                version += 1;
                let instr = Instruction::lifecycle(version, &id, Op::Start);
                registry
                    .set(&keys::instruction_key(version), &instr.to_json(), None)
                    .await?;
                entries.push(instr);
            }
        }

        // Single visibility point: followers now see the whole bootstrap.
        registry
            .set(keys::INSTRUCTION_CURRENT, &version.to_string(), None)
            .await?;
        self.state.set_current(version);

        for instr in &entries {
            if let Err(e) = self
                .state
                .apply_instruction(instr, RestartReason::Operator)
                .await
            {
                self.state.count_apply_failure();
                warn!(version = instr.version, error = %e, "Bootstrap apply failed");
            }
        }

        let notify = SyncCommand::PublishComplete {
            leader_version: version,
        };
        if let Err(e) = registry.publish(keys::TOPIC_SYNC, &notify.to_json()).await {
            warn!(error = %e, "Bootstrap notification failed");
        }
        info!(entries = version, "Leader bootstrap complete");
        Ok(version)
    }
}

/// Fetch and decode one log entry; `None` when the version has no entry
/// (compacted away or never written).
pub async fn read_entry(
    registry: &Arc<dyn Registry>,
    version: i64,
) -> Result<Option<Instruction>, ClusterError> {
    let Some(raw) = registry.get(&keys::instruction_key(version)).await? else {
        return Ok(None);
    };
    Instruction::from_json(&raw)
        .map(Some)
        .map_err(|e| ClusterError::Payload(format!("instruction {version}: {e}")))
}
