//! Follower synchronization: replay leader instructions in order, at most
//! once per entry, with session resets when the leader epoch changes.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use vigil_pipeline::RestartReason;

use crate::error::ClusterError;
use crate::keys;
use crate::log::read_entry;
use crate::state::{ClusterState, Role};
use crate::{EXECUTION_FLAG_TTL, PERIODIC_SYNC_INTERVAL};

/// Messages on `cluster:sync_command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SyncCommand {
    /// Targeted (or broadcast) nudge from the drift detector.
    Sync {
        leader_version: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    /// The leader appended an entry.
    PublishComplete { leader_version: i64 },
}

impl SyncCommand {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("sync command serialization cannot fail")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Messages on `cluster:compaction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CompactionMsg {
    CompactionStart { original_version: i64 },
    CompactionComplete { new_version: i64 },
}

impl CompactionMsg {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("compaction message serialization cannot fail")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// What prompted a sync pass. Drift nudges respect the project restart
/// cooldown; publish notifications and periodic passes do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOrigin {
    Notification,
    DriftNudge,
    Periodic,
}

impl SyncOrigin {
    fn restart_reason(self) -> RestartReason {
        match self {
            SyncOrigin::DriftNudge => RestartReason::Drift,
            _ => RestartReason::Operator,
        }
    }
}

pub struct SyncService {
    state: Arc<ClusterState>,
}

impl SyncService {
    pub fn new(state: Arc<ClusterState>) -> Self {
        Self { state }
    }

    /// Catch up with the leader: detect session changes, then apply
    /// entries `current+1 ..= leader_current` in order. Returns the local
    /// version after the pass.
    pub async fn synchronize(&self, origin: SyncOrigin) -> Result<i64, ClusterError> {
        if self.state.role() == Role::Leader {
            return Ok(self.state.current_version());
        }
        if self.state.remote_compaction().is_some() {
            debug!("Compaction in flight; deferring sync");
            return Ok(self.state.current_version());
        }

        let registry = self.state.registry();
        let Some(leader_base) = registry.get(keys::INSTRUCTION_BASE).await? else {
            // No leader has bootstrapped yet.
            return Ok(self.state.current_version());
        };
        let leader_current: i64 = registry
            .get(keys::INSTRUCTION_CURRENT)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        if leader_base != self.state.base_version() {
            info!(
                old = %self.state.base_version(),
                new = %leader_base,
                "Leader session changed; resyncing from scratch"
            );
            self.state.reset_local_state().await;
            self.state.set_base(&leader_base);
        }

        // Version 0 is the sentinel: bootstrap or compaction in flight.
        if leader_current == 0 {
            return Ok(self.state.current_version());
        }
        let local = self.state.current_version();
        if leader_current <= local {
            return Ok(local);
        }

        info!(from = local + 1, to = leader_current, "Applying instructions");
        self.apply_range(local + 1, leader_current, origin.restart_reason())
            .await
    }

    /// Replay a dense range under the execution flag. Individual entry
    /// failures are counted and logged; the version still advances so one
    /// bad config cannot wedge the follower.
    pub(crate) async fn apply_range(
        &self,
        from: i64,
        to: i64,
        reason: RestartReason,
    ) -> Result<i64, ClusterError> {
        let registry = self.state.registry();
        let flag_key = keys::execution_flag_key(&self.state.node_id);
        registry
            .set(&flag_key, "1", Some(EXECUTION_FLAG_TTL))
            .await?;

        let mut last_refresh = Instant::now();
        for version in from..=to {
            if last_refresh.elapsed() >= EXECUTION_FLAG_TTL / 3 {
                if let Err(e) = registry
                    .set(&flag_key, "1", Some(EXECUTION_FLAG_TTL))
                    .await
                {
                    warn!(error = %e, "Failed to refresh execution flag");
                }
                last_refresh = Instant::now();
            }

            match read_entry(registry, version).await {
                Ok(Some(instr)) => {
                    if let Err(e) = self.state.apply_instruction(&instr, reason).await {
                        self.state.count_apply_failure();
                        warn!(version, error = %e, "Instruction failed to apply");
                    }
                }
                Ok(None) => debug!(version, "No entry at version (compacted); skipping"),
                Err(e) => {
                    self.state.count_apply_failure();
                    warn!(version, error = %e, "Undecodable instruction; skipping");
                }
            }
            // At-most-once per node: the cursor advances regardless.
            self.state.set_current(version);
        }

        if let Err(e) = registry.del(&flag_key).await {
            warn!(error = %e, "Failed to clear execution flag; TTL will reap it");
        }
        Ok(to)
    }

    /// React to the compaction broadcasts. A follower that was exactly at
    /// the pre-compaction version adopts the new one (its state already
    /// equals the folded log); anything else resyncs from 1.
    pub async fn handle_compaction(&self, msg: CompactionMsg) -> Result<(), ClusterError> {
        if self.state.role() == Role::Leader {
            return Ok(());
        }
        match msg {
            CompactionMsg::CompactionStart { original_version } => {
                debug!(original_version, "Compaction started; pausing sync");
                self.state.set_remote_compaction(Some(original_version));
                Ok(())
            }
            CompactionMsg::CompactionComplete { new_version } => {
                let observed = self.state.remote_compaction();
                self.state.set_remote_compaction(None);
                let local = self.state.current_version();
                match observed {
                    Some(original) if local == original => {
                        info!(new_version, "Adopting compacted log version");
                        self.state.set_current(new_version);
                        Ok(())
                    }
                    _ => {
                        info!(
                            local,
                            new_version,
                            "Behind at compaction; replaying compacted log"
                        );
                        self.state.reset_local_state().await;
                        self.apply_range(1, new_version, RestartReason::Operator)
                            .await?;
                        Ok(())
                    }
                }
            }
        }
    }

    /// Long-lived listener: sync nudges, publish notifications, compaction
    /// brackets, and a periodic fallback pass. Resubscribes with backoff
    /// if the registry connection drops.
    pub fn spawn_listener(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let subscriptions = async {
                    let sync_rx = self.state.registry().subscribe(keys::TOPIC_SYNC).await?;
                    let compaction_rx = self
                        .state
                        .registry()
                        .subscribe(keys::TOPIC_COMPACTION)
                        .await?;
                    Ok::<_, ClusterError>((sync_rx, compaction_rx))
                };
                let (mut sync_rx, mut compaction_rx) = match subscriptions.await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Subscription failed; retrying");
                        sleep(PERIODIC_SYNC_INTERVAL).await;
                        continue;
                    }
                };

                let mut tick = tokio::time::interval(PERIODIC_SYNC_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        maybe = sync_rx.recv() => match maybe {
                            Some(raw) => self.on_sync_message(&raw).await,
                            None => break,
                        },
                        maybe = compaction_rx.recv() => match maybe {
                            Some(raw) => self.on_compaction_message(&raw).await,
                            None => break,
                        },
                        _ = tick.tick() => {
                            if let Err(e) = self.synchronize(SyncOrigin::Periodic).await {
                                warn!(error = %e, "Periodic sync failed");
                            }
                        }
                    }
                }
                warn!("Cluster subscription closed; resubscribing");
                sleep(std::time::Duration::from_secs(1)).await;
            }
        })
    }

    async fn on_sync_message(&self, raw: &str) {
        let origin = match SyncCommand::from_json(raw) {
            Ok(SyncCommand::Sync { node_id: Some(target), .. })
                if target != self.state.node_id =>
            {
                return;
            }
            Ok(SyncCommand::Sync { .. }) => SyncOrigin::DriftNudge,
            Ok(SyncCommand::PublishComplete { .. }) => SyncOrigin::Notification,
            Err(e) => {
                warn!(error = %e, "Undecodable sync command");
                return;
            }
        };
        if let Err(e) = self.synchronize(origin).await {
            warn!(error = %e, "Sync failed");
        }
    }

    async fn on_compaction_message(&self, raw: &str) {
        match CompactionMsg::from_json(raw) {
            Ok(msg) => {
                if let Err(e) = self.handle_compaction(msg).await {
                    warn!(error = %e, "Compaction handling failed");
                }
            }
            Err(e) => warn!(error = %e, "Undecodable compaction message"),
        }
    }
}
