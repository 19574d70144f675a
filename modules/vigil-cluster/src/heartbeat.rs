//! Heartbeats and drift detection.
//!
//! Every node publishes `{node_id, version, telemetry}` each interval
//! (the leader included, so it stays enumerable) and refreshes its
//! known-node marker. The leader's monitor records the latest per node,
//! nudges any follower whose version differs (unless a compaction is in
//! flight), and evicts nodes silent past the offline TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::keys;
use crate::state::{ClusterState, Role};
use crate::sync::SyncCommand;
use crate::{HEARTBEAT_INTERVAL, OFFLINE_TTL};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    /// `<base>.<current>` at publish time.
    pub version: String,
    pub current: i64,
    pub ts: DateTime<Utc>,
    pub cpu_pct: f32,
    pub mem_mb: u64,
    pub mem_pct: f32,
    pub tasks: usize,
}

impl Heartbeat {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("heartbeat serialization cannot fail")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Latest heartbeat per live node.
#[derive(Default)]
pub struct NodeTable {
    nodes: Mutex<HashMap<String, (Heartbeat, Instant)>>,
}

impl NodeTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upsert(&self, heartbeat: Heartbeat) {
        self.nodes
            .lock()
            .expect("node table poisoned")
            .insert(heartbeat.node_id.clone(), (heartbeat, Instant::now()));
    }

    /// Evict nodes unseen past the offline TTL.
    pub fn prune(&self) {
        self.nodes
            .lock()
            .expect("node table poisoned")
            .retain(|_, (_, seen)| seen.elapsed() < OFFLINE_TTL);
    }

    pub fn snapshot(&self) -> Vec<Heartbeat> {
        let mut nodes: Vec<Heartbeat> = self
            .nodes
            .lock()
            .expect("node table poisoned")
            .values()
            .map(|(hb, _)| hb.clone())
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn online_count(&self) -> usize {
        self.nodes.lock().expect("node table poisoned").len()
    }
}

pub struct HeartbeatService {
    state: Arc<ClusterState>,
    pub table: Arc<NodeTable>,
}

impl HeartbeatService {
    pub fn new(state: Arc<ClusterState>) -> Self {
        Self {
            state,
            table: NodeTable::new(),
        }
    }

    /// Publish this node's heartbeat every interval and keep its
    /// known-node marker fresh.
    pub fn spawn_publisher(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            let mut sys = System::new();
            let pid = sysinfo::get_current_pid().ok();
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tick.tick().await;
                let heartbeat = build_heartbeat(&state, &mut sys, pid);
                table.upsert(heartbeat.clone());

                let registry = state.registry();
                if let Err(e) = registry
                    .publish(keys::TOPIC_HEARTBEAT, &heartbeat.to_json())
                    .await
                {
                    warn!(error = %e, "Heartbeat publish failed");
                }
                if let Err(e) = registry
                    .set(
                        &keys::known_node_key(&state.node_id),
                        &heartbeat.ts.to_rfc3339(),
                        Some(OFFLINE_TTL),
                    )
                    .await
                {
                    warn!(error = %e, "Known-node refresh failed");
                }
            }
        })
    }

    /// Track peers and, as leader, nudge any follower whose version has
    /// drifted.
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        let table = self.table.clone();
        tokio::spawn(async move {
            loop {
                let mut rx = match state.registry().subscribe(keys::TOPIC_HEARTBEAT).await {
                    Ok(rx) => rx,
                    Err(e) => {
                        warn!(error = %e, "Heartbeat subscription failed; retrying");
                        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                        continue;
                    }
                };
                let mut prune_tick = tokio::time::interval(OFFLINE_TTL / 4);
                prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        maybe = rx.recv() => match maybe {
                            Some(raw) => match Heartbeat::from_json(&raw) {
                                Ok(heartbeat) => {
                                    nudge_if_drifted(&state, &heartbeat).await;
                                    table.upsert(heartbeat);
                                }
                                Err(e) => warn!(error = %e, "Undecodable heartbeat"),
                            },
                            None => break,
                        },
                        _ = prune_tick.tick() => table.prune(),
                    }
                }
                warn!("Heartbeat subscription closed; resubscribing");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        })
    }
}

/// Leader-only: a follower reporting a different version gets a targeted
/// sync command, unless compaction is rewriting the log right now.
async fn nudge_if_drifted(state: &Arc<ClusterState>, heartbeat: &Heartbeat) {
    if state.role() != Role::Leader
        || heartbeat.node_id == state.node_id
        || state.is_compacting()
    {
        return;
    }
    if heartbeat.version == state.version_string() {
        return;
    }
    debug!(
        node = %heartbeat.node_id,
        theirs = %heartbeat.version,
        ours = %state.version_string(),
        "Follower drifted; sending targeted sync"
    );
    let command = SyncCommand::Sync {
        leader_version: state.current_version(),
        node_id: Some(heartbeat.node_id.clone()),
    };
    if let Err(e) = state
        .registry()
        .publish(keys::TOPIC_SYNC, &command.to_json())
        .await
    {
        warn!(error = %e, "Targeted sync publish failed");
    }
}

fn build_heartbeat(
    state: &Arc<ClusterState>,
    sys: &mut System,
    pid: Option<sysinfo::Pid>,
) -> Heartbeat {
    let (cpu_pct, mem_mb, mem_pct) = match pid {
        Some(pid) => {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.refresh_memory();
            match sys.process(pid) {
                Some(process) => {
                    let mem = process.memory();
                    let total = sys.total_memory().max(1);
                    (
                        process.cpu_usage(),
                        mem / (1024 * 1024),
                        (mem as f32 / total as f32) * 100.0,
                    )
                }
                None => (0.0, 0, 0.0),
            }
        }
        None => (0.0, 0, 0.0),
    };
    let tasks = tokio::runtime::Handle::current()
        .metrics()
        .num_alive_tasks();

    Heartbeat {
        node_id: state.node_id.clone(),
        version: state.version_string(),
        current: state.current_version(),
        ts: Utc::now(),
        cpu_pct,
        mem_mb,
        mem_pct,
        tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(node: &str) -> Heartbeat {
        Heartbeat {
            node_id: node.to_string(),
            version: "abc.3".to_string(),
            current: 3,
            ts: Utc::now(),
            cpu_pct: 1.0,
            mem_mb: 64,
            mem_pct: 0.5,
            tasks: 10,
        }
    }

    #[test]
    fn table_tracks_latest_per_node() {
        let table = NodeTable::new();
        table.upsert(heartbeat("a"));
        let mut newer = heartbeat("a");
        newer.current = 9;
        table.upsert(newer);
        table.upsert(heartbeat("b"));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].node_id, "a");
        assert_eq!(snapshot[0].current, 9);
    }

    #[test]
    fn heartbeat_round_trips() {
        let hb = heartbeat("n1");
        let again = Heartbeat::from_json(&hb.to_json()).unwrap();
        assert_eq!(hb, again);
    }
}
