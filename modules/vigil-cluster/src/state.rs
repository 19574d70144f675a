//! Shared cluster state: node identity, role, the local log cursor, and
//! the instruction applier that drives the component tables and project
//! runtime.
//!
//! One value owns it all behind `Arc`; the election loop, sync service,
//! heartbeat service, and compaction controller each hold a handle. None
//! of the accessors perform I/O while holding an internal lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use vigil_common::ComponentType;
use vigil_pipeline::{PipelineError, PipelineRuntime, ProjectStatus, RestartReason};
use vigil_registry::Registry;

use crate::error::ClusterError;
use crate::instruction::{Instruction, Op};
use crate::keys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

#[derive(Debug, Clone)]
struct Version {
    base: String,
    current: i64,
}

pub struct ClusterState {
    pub node_id: String,
    registry: Arc<dyn Registry>,
    runtime: Arc<PipelineRuntime>,
    role_tx: watch::Sender<Role>,
    version: Mutex<Version>,
    /// Set while this node (as leader) runs compaction; publishes are
    /// rejected for its duration.
    compacting: AtomicBool,
    /// Set while a leader somewhere runs compaction; syncs short-circuit.
    /// Carries the pre-compaction version from the start broadcast.
    remote_compaction: Mutex<Option<i64>>,
    apply_failures: AtomicU64,
}

impl ClusterState {
    pub fn new(
        node_id: impl Into<String>,
        registry: Arc<dyn Registry>,
        runtime: Arc<PipelineRuntime>,
    ) -> Arc<Self> {
        let (role_tx, _) = watch::channel(Role::Follower);
        Arc::new(Self {
            node_id: node_id.into(),
            registry,
            runtime,
            role_tx,
            version: Mutex::new(Version {
                base: String::new(),
                current: 0,
            }),
            compacting: AtomicBool::new(false),
            remote_compaction: Mutex::new(None),
            apply_failures: AtomicU64::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<PipelineRuntime> {
        &self.runtime
    }

    // ------------------------------------------------------------------
    // Role
    // ------------------------------------------------------------------

    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn set_role(&self, role: Role) {
        let changed = *self.role_tx.borrow() != role;
        if changed {
            info!(node = %self.node_id, role = ?role, "Role changed");
            let _ = self.role_tx.send(role);
        }
    }

    pub fn require_leader(&self) -> Result<(), ClusterError> {
        if self.role() == Role::Leader {
            Ok(())
        } else {
            Err(ClusterError::NotLeader)
        }
    }

    // ------------------------------------------------------------------
    // Log cursor
    // ------------------------------------------------------------------

    pub fn base_version(&self) -> String {
        self.version.lock().expect("version poisoned").base.clone()
    }

    pub fn current_version(&self) -> i64 {
        self.version.lock().expect("version poisoned").current
    }

    /// `<base>.<current>`, the version a node reports in heartbeats.
    pub fn version_string(&self) -> String {
        let version = self.version.lock().expect("version poisoned");
        format!("{}.{}", version.base, version.current)
    }

    pub fn set_current(&self, current: i64) {
        self.version.lock().expect("version poisoned").current = current;
    }

    pub fn set_base(&self, base: &str) {
        let mut version = self.version.lock().expect("version poisoned");
        version.base = base.to_string();
    }

    // ------------------------------------------------------------------
    // Compaction flags
    // ------------------------------------------------------------------

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::SeqCst)
    }

    /// Returns false when a compaction is already running.
    pub fn begin_compaction(&self) -> bool {
        self.compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn end_compaction(&self) {
        self.compacting.store(false, Ordering::SeqCst);
    }

    pub fn set_remote_compaction(&self, original_version: Option<i64>) {
        *self
            .remote_compaction
            .lock()
            .expect("remote compaction poisoned") = original_version;
    }

    pub fn remote_compaction(&self) -> Option<i64> {
        *self
            .remote_compaction
            .lock()
            .expect("remote compaction poisoned")
    }

    pub fn apply_failures(&self) -> u64 {
        self.apply_failures.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Operator intent
    // ------------------------------------------------------------------

    /// Persist the operator's desired state for crash recovery. Intent is
    /// per node: each node re-asserts its own on bootstrap.
    pub async fn record_intent(&self, project_id: &str, running: bool) -> Result<(), ClusterError> {
        let value = if running { "running" } else { "stopped" };
        self.registry
            .hset(&keys::proj_states_key(&self.node_id), project_id, value)
            .await?;
        Ok(())
    }

    pub async fn intent(&self, project_id: &str) -> Result<Option<bool>, ClusterError> {
        let value = self
            .registry
            .hget(&keys::proj_states_key(&self.node_id), project_id)
            .await?;
        Ok(value.map(|v| v == "running"))
    }

    pub async fn clear_intent(&self, project_id: &str) -> Result<(), ClusterError> {
        self.registry
            .hdel(&keys::proj_states_key(&self.node_id), project_id)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Instruction application
    // ------------------------------------------------------------------

    /// Projects that must restart when this component's config changes.
    pub fn affected_projects(&self, component_type: ComponentType, id: &str) -> Vec<String> {
        self.runtime
            .tables()
            .projects_referencing(component_type, id)
    }

    /// Apply one replayed instruction. Failures surface to the caller,
    /// which counts them and keeps going; a bad entry never wedges the
    /// replay.
    pub async fn apply_instruction(
        &self,
        instr: &Instruction,
        reason: RestartReason,
    ) -> Result<(), ClusterError> {
        if instr.version == 0 {
            debug!("Skipping version-0 sentinel instruction");
            return Ok(());
        }
        let tables = self.runtime.tables();
        let ty = instr.component_type;
        let id = instr.component_id.as_str();

        match instr.op {
            op if op.is_definition() => {
                let content = instr.content.as_deref().ok_or_else(|| ClusterError::Apply {
                    version: instr.version,
                    detail: format!("definition of {ty}.{id} carries no content"),
                })?;
                tables.create_memory_only(ty, id, content);
                if ty == ComponentType::Project {
                    self.runtime.ensure_project(id);
                    if self.runtime.project(id)?.status() == ProjectStatus::Running {
                        self.restart_projects(&[id.to_string()], reason).await;
                    }
                } else {
                    let affected = self.affected_projects(ty, id);
                    self.restart_projects(&affected, reason).await;
                }
                Ok(())
            }
            Op::Delete => {
                if ty == ComponentType::Project {
                    self.runtime.delete_project(id).await?;
                    tables.delete_memory_only(ty, id);
                } else {
                    tables.delete_memory_only(ty, id);
                    let affected = if instr.affected_projects.is_empty() {
                        self.affected_projects(ty, id)
                    } else {
                        instr.affected_projects.clone()
                    };
                    self.restart_projects(&affected, reason).await;
                }
                Ok(())
            }
            Op::Start => {
                self.runtime.ensure_project(id);
                // Every node keeps its own intent copy so a failover
                // leader can re-assert it at bootstrap.
                if let Err(e) = self.record_intent(id, true).await {
                    warn!(project = %id, error = %e, "Failed to persist intent");
                }
                ignore_invalid_transition(self.runtime.start_project(id).await)
                    .map_err(|e| apply_error(instr.version, e))
            }
            Op::Stop => {
                if let Err(e) = self.record_intent(id, false).await {
                    warn!(project = %id, error = %e, "Failed to persist intent");
                }
                ignore_invalid_transition(self.runtime.stop_project(id).await)
                    .map_err(|e| apply_error(instr.version, e))
            }
            Op::Restart => self
                .runtime
                .restart_project(id, reason)
                .await
                .map_err(|e| apply_error(instr.version, e)),
            _ => unreachable!("definition ops handled above"),
        }
    }

    /// Restart every named project that is currently running. Stopped
    /// projects pick the new config up on their next start.
    async fn restart_projects(&self, projects: &[String], reason: RestartReason) {
        for project_id in projects {
            let Ok(project) = self.runtime.project(project_id) else {
                continue;
            };
            if project.status() != ProjectStatus::Running {
                continue;
            }
            info!(project = %project_id, "Restarting project for config change");
            if let Err(e) = self.runtime.restart_project(project_id, reason).await {
                warn!(project = %project_id, error = %e, "Config-change restart failed");
            }
        }
    }

    pub(crate) fn count_apply_failure(&self) {
        self.apply_failures.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Session reset
    // ------------------------------------------------------------------

    /// Drop everything local: stop and forget all projects, clear the
    /// component tables, rewind the cursor. Used when the leader session
    /// changes and the node must resync from scratch.
    pub async fn reset_local_state(&self) {
        info!(node = %self.node_id, "Clearing local state for session reset");
        let project_ids: Vec<String> = self
            .runtime
            .snapshots()
            .into_iter()
            .map(|s| s.id)
            .collect();
        for id in project_ids {
            if let Err(e) = self.runtime.delete_project(&id).await {
                warn!(project = %id, error = %e, "Failed to stop project during reset");
            }
        }
        self.runtime.tables().clear();
        self.set_current(0);
    }
}

fn apply_error(version: i64, e: PipelineError) -> ClusterError {
    ClusterError::Apply {
        version,
        detail: e.to_string(),
    }
}

/// Lifecycle replays are idempotent: re-stopping a stopped project (or
/// re-starting a running one) is a no-op, not a failure.
fn ignore_invalid_transition(result: Result<(), PipelineError>) -> Result<(), PipelineError> {
    match result {
        Err(PipelineError::InvalidTransition { id, op, status }) => {
            debug!(project = %id, op, status = %status, "Lifecycle replay was a no-op");
            Ok(())
        }
        other => other,
    }
}
