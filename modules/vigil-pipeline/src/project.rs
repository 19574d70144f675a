//! Project lifecycle state.
//!
//! Status machine: Stopped ⇄ Starting → Running → Stopping → Stopped, with
//! Error reachable from any non-terminal state and restartable back to
//! Starting. Transitions go through the atomic helper under the state
//! lock; the async lifecycle mutex serializes whole start/stop/restart
//! operations so at most one is in flight per project.

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::PipelineError;
use crate::runtime::OwnedWiring;
use crate::RESTART_COOLDOWN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
            ProjectStatus::Stopping => "stopping",
            ProjectStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a restart was requested; drift-initiated restarts respect the
/// cooldown window, operator ones do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    Operator,
    Drift,
}

#[derive(Debug)]
struct State {
    status: ProjectStatus,
    error: Option<String>,
    owned: OwnedWiring,
    changed_at: DateTime<Utc>,
    last_restart: Option<Instant>,
}

/// Read-only view for status listeners.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSnapshot {
    pub id: String,
    pub status: ProjectStatus,
    pub error: Option<String>,
    pub owned_channels: usize,
    pub changed_at: DateTime<Utc>,
}

pub struct Project {
    pub id: String,
    state: Mutex<State>,
    /// Serializes start/stop/restart; held across the whole operation.
    pub(crate) lifecycle: tokio::sync::Mutex<()>,
}

impl Project {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(State {
                status: ProjectStatus::Stopped,
                error: None,
                owned: OwnedWiring::default(),
                changed_at: Utc::now(),
                last_restart: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn status(&self) -> ProjectStatus {
        self.state.lock().expect("project state poisoned").status
    }

    pub fn snapshot(&self) -> ProjectSnapshot {
        let state = self.state.lock().expect("project state poisoned");
        ProjectSnapshot {
            id: self.id.clone(),
            status: state.status,
            error: state.error.clone(),
            owned_channels: state.owned.channels.len(),
            changed_at: state.changed_at,
        }
    }

    /// Atomic `allowed_from → new` transition.
    pub fn transition(
        &self,
        allowed: &[ProjectStatus],
        new: ProjectStatus,
        op: &'static str,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.lock().expect("project state poisoned");
        if !allowed.contains(&state.status) {
            return Err(PipelineError::InvalidTransition {
                id: self.id.clone(),
                op,
                status: state.status.to_string(),
            });
        }
        state.status = new;
        state.changed_at = Utc::now();
        Ok(())
    }

    pub(crate) fn set_running(&self, owned: OwnedWiring) {
        let mut state = self.state.lock().expect("project state poisoned");
        state.status = ProjectStatus::Running;
        state.error = None;
        state.owned = owned;
        state.changed_at = Utc::now();
    }

    pub(crate) fn set_stopped(&self) {
        let mut state = self.state.lock().expect("project state poisoned");
        state.status = ProjectStatus::Stopped;
        state.owned = OwnedWiring::default();
        state.changed_at = Utc::now();
    }

    pub(crate) fn set_error(&self, error: &str) {
        let mut state = self.state.lock().expect("project state poisoned");
        state.status = ProjectStatus::Error;
        state.error = Some(error.to_string());
        state.owned = OwnedWiring::default();
        state.changed_at = Utc::now();
    }

    pub(crate) fn take_owned(&self) -> OwnedWiring {
        let mut state = self.state.lock().expect("project state poisoned");
        std::mem::take(&mut state.owned)
    }

    pub(crate) fn mark_restarted(&self) {
        self.state.lock().expect("project state poisoned").last_restart = Some(Instant::now());
    }

    pub(crate) fn within_restart_cooldown(&self) -> bool {
        self.state
            .lock()
            .expect("project state poisoned")
            .last_restart
            .map(|at| at.elapsed() < RESTART_COOLDOWN)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_enforce_allowed_sources() {
        let project = Project::new("p1");
        assert_eq!(project.status(), ProjectStatus::Stopped);

        project
            .transition(
                &[ProjectStatus::Stopped, ProjectStatus::Error],
                ProjectStatus::Starting,
                "start",
            )
            .unwrap();
        assert_eq!(project.status(), ProjectStatus::Starting);

        // Starting is not a valid source for another start.
        let err = project
            .transition(
                &[ProjectStatus::Stopped, ProjectStatus::Error],
                ProjectStatus::Starting,
                "start",
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }), "{err}");
    }

    #[test]
    fn error_state_is_restartable() {
        let project = Project::new("p1");
        project.set_error("boom");
        assert_eq!(project.status(), ProjectStatus::Error);
        assert!(project
            .transition(
                &[ProjectStatus::Stopped, ProjectStatus::Error],
                ProjectStatus::Starting,
                "start",
            )
            .is_ok());
    }

    #[test]
    fn cooldown_tracks_recent_restarts() {
        let project = Project::new("p1");
        assert!(!project.within_restart_cooldown());
        project.mark_restarted();
        assert!(project.within_restart_cooldown());
    }
}
