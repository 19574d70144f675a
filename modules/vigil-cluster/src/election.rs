//! Leader election over the registry mutex.
//!
//! Every eligible node runs the same loop: try to take the lease, and on
//! success bootstrap a fresh leader session, then keep renewing. A failed
//! renewal demotes immediately (leader-only duties check the role watch
//! and stop) and the loop goes back to contending on the same cadence.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use vigil_registry::RegistryError;

use crate::error::ClusterError;
use crate::keys::LEADER_LOCK;
use crate::log::InstructionLog;
use crate::state::{ClusterState, Role};
use crate::{LOCK_RENEW_INTERVAL, LOCK_TTL};

pub struct LeaderElection {
    state: Arc<ClusterState>,
    /// Fencing token for this process; a re-elected node gets a new one.
    token: String,
}

impl LeaderElection {
    pub fn new(state: Arc<ClusterState>) -> Self {
        let token = format!("{}:{}", state.node_id, Uuid::new_v4());
        Self { state, token }
    }

    /// One acquisition attempt. On success the node becomes Leader and
    /// bootstraps the instruction log before reporting ready.
    pub async fn try_acquire(&self) -> Result<bool, ClusterError> {
        let acquired = self
            .state
            .registry()
            .lock(LEADER_LOCK, &self.token, LOCK_TTL)
            .await?;
        if !acquired {
            return Ok(false);
        }

        info!(node = %self.state.node_id, "Acquired leader lock");
        self.state.set_role(Role::Leader);
        let log = InstructionLog::new(self.state.clone());
        log.initialize_leader_instructions().await?;
        Ok(true)
    }

    /// One lease renewal. Losing the lease demotes the node immediately
    /// and surfaces as `RegistryError::LockLost`.
    pub async fn renew(&self) -> Result<(), ClusterError> {
        let still_owner = self
            .state
            .registry()
            .extend_lock(LEADER_LOCK, &self.token, LOCK_TTL)
            .await?;
        if !still_owner {
            warn!(node = %self.state.node_id, "Leader lease lost; demoting to follower");
            self.state.set_role(Role::Follower);
            return Err(RegistryError::LockLost(LEADER_LOCK.to_string()).into());
        }
        Ok(())
    }

    /// Release the lease deliberately (clean shutdown).
    pub async fn resign(&self) {
        if self.state.role() == Role::Leader {
            self.state.set_role(Role::Follower);
            if let Err(e) = self
                .state
                .registry()
                .unlock(LEADER_LOCK, &self.token)
                .await
            {
                warn!(error = %e, "Failed to release leader lock");
            }
        }
    }

    /// The long-running election loop: contend every renewal interval;
    /// while leading, renew on the same cadence.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.state.role() {
                    Role::Follower => match self.try_acquire().await {
                        Ok(true) => {}
                        Ok(false) => sleep(LOCK_RENEW_INTERVAL).await,
                        Err(e) => {
                            warn!(error = %e, "Leader acquisition failed");
                            sleep(LOCK_RENEW_INTERVAL).await;
                        }
                    },
                    Role::Leader => {
                        sleep(LOCK_RENEW_INTERVAL).await;
                        match self.renew().await {
                            Ok(()) => {}
                            // Already demoted inside renew; go contend again.
                            Err(ClusterError::Registry(RegistryError::LockLost(_))) => {}
                            Err(e) => {
                                // Registry unreachable: fail safe and demote.
                                warn!(error = %e, "Lease renewal errored; demoting");
                                self.state.set_role(Role::Follower);
                            }
                        }
                    }
                }
            }
        })
    }
}
