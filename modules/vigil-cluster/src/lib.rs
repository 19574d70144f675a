//! The cluster layer: one Leader owns configuration, Followers converge.
//!
//! Changes flow through a single authoritative path: the Leader verifies a
//! change, appends it to the versioned instruction log in the registry,
//! and broadcasts a sync notification. Followers replay entries in order,
//! at most once each, and clear their whole local state when the leader
//! session (`base_version`) changes. The compaction controller folds the
//! log to its minimal equivalent while followers are quiesced.

pub mod compact;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod instruction;
pub mod keys;
pub mod log;
pub mod state;
pub mod sync;

use std::time::Duration;

pub use compact::{CompactionController, CompactionStats};
pub use election::LeaderElection;
pub use error::ClusterError;
pub use heartbeat::{Heartbeat, HeartbeatService, NodeTable};
pub use instruction::{Instruction, Op};
pub use log::InstructionLog;
pub use state::{ClusterState, Role};
pub use sync::{SyncOrigin, SyncService};

/// Leader lease: TTL and renewal cadence. Losing a renewal demotes the
/// node immediately; the lease expiring lets another node take over.
pub const LOCK_TTL: Duration = Duration::from_secs(60);
pub const LOCK_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Heartbeat cadence and the silence window after which a node is
/// considered offline and pruned.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const OFFLINE_TTL: Duration = Duration::from_secs(120);

/// Execution flag: held by a follower while it replays a batch.
pub const EXECUTION_FLAG_TTL: Duration = Duration::from_secs(30);

/// Compaction triggers opportunistically once the log reaches this many
/// entries, and waits at most this long for followers to go idle.
pub const COMPACTION_THRESHOLD: i64 = 500;
pub const FOLLOWER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback self-sync cadence on followers, independent of nudges.
pub const PERIODIC_SYNC_INTERVAL: Duration = Duration::from_secs(15);
