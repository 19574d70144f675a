use thiserror::Error;

use vigil_pipeline::PipelineError;
use vigil_registry::RegistryError;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("this node is not the leader")]
    NotLeader,

    #[error("compaction in progress; retry the publish")]
    CompactionInProgress,

    #[error("{what} failed verification: {detail}")]
    VerifyRejected { what: String, detail: String },

    #[error("cannot delete {what}: referenced by projects: {projects}")]
    DeleteBlocked { what: String, projects: String },

    #[error("instruction {version} failed to apply: {detail}")]
    Apply { version: i64, detail: String },

    #[error("malformed cluster payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
