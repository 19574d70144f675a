use thiserror::Error;

/// Failures constructing a project's graph. Projects that fail to build
/// transition to Error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BuildError {
    #[error("unknown component: {kind}.{id}")]
    UnknownComponent { kind: String, id: String },

    #[error("invalid edge at line {line}: {reason}")]
    InvalidEdge { line: usize, reason: String },

    #[error("duplicate edge: {edge}")]
    DuplicateEdge { edge: String },

    #[error("cycle detected at {at}")]
    Cycle { at: String },
}

/// Adapter-level failures (inputs and outputs).
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{kind} {id}: cannot reach external system: {detail}")]
    Connectivity {
        kind: &'static str,
        id: String,
        detail: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("write failed after retries: {0}")]
    WriteFailed(String),

    #[error("{kind} support not compiled into this build")]
    Unsupported { kind: &'static str },
}

/// Umbrella error for project lifecycle operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("{what} failed verification: {detail}")]
    Verify { what: String, detail: String },

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("project {id}: cannot {op} while {status}")]
    InvalidTransition {
        id: String,
        op: &'static str,
        status: String,
    },
}
