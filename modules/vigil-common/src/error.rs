use thiserror::Error;

/// Failures reading fields out of an event.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EventError {
    #[error("field not present: {field}")]
    FieldMissing { field: String },

    #[error("field {field} is not a {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Failures resolving node-level configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}
