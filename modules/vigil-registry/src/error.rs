use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry connection error: {0}")]
    Connection(String),

    #[error("registry command error: {0}")]
    Command(String),

    #[error("lock no longer held: {0}")]
    LockLost(String),
}

impl From<redis::RedisError> for RegistryError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            RegistryError::Connection(err.to_string())
        } else {
            RegistryError::Command(err.to_string())
        }
    }
}
