//! Node-level configuration from environment variables.

use std::env;

use uuid::Uuid;

use crate::error::ConfigError;

/// Per-process settings. Everything pipeline-related is replicated through
/// the cluster instead; this covers only what a node needs before it joins.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable node identity. `NODE_ID` env, or generated on first boot.
    pub node_id: String,

    /// Registry (Redis) connection string.
    pub redis_url: String,
}

impl NodeConfig {
    /// Load from environment. `NODE_ID` defaults to `node-<short uuid>`;
    /// `REDIS_URL` defaults to a local instance.
    pub fn from_env() -> Result<Self, ConfigError> {
        let node_id = match env::var("NODE_ID") {
            Ok(id) if !id.trim().is_empty() => id,
            _ => format!("node-{}", &Uuid::new_v4().to_string()[..8]),
        };
        if node_id.contains(':') || node_id.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                name: "NODE_ID",
                value: node_id,
            });
        }

        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        Ok(Self { node_id, redis_url })
    }
}
