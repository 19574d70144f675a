//! Registry key and topic layout. Everything the cluster persists or
//! broadcasts lives under the `cluster:` prefix.

/// Distributed mutex electing the leader.
pub const LEADER_LOCK: &str = "cluster:leader:lock";

/// Current published log version and the leader-session epoch.
pub const INSTRUCTION_CURRENT: &str = "cluster:instruction:current";
pub const INSTRUCTION_BASE: &str = "cluster:instruction:base";

/// Leader → followers: sync nudges and publish notifications.
pub const TOPIC_SYNC: &str = "cluster:sync_command";

/// Leader broadcast bracketing a compaction run.
pub const TOPIC_COMPACTION: &str = "cluster:compaction";

/// Node heartbeats (every node publishes, leader included).
pub const TOPIC_HEARTBEAT: &str = "cluster:heartbeat";

/// One serialized instruction per version.
pub fn instruction_key(version: i64) -> String {
    format!("cluster:instruction:{version}")
}

/// Everything under the instruction prefix. Matches the current/base keys
/// too, so scans over it must keep only numeric suffixes.
pub const INSTRUCTION_PATTERN: &str = "cluster:instruction:*";

/// Short-TTL flag a follower holds while replaying a batch.
pub fn execution_flag_key(node_id: &str) -> String {
    format!("cluster:execution_flag:{node_id}")
}

pub const EXECUTION_FLAG_PATTERN: &str = "cluster:execution_flag:*";

/// Per-node hash of `project id → "running"|"stopped"` (operator intent).
pub fn proj_states_key(node_id: &str) -> String {
    format!("cluster:proj_states:{node_id}")
}

/// Per-node liveness marker with TTL, for enumeration.
pub fn known_node_key(node_id: &str) -> String {
    format!("cluster:known_nodes:{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_keys_are_versioned() {
        assert_eq!(instruction_key(7), "cluster:instruction:7");
        assert_eq!(execution_flag_key("n1"), "cluster:execution_flag:n1");
        let prefix = INSTRUCTION_PATTERN.trim_end_matches('*');
        assert!(instruction_key(7).starts_with(prefix));
    }
}
