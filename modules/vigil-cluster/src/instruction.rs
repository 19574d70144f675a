//! Instructions: the versioned operations the leader appends and
//! followers replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_common::ComponentType;

/// Operations carried by the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Add,
    Update,
    Delete,
    /// Definition pushed from a local draft.
    LocalPush,
    /// Definition pushed from an external change feed.
    PushChange,
    Start,
    Stop,
    Restart,
}

impl Op {
    /// Ops that define or replace a component's raw config.
    pub fn is_definition(&self) -> bool {
        matches!(self, Op::Add | Op::Update | Op::LocalPush | Op::PushChange)
    }

    /// Project lifecycle ops.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Op::Start | Op::Stop | Op::Restart)
    }
}

/// One log entry. Version 0 is the do-not-apply sentinel used while the
/// log is being bootstrapped or compacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub version: i64,
    pub component_type: ComponentType,
    pub component_id: String,
    pub op: Op,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Projects the applier must restart, recorded by the leader for
    /// deletes so followers need not recompute references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_projects: Vec<String>,
    pub ts: DateTime<Utc>,
    pub requires_restart: bool,
}

impl Instruction {
    pub fn definition(
        version: i64,
        component_type: ComponentType,
        component_id: impl Into<String>,
        op: Op,
        content: impl Into<String>,
    ) -> Self {
        Self {
            version,
            component_type,
            component_id: component_id.into(),
            op,
            content: Some(content.into()),
            affected_projects: Vec::new(),
            ts: Utc::now(),
            requires_restart: true,
        }
    }

    pub fn lifecycle(version: i64, project_id: impl Into<String>, op: Op) -> Self {
        Self {
            version,
            component_type: ComponentType::Project,
            component_id: project_id.into(),
            op,
            content: None,
            affected_projects: Vec::new(),
            ts: Utc::now(),
            requires_restart: false,
        }
    }

    pub fn delete(
        version: i64,
        component_type: ComponentType,
        component_id: impl Into<String>,
        affected_projects: Vec<String>,
    ) -> Self {
        Self {
            version,
            component_type,
            component_id: component_id.into(),
            op: Op::Delete,
            content: None,
            affected_projects,
            ts: Utc::now(),
            requires_restart: true,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("instruction serialization cannot fail")
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let instr = Instruction::definition(
            3,
            ComponentType::Ruleset,
            "rs1",
            Op::Update,
            "<root/>",
        );
        let again = Instruction::from_json(&instr.to_json()).unwrap();
        assert_eq!(instr, again);
        assert!(again.requires_restart);
    }

    #[test]
    fn lifecycle_ops_do_not_require_restart() {
        let instr = Instruction::lifecycle(9, "p1", Op::Start);
        assert!(!instr.requires_restart);
        assert!(instr.op.is_lifecycle());
        assert!(!instr.op.is_definition());
    }

    #[test]
    fn op_names_are_snake_case_on_the_wire() {
        let instr = Instruction::definition(1, ComponentType::Input, "i", Op::LocalPush, "x");
        assert!(instr.to_json().contains(r#""op":"local_push""#));
    }
}
