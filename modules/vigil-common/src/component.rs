//! Component identities.
//!
//! Every configurable object in the hub (inputs, outputs, rulesets,
//! plugins, projects) is addressed by `(ComponentType, id)`. Raw configs
//! are replicated under that key; runtime instances resolve through it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The five configurable component kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Input,
    Output,
    Ruleset,
    Plugin,
    Project,
}

impl ComponentType {
    /// Dependency order used by leader bootstrap: definitions before the
    /// projects that reference them.
    pub const BOOTSTRAP_ORDER: [ComponentType; 5] = [
        ComponentType::Input,
        ComponentType::Output,
        ComponentType::Plugin,
        ComponentType::Ruleset,
        ComponentType::Project,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Input => "input",
            ComponentType::Output => "output",
            ComponentType::Ruleset => "ruleset",
            ComponentType::Plugin => "plugin",
            ComponentType::Project => "project",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(ComponentType::Input),
            "output" => Ok(ComponentType::Output),
            "ruleset" => Ok(ComponentType::Ruleset),
            "plugin" => Ok(ComponentType::Plugin),
            "project" => Ok(ComponentType::Project),
            other => Err(format!("unknown component type: {other}")),
        }
    }
}

/// A fully-qualified component reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentKey {
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    pub id: String,
}

impl ComponentKey {
    pub fn new(component_type: ComponentType, id: impl Into<String>) -> Self {
        Self {
            component_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for ComponentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component_type, self.id)
    }
}
