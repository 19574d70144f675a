//! Project-node sequences: the edge identity.
//!
//! A PNS is the deterministic concatenation of the walk from an originating
//! input to an edge's head, e.g. `INPUT.in1->RULESET.rs1->OUTPUT.out1`.
//! It deliberately carries no project name: two projects whose walks
//! coincide produce the same PNS and therefore share the channel and the
//! component instance at both ends.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::edge::NodeRef;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pns(String);

impl Pns {
    /// The walk's origin: an input vertex.
    pub fn root(node: &NodeRef) -> Self {
        Self(node.to_string())
    }

    /// Extend the walk across one edge to `node`.
    pub fn extend(&self, node: &NodeRef) -> Self {
        Self(format!("{}->{node}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Pns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::NodeKind;

    #[test]
    fn composition_is_deterministic() {
        let input = NodeRef::new(NodeKind::Input, "in1");
        let ruleset = NodeRef::new(NodeKind::Ruleset, "rs1");
        let output = NodeRef::new(NodeKind::Output, "out1");

        let pns = Pns::root(&input).extend(&ruleset).extend(&output);
        assert_eq!(pns.as_str(), "INPUT.in1->RULESET.rs1->OUTPUT.out1");

        // Same walk, same identity.
        let again = Pns::root(&input).extend(&ruleset).extend(&output);
        assert_eq!(pns, again);
    }
}
