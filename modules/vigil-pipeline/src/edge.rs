//! Project configs: plaintext edge lists.
//!
//! One edge per line, `TYPE.id -> TYPE.id`. Blank lines and `#` comments
//! are ignored. `#!` lines carry per-project options, currently only
//! `#! on_adapter_error: fail|degrade`.

use std::fmt;
use std::str::FromStr;

use crate::error::BuildError;

/// Vertex kinds allowed in project graphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKind {
    Input,
    Ruleset,
    Output,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Input => "INPUT",
            NodeKind::Ruleset => "RULESET",
            NodeKind::Output => "OUTPUT",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPUT" => Ok(NodeKind::Input),
            "RULESET" => Ok(NodeKind::Ruleset),
            "OUTPUT" => Ok(NodeKind::Output),
            other => Err(format!("unknown vertex type: {other}")),
        }
    }
}

/// A vertex reference: `INPUT.in1`, `RULESET.rs1`, `OUTPUT.out1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub id: String,
}

impl NodeRef {
    pub fn new(kind: NodeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: NodeRef,
    pub to: NodeRef,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// What a project does when an adapter cannot reach its external system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterErrorPolicy {
    /// Refuse to start with a broken adapter; runtime failures still
    /// degrade with bounded retries.
    #[default]
    Fail,
    /// Start anyway; the adapter keeps retrying in the background.
    Degrade,
}

/// A parsed project config.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectSpec {
    pub edges: Vec<Edge>,
    /// Source line of each edge, parallel to `edges`, for diagnostics.
    pub edge_lines: Vec<usize>,
    pub on_adapter_error: AdapterErrorPolicy,
}

impl ProjectSpec {
    pub fn parse(text: &str) -> Result<Self, BuildError> {
        let mut edges: Vec<Edge> = Vec::new();
        let mut edge_lines: Vec<usize> = Vec::new();
        let mut policy = AdapterErrorPolicy::default();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(option) = line.strip_prefix("#!") {
                policy = parse_option(option).map_err(|reason| BuildError::InvalidEdge {
                    line: line_no,
                    reason,
                })?;
                continue;
            }
            if line.starts_with('#') {
                continue;
            }

            let edge = parse_edge(line).map_err(|reason| BuildError::InvalidEdge {
                line: line_no,
                reason,
            })?;
            if edge.to.kind == NodeKind::Input {
                return Err(BuildError::InvalidEdge {
                    line: line_no,
                    reason: format!("INPUT cannot be a destination: {edge}"),
                });
            }
            if edge.from.kind == NodeKind::Output {
                return Err(BuildError::InvalidEdge {
                    line: line_no,
                    reason: format!("OUTPUT cannot be a source: {edge}"),
                });
            }
            if edges.contains(&edge) {
                return Err(BuildError::DuplicateEdge {
                    edge: edge.to_string(),
                });
            }
            edges.push(edge);
            edge_lines.push(line_no);
        }

        if edges.is_empty() {
            return Err(BuildError::InvalidEdge {
                line: 1,
                reason: "project has no edges".to_string(),
            });
        }
        Ok(Self {
            edges,
            edge_lines,
            on_adapter_error: policy,
        })
    }

    /// Every vertex the project references, deduplicated.
    pub fn nodes(&self) -> Vec<NodeRef> {
        let mut nodes: Vec<NodeRef> = Vec::new();
        for edge in &self.edges {
            for node in [&edge.from, &edge.to] {
                if !nodes.contains(node) {
                    nodes.push(node.clone());
                }
            }
        }
        nodes
    }

    pub fn references(&self, kind: NodeKind, id: &str) -> bool {
        self.edges
            .iter()
            .flat_map(|e| [&e.from, &e.to])
            .any(|n| n.kind == kind && n.id == id)
    }
}

fn parse_edge(line: &str) -> Result<Edge, String> {
    let (lhs, rhs) = line
        .split_once("->")
        .ok_or_else(|| format!("expected `TYPE.id -> TYPE.id`, got: {line}"))?;
    if rhs.contains("->") {
        return Err(format!("more than one arrow on a line: {line}"));
    }
    Ok(Edge {
        from: parse_node(lhs.trim())?,
        to: parse_node(rhs.trim())?,
    })
}

fn parse_node(token: &str) -> Result<NodeRef, String> {
    let (kind, id) = token
        .split_once('.')
        .ok_or_else(|| format!("expected TYPE.id, got: {token}"))?;
    let kind: NodeKind = kind.parse()?;
    let id = id.trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(format!("invalid component id: {token}"));
    }
    Ok(NodeRef::new(kind, id))
}

fn parse_option(option: &str) -> Result<AdapterErrorPolicy, String> {
    let option = option.trim();
    match option.split_once(':') {
        Some(("on_adapter_error", value)) => match value.trim() {
            "fail" => Ok(AdapterErrorPolicy::Fail),
            "degrade" => Ok(AdapterErrorPolicy::Degrade),
            other => Err(format!("on_adapter_error must be fail or degrade, got {other}")),
        },
        _ => Err(format!("unknown project option: {option}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_two_hop_project() {
        let spec = ProjectSpec::parse(
            "# detection pipeline\nINPUT.in1 -> RULESET.rs1\nRULESET.rs1 -> OUTPUT.out1\n",
        )
        .unwrap();
        assert_eq!(spec.edges.len(), 2);
        assert_eq!(spec.edges[0].from, NodeRef::new(NodeKind::Input, "in1"));
        assert_eq!(spec.on_adapter_error, AdapterErrorPolicy::Fail);
    }

    #[test]
    fn rejects_input_as_destination() {
        let err = ProjectSpec::parse("RULESET.rs1 -> INPUT.in1").unwrap_err();
        assert!(matches!(err, BuildError::InvalidEdge { line: 1, .. }), "{err}");
    }

    #[test]
    fn rejects_output_as_source() {
        let err = ProjectSpec::parse("OUTPUT.out1 -> RULESET.rs1").unwrap_err();
        assert!(matches!(err, BuildError::InvalidEdge { .. }), "{err}");
    }

    #[test]
    fn rejects_duplicate_edges() {
        let err =
            ProjectSpec::parse("INPUT.a -> OUTPUT.b\nINPUT.a -> OUTPUT.b").unwrap_err();
        assert!(matches!(err, BuildError::DuplicateEdge { .. }), "{err}");
    }

    #[test]
    fn rejects_malformed_tokens() {
        for bad in [
            "INPUT.in1 OUTPUT.out1",
            "WIDGET.x -> OUTPUT.y",
            "INPUT. -> OUTPUT.y",
            "INPUT.a -> RULESET.b -> OUTPUT.c",
        ] {
            let err = ProjectSpec::parse(bad).unwrap_err();
            assert!(matches!(err, BuildError::InvalidEdge { .. }), "{bad}: {err}");
        }
    }

    #[test]
    fn option_lines_set_policy() {
        let spec = ProjectSpec::parse(
            "#! on_adapter_error: degrade\nINPUT.a -> OUTPUT.b\n",
        )
        .unwrap();
        assert_eq!(spec.on_adapter_error, AdapterErrorPolicy::Degrade);

        assert!(ProjectSpec::parse("#! on_adapter_error: maybe\nINPUT.a -> OUTPUT.b").is_err());
    }

    #[test]
    fn empty_projects_are_rejected() {
        assert!(ProjectSpec::parse("# nothing here\n").is_err());
    }
}
