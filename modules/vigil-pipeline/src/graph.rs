//! The pipeline builder: turn a parsed project spec into a plan of PNS
//! channels and endpoint bindings. Pure in-memory; the runtime executes
//! the plan.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::edge::{AdapterErrorPolicy, NodeKind, NodeRef, ProjectSpec};
use crate::error::BuildError;
use crate::pns::Pns;

/// An input endpoint: publishes to one channel per outbound edge.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub id: String,
    pub out_edges: Vec<Pns>,
}

/// A ruleset endpoint, keyed by the PNS of its inbound edge. Consumes that
/// channel and fans emitted events out to every outbound edge.
#[derive(Debug, Clone, PartialEq)]
pub struct RulesetBinding {
    pub id: String,
    pub node_pns: Pns,
    pub out_edges: Vec<Pns>,
}

/// An output endpoint, keyed by the PNS of its inbound edge.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBinding {
    pub id: String,
    pub node_pns: Pns,
}

/// Executable form of a project graph.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    pub inputs: Vec<InputBinding>,
    pub rulesets: Vec<RulesetBinding>,
    pub outputs: Vec<OutputBinding>,
    /// Every channel the project will hold a reference on.
    pub channels: Vec<Pns>,
    pub policy: AdapterErrorPolicy,
}

/// Build the plan. `exists` answers whether a referenced component is
/// defined; unknown components fail the build.
pub fn build(
    spec: &ProjectSpec,
    exists: impl Fn(NodeKind, &str) -> bool,
) -> Result<GraphPlan, BuildError> {
    for node in spec.nodes() {
        if !exists(node.kind, &node.id) {
            return Err(BuildError::UnknownComponent {
                kind: node.kind.to_string(),
                id: node.id,
            });
        }
    }

    let adjacency = adjacency(spec);
    detect_cycles(spec, &adjacency)?;

    let mut inputs: Vec<InputBinding> = Vec::new();
    let mut rulesets: Vec<RulesetBinding> = Vec::new();
    let mut outputs: Vec<OutputBinding> = Vec::new();
    let mut channels: Vec<Pns> = Vec::new();
    let mut visited_edges: HashSet<(NodeRef, NodeRef)> = HashSet::new();

    // Walk each input's reachable subgraph, composing PNS prefixes.
    let mut queue: VecDeque<(NodeRef, Pns)> = VecDeque::new();
    for node in spec.nodes() {
        if node.kind == NodeKind::Input {
            queue.push_back((node.clone(), Pns::root(&node)));
        }
    }

    while let Some((node, node_pns)) = queue.pop_front() {
        let dests = adjacency.get(&node).cloned().unwrap_or_default();
        let mut out_edges = Vec::with_capacity(dests.len());
        for dest in &dests {
            let edge_pns = node_pns.extend(dest);
            visited_edges.insert((node.clone(), dest.clone()));
            channels.push(edge_pns.clone());
            out_edges.push(edge_pns.clone());
            match dest.kind {
                NodeKind::Ruleset => queue.push_back((dest.clone(), edge_pns)),
                NodeKind::Output => outputs.push(OutputBinding {
                    id: dest.id.clone(),
                    node_pns: edge_pns,
                }),
                NodeKind::Input => unreachable!("validated at parse time"),
            }
        }
        match node.kind {
            NodeKind::Input => inputs.push(InputBinding {
                id: node.id.clone(),
                out_edges,
            }),
            NodeKind::Ruleset => rulesets.push(RulesetBinding {
                id: node.id.clone(),
                node_pns,
                out_edges,
            }),
            NodeKind::Output => unreachable!("outputs have no outbound edges"),
        }
    }

    // Every configured edge must sit on a walk from some input.
    for (edge, line) in spec.edges.iter().zip(&spec.edge_lines) {
        if !visited_edges.contains(&(edge.from.clone(), edge.to.clone())) {
            return Err(BuildError::InvalidEdge {
                line: *line,
                reason: format!("edge unreachable from any input: {edge}"),
            });
        }
    }

    Ok(GraphPlan {
        inputs,
        rulesets,
        outputs,
        channels,
        policy: spec.on_adapter_error,
    })
}

fn adjacency(spec: &ProjectSpec) -> HashMap<NodeRef, Vec<NodeRef>> {
    let mut map: HashMap<NodeRef, Vec<NodeRef>> = HashMap::new();
    for edge in &spec.edges {
        map.entry(edge.from.clone())
            .or_default()
            .push(edge.to.clone());
    }
    map
}

/// Reject cyclic graphs. Only ruleset→ruleset edges can close a cycle;
/// inputs have no inbound and outputs no outbound edges.
fn detect_cycles(
    spec: &ProjectSpec,
    adjacency: &HashMap<NodeRef, Vec<NodeRef>>,
) -> Result<(), BuildError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        node: &NodeRef,
        adjacency: &HashMap<NodeRef, Vec<NodeRef>>,
        marks: &mut HashMap<NodeRef, Mark>,
    ) -> Result<(), BuildError> {
        match marks.get(node) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(BuildError::Cycle {
                    at: node.to_string(),
                })
            }
            None => {}
        }
        marks.insert(node.clone(), Mark::Visiting);
        for dest in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
            visit(dest, adjacency, marks)?;
        }
        marks.insert(node.clone(), Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    for node in spec.nodes() {
        visit(&node, adjacency, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(text: &str) -> Result<GraphPlan, BuildError> {
        let spec = ProjectSpec::parse(text)?;
        build(&spec, |_, _| true)
    }

    #[test]
    fn two_hop_plan_has_expected_pns() {
        let plan = plan("INPUT.in1 -> RULESET.rs1\nRULESET.rs1 -> OUTPUT.out1").unwrap();
        assert_eq!(plan.inputs.len(), 1);
        assert_eq!(plan.inputs[0].out_edges[0].as_str(), "INPUT.in1->RULESET.rs1");
        assert_eq!(plan.rulesets.len(), 1);
        assert_eq!(
            plan.rulesets[0].out_edges[0].as_str(),
            "INPUT.in1->RULESET.rs1->OUTPUT.out1"
        );
        assert_eq!(plan.outputs.len(), 1);
        assert_eq!(plan.channels.len(), 2);
    }

    #[test]
    fn unknown_components_fail() {
        let spec = ProjectSpec::parse("INPUT.in1 -> OUTPUT.out1").unwrap();
        let err = build(&spec, |kind, _| kind != NodeKind::Output).unwrap_err();
        assert!(matches!(err, BuildError::UnknownComponent { .. }), "{err}");
    }

    #[test]
    fn converging_paths_get_distinct_instances() {
        // Two inputs into the same ruleset: two node PNS, two bindings.
        let plan = plan(
            "INPUT.a -> RULESET.r\nINPUT.b -> RULESET.r\nRULESET.r -> OUTPUT.o",
        )
        .unwrap();
        assert_eq!(plan.rulesets.len(), 2);
        assert_eq!(plan.outputs.len(), 2);
        let mut node_pns: Vec<_> = plan
            .rulesets
            .iter()
            .map(|r| r.node_pns.as_str().to_string())
            .collect();
        node_pns.sort();
        assert_eq!(node_pns, vec!["INPUT.a->RULESET.r", "INPUT.b->RULESET.r"]);
    }

    #[test]
    fn ruleset_cycles_are_rejected() {
        let err = plan(
            "INPUT.i -> RULESET.a\nRULESET.a -> RULESET.b\nRULESET.b -> RULESET.a\nRULESET.a -> OUTPUT.o",
        )
        .unwrap_err();
        assert!(matches!(err, BuildError::Cycle { .. }), "{err}");
    }

    #[test]
    fn unreachable_edges_are_rejected() {
        let err = plan("INPUT.i -> OUTPUT.o\nRULESET.x -> OUTPUT.o").unwrap_err();
        match err {
            BuildError::InvalidEdge { line, ref reason } => {
                assert_eq!(line, 2);
                assert!(reason.contains("unreachable"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
