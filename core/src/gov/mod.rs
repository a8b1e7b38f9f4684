//! Graph-of-verification
//!
//! A small DAG of premises and claims. Premise-like nodes may carry a PCN
//! id that must be verified; a claim fails when any parent failed.
//! Structural validation (types, edge references, acyclicity, supported
//! claims) runs before evaluation, and failures surface as verifier
//! issues.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::pcn::PcnStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Premise,
    Claim,
    Calculation,
    Evidence,
    Observation,
}

impl NodeType {
    fn requires_pcn_check(&self) -> bool {
        !matches!(self, Self::Claim)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub text: Option<String>,
    /// PCN id this node depends on, if any.
    #[serde(default)]
    pub pcn: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dag {
    #[serde(default)]
    pub nodes: Vec<DagNode>,
    #[serde(default)]
    pub edges: Vec<DagEdge>,
}

fn detect_cycles(adjacency: &HashMap<&str, Vec<&str>>) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn dfs<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        failures: &mut Vec<String>,
    ) {
        match marks.get(node) {
            Some(Mark::Done) => return,
            Some(Mark::Visiting) => {
                failures.push(format!("cycle:{node}"));
                return;
            }
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for next in adjacency.get(node).into_iter().flatten() {
            dfs(next, adjacency, marks, failures);
        }
        marks.insert(node, Mark::Done);
    }

    let mut marks = HashMap::new();
    let mut failures = Vec::new();
    for node in adjacency.keys() {
        dfs(node, adjacency, &mut marks, &mut failures);
    }
    failures
}

/// Structural validation: edge references, claim support, acyclicity.
pub fn validate_dag(dag: &Dag) -> (bool, Vec<String>) {
    let node_ids: HashSet<&str> = dag.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut failing: Vec<String> = Vec::new();

    for edge in &dag.edges {
        if !node_ids.contains(edge.from.as_str()) {
            failing.push(format!("missing_node:{}", edge.from));
        }
        if !node_ids.contains(edge.to.as_str()) {
            failing.push(format!("missing_node:{}", edge.to));
        }
    }

    let mut incoming: HashMap<&str, usize> = HashMap::new();
    for edge in &dag.edges {
        *incoming.entry(edge.to.as_str()).or_insert(0) += 1;
    }
    for node in &dag.nodes {
        if node.node_type == NodeType::Claim && incoming.get(node.id.as_str()).copied().unwrap_or(0) == 0
        {
            failing.push(format!("unsupported_claim:{}", node.id));
        }
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for id in &node_ids {
        adjacency.entry(id).or_default();
    }
    for edge in &dag.edges {
        if node_ids.contains(edge.from.as_str()) && node_ids.contains(edge.to.as_str()) {
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }
    }
    failing.extend(detect_cycles(&adjacency));

    // Dedup while preserving first-seen order.
    let mut seen = HashSet::new();
    failing.retain(|f| seen.insert(f.clone()));
    (failing.is_empty(), failing)
}

/// Evaluate a DAG in topological order against PCN status.
///
/// Failing reasons: `pcn_failure:<node>`, `dependency_failure:<node>`,
/// plus any structural validation failures.
pub fn evaluate_dag<F>(dag: &Dag, pcn_status: F) -> (bool, Vec<String>)
where
    F: Fn(&str) -> Option<PcnStatus>,
{
    let (valid, validation_failures) = validate_dag(dag);
    if !valid {
        return (false, validation_failures);
    }

    let node_map: HashMap<&str, &DagNode> =
        dag.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut indegree: HashMap<&str, usize> =
        node_map.keys().map(|id| (*id, 0usize)).collect();
    for edge in &dag.edges {
        parents.entry(edge.to.as_str()).or_default().push(edge.from.as_str());
        children.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut failures = Vec::new();
    let mut failed_nodes: HashSet<&str> = HashSet::new();

    while let Some(node_id) = queue.pop_front() {
        let node = node_map[node_id];
        if node.node_type.requires_pcn_check() {
            if let Some(pcn_id) = &node.pcn {
                if pcn_status(pcn_id) != Some(PcnStatus::Verified) {
                    failures.push(format!("pcn_failure:{node_id}"));
                    failed_nodes.insert(node_id);
                }
            }
        } else {
            let parent_failed = parents
                .get(node_id)
                .into_iter()
                .flatten()
                .any(|p| failed_nodes.contains(p));
            if parent_failed {
                failures.push(format!("dependency_failure:{node_id}"));
                failed_nodes.insert(node_id);
            }
        }
        for child in children.get(node_id).into_iter().flatten() {
            let deg = indegree.get_mut(child).expect("child indexed");
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(child);
            }
        }
    }

    (failures.is_empty(), failures)
}
