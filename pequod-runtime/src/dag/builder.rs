//! Validates a rendered graph's node specs and builds the adjacency lists
//! the executor drives: within the node-count cap, unique ids, resolvable
//! dependencies, acyclic.
use std::collections::{BTreeMap, BTreeSet};

use pequod_core::graph::{NodeSpec, MAX_NODES};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("graph has {0} nodes, exceeding the maximum of {max}", max = MAX_NODES)]
    TooManyNodes(usize),
    #[error("duplicate node id {0:?}")]
    DuplicateId(String),
    #[error("node {node:?} depends on unknown node {dependency:?}")]
    UnknownDependency { node: String, dependency: String },
    #[error("cycle detected involving nodes {0:?}")]
    Cycle(Vec<String>),
}

/// A validated, immutable dependency graph over a set of node ids.
#[derive(Debug)]
pub struct Dag {
    nodes: BTreeMap<String, NodeSpec>,
    /// node id -> ids it depends on.
    forward: BTreeMap<String, BTreeSet<String>>,
    /// node id -> ids that depend on it.
    reverse: BTreeMap<String, BTreeSet<String>>,
}

impl Dag {
    /// Build and validate a [`Dag`] from the rendered graph's node specs.
    pub fn build(nodes: Vec<NodeSpec>) -> Result<Self, BuildError> {
        if nodes.len() > MAX_NODES {
            return Err(BuildError::TooManyNodes(nodes.len()));
        }
        let mut by_id = BTreeMap::new();
        for node in nodes {
            let id = node.id.clone();
            if by_id.insert(id.clone(), node).is_some() {
                return Err(BuildError::DuplicateId(id));
            }
        }

        for (id, node) in &by_id {
            for dep in &node.depends_on {
                if !by_id.contains_key(dep) {
                    return Err(BuildError::UnknownDependency { node: id.clone(), dependency: dep.clone() });
                }
            }
        }

        let forward: BTreeMap<String, BTreeSet<String>> =
            by_id.iter().map(|(id, node)| (id.clone(), node.depends_on.clone())).collect();

        let mut reverse: BTreeMap<String, BTreeSet<String>> = by_id.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        for (id, deps) in &forward {
            for dep in deps {
                reverse.entry(dep.clone()).or_default().insert(id.clone());
            }
        }

        detect_cycle(&forward)?;

        Ok(Self { nodes: by_id, forward, reverse })
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &str> {
        self.forward.get(id).into_iter().flatten().map(String::as_str)
    }

    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &str> {
        self.reverse.get(id).into_iter().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Duplicate ids were already rejected above, so `forward`'s ids are
/// distinct; a DFS with a recursion stack finds the first cycle, reported in
/// discovery order (which includes both offending ids for a length-2 cycle).
fn detect_cycle(forward: &BTreeMap<String, BTreeSet<String>>) -> Result<(), BuildError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        id: &'a str,
        forward: &'a BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), BuildError> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == id).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                return Err(BuildError::Cycle(cycle));
            }
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(deps) = forward.get(id) {
            for dep in deps {
                visit(dep, forward, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        Ok(())
    }

    for id in forward.keys() {
        visit(id, forward, &mut marks, &mut stack)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pequod_core::graph::{ApplyPolicy, NodeObject};
    use serde_json::json;

    fn node(id: &str, deps: &[&str]) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            object: NodeObject {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                namespace: Some("default".into()),
                name: id.to_string(),
                body: json!({}),
            },
            apply_policy: ApplyPolicy::default(),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            ready_when: Vec::new(),
        }
    }

    #[test]
    fn builds_a_linear_chain() {
        let dag = Dag::build(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]).unwrap();
        assert_eq!(dag.len(), 3);
        assert_eq!(dag.dependencies("b").collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(dag.dependents("a").collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = Dag::build(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert_eq!(err, BuildError::DuplicateId("a".into()));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = Dag::build(vec![node("a", &["missing"])]).unwrap_err();
        assert_eq!(err, BuildError::UnknownDependency { node: "a".into(), dependency: "missing".into() });
    }

    #[test]
    fn rejects_a_two_cycle() {
        let err = Dag::build(vec![node("a", &["b"]), node("b", &["a"])]).unwrap_err();
        match err {
            BuildError::Cycle(ids) => {
                assert!(ids.contains(&"a".to_string()));
                assert!(ids.contains(&"b".to_string()));
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn single_node_graph_builds() {
        let dag = Dag::build(vec![node("only", &[])]).unwrap();
        assert_eq!(dag.len(), 1);
    }

    #[test]
    fn a_graph_at_the_node_cap_builds_as_a_deep_chain() {
        let ids: Vec<String> = (0..MAX_NODES).map(|i| format!("n{i}")).collect();
        let nodes: Vec<NodeSpec> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| match i.checked_sub(1) {
                Some(prev) => node(id, &[&ids[prev]]),
                None => node(id, &[]),
            })
            .collect();
        let dag = Dag::build(nodes).unwrap();
        assert_eq!(dag.len(), MAX_NODES);
    }

    #[test]
    fn rejects_a_graph_over_the_node_cap() {
        let nodes: Vec<NodeSpec> = (0..MAX_NODES + 1).map(|i| node(&format!("n{i}"), &[])).collect();
        let err = Dag::build(nodes).unwrap_err();
        assert_eq!(err, BuildError::TooManyNodes(MAX_NODES + 1));
    }
}
