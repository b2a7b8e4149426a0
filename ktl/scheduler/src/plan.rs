//! DAG construction and validation (`spec.md` §4.1 "Graph semantics").

use std::collections::HashMap;

use ktl_protocol::{NodeId, RunCommand, RunNode};
use petgraph::{algo::toposort, graph::NodeIndex, Direction};

use crate::error::SchedulerError;

/// The validated dependency graph for one run. For `apply`, edges run
/// `needs -> node`; for `delete` they are reversed so a release is only
/// deleted once its dependents are gone.
pub struct PlanGraph {
    graph: petgraph::graph::DiGraph<NodeId, ()>,
    index_of: HashMap<NodeId, NodeIndex>,
}

impl PlanGraph {
    pub fn build(nodes: &[RunNode], command: RunCommand) -> Result<Self, SchedulerError> {
        let mut graph = petgraph::graph::DiGraph::new();
        let mut index_of = HashMap::with_capacity(nodes.len());

        for node in nodes {
            let idx = graph.add_node(node.id.clone());
            index_of.insert(node.id.clone(), idx);
        }

        for node in nodes {
            let node_idx = index_of[&node.id];
            for needed in &node.needs {
                let Some(&needed_idx) = index_of.get(needed) else {
                    return Err(SchedulerError::InvalidPlan(format!(
                        "node {} needs unknown node {needed}",
                        node.id
                    )));
                };
                match command {
                    RunCommand::Apply => graph.add_edge(needed_idx, node_idx, ()),
                    RunCommand::Delete => graph.add_edge(node_idx, needed_idx, ()),
                };
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            let id = &graph[cycle.node_id()];
            SchedulerError::InvalidPlan(format!("dependency cycle involving node {id}"))
        })?;

        Ok(Self { graph, index_of })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn in_degree(&self, id: &NodeId) -> usize {
        self.graph
            .neighbors_directed(self.index_of[id], Direction::Incoming)
            .count()
    }

    pub fn roots(&self) -> Vec<NodeId> {
        self.index_of
            .keys()
            .filter(|id| self.in_degree(id) == 0)
            .cloned()
            .collect()
    }

    pub fn dependents(&self, id: &NodeId) -> Vec<NodeId> {
        self.graph
            .neighbors_directed(self.index_of[id], Direction::Outgoing)
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    pub fn dependencies(&self, id: &NodeId) -> Vec<NodeId> {
        self.graph
            .neighbors_directed(self.index_of[id], Direction::Incoming)
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Topological depth: the length of the longest path from any root to
    /// `id`. Used to populate `RunNode::execution_group`.
    pub fn execution_group(&self, id: &NodeId) -> u32 {
        self.longest_path_from_roots(self.index_of[id])
    }

    /// Longest remaining path from `id` to any sink. The scheduler admits
    /// the ready node with the greatest value first, to keep the critical
    /// path off the wait queue (`spec.md` §4.1 "critical path ... admitted
    /// first among the ready set").
    pub fn critical_path_remaining(&self, id: &NodeId) -> u32 {
        self.longest_path_to_sinks(self.index_of[id])
    }

    fn longest_path_from_roots(&self, target: NodeIndex) -> u32 {
        let mut memo: HashMap<NodeIndex, u32> = HashMap::new();
        self.depth_from_roots(target, &mut memo)
    }

    fn depth_from_roots(&self, idx: NodeIndex, memo: &mut HashMap<NodeIndex, u32>) -> u32 {
        if let Some(&d) = memo.get(&idx) {
            return d;
        }
        let preds: Vec<NodeIndex> = self.graph.neighbors_directed(idx, Direction::Incoming).collect();
        let depth = preds
            .into_iter()
            .map(|p| 1 + self.depth_from_roots(p, memo))
            .max()
            .unwrap_or(0);
        memo.insert(idx, depth);
        depth
    }

    fn longest_path_to_sinks(&self, start: NodeIndex) -> u32 {
        let mut memo: HashMap<NodeIndex, u32> = HashMap::new();
        self.depth_to_sinks(start, &mut memo)
    }

    fn depth_to_sinks(&self, idx: NodeIndex, memo: &mut HashMap<NodeIndex, u32>) -> u32 {
        if let Some(&d) = memo.get(&idx) {
            return d;
        }
        let succs: Vec<NodeIndex> = self.graph.neighbors_directed(idx, Direction::Outgoing).collect();
        let depth = succs
            .into_iter()
            .map(|s| 1 + self.depth_to_sinks(s, memo))
            .max()
            .unwrap_or(0);
        memo.insert(idx, depth);
        depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_protocol::{NodeStatus, ParallelismGroup};

    fn node(id: &str, needs: &[&str]) -> RunNode {
        RunNode {
            id: NodeId(id.into()),
            needs: needs.iter().map(|n| NodeId((*n).into())).collect(),
            parallelism_group: None::<ParallelismGroup>,
            primary_kind: None,
            critical: false,
            attempt: 0,
            input_hash: "h".into(),
            status: NodeStatus::Planned,
            execution_group: 0,
        }
    }

    #[test]
    fn diamond_graph_reverses_edges_on_delete() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ];

        let apply = PlanGraph::build(&nodes, RunCommand::Apply).unwrap();
        assert_eq!(apply.in_degree(&NodeId("a".into())), 0);
        assert_eq!(apply.in_degree(&NodeId("d".into())), 2);
        assert_eq!(apply.critical_path_remaining(&NodeId("a".into())), 2);

        let delete = PlanGraph::build(&nodes, RunCommand::Delete).unwrap();
        assert_eq!(delete.in_degree(&NodeId("d".into())), 0);
        assert_eq!(delete.in_degree(&NodeId("a".into())), 2);
    }

    #[test]
    fn cycle_is_rejected() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        assert!(PlanGraph::build(&nodes, RunCommand::Apply).is_err());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let nodes = vec![node("a", &["ghost"])];
        assert!(PlanGraph::build(&nodes, RunCommand::Apply).is_err());
    }
}
