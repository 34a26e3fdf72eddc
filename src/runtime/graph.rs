/// Petgraph-based execution planning
///
/// Turns a validated workflow into the ordered list of node ids one execution
/// attempt walks through. The order is a deterministic topological order:
/// Kahn's algorithm seeded with zero in-degree nodes in declaration order, and
/// successors released in connection declaration order. Retries of the same
/// job therefore always see the same order, which makes the resume checkpoint
/// meaningful.

use crate::error::{EngineError, EngineResult};
use crate::workflow::validation::ValidatedWorkflow;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet, VecDeque};

/// Petgraph view of a validated workflow
///
/// Node weights are node ids; one edge per connection, so parallel
/// connections between the same pair of nodes become parallel edges.
#[derive(Debug)]
pub struct WorkflowGraph {
    graph: DiGraph<String, ()>,
    /// Mapping from node ID to graph node index
    node_id_to_index: HashMap<String, NodeIndex>,
}

impl WorkflowGraph {
    /// Build the graph, preserving declaration order in node indices
    pub fn build(workflow: &ValidatedWorkflow) -> Self {
        let mut graph = DiGraph::with_capacity(workflow.nodes().len(), workflow.connections().len());
        let mut node_id_to_index = HashMap::with_capacity(workflow.nodes().len());

        for node in workflow.nodes() {
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        // Endpoints were checked during validation
        for connection in workflow.connections() {
            if let (Some(&source), Some(&target)) = (
                node_id_to_index.get(&connection.source),
                node_id_to_index.get(&connection.target),
            ) {
                graph.add_edge(source, target, ());
            }
        }

        tracing::debug!(
            "🏗️ Built workflow graph: {} nodes, {} edges",
            graph.node_count(),
            graph.edge_count()
        );

        Self {
            graph,
            node_id_to_index,
        }
    }

    /// Deterministic topological order over every node
    ///
    /// Fails with `CycleDetected` naming the nodes that sit on a cycle.
    pub fn topological_order(&self, workflow: &ValidatedWorkflow) -> EngineResult<Vec<String>> {
        let count = self.graph.node_count();

        // Adjacency in connection declaration order, one entry per connection
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];
        for connection in workflow.connections() {
            if let (Some(source), Some(target)) = (
                self.node_id_to_index.get(&connection.source),
                self.node_id_to_index.get(&connection.target),
            ) {
                successors[source.index()].push(target.index());
                in_degree[target.index()] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);

        while let Some(current) = ready.pop_front() {
            order.push(self.graph[NodeIndex::new(current)].clone());
            for &next in &successors[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if order.len() < count {
            let cycle_nodes = self.cycle_members();
            tracing::error!("❌ Workflow graph contains a cycle: {:?}", cycle_nodes);
            return Err(EngineError::CycleDetected(cycle_nodes));
        }

        Ok(order)
    }

    /// Nodes reachable from `start`, including `start` itself
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let Some(&start_index) = self.node_id_to_index.get(start) else {
            return HashSet::new();
        };

        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start_index);
        while let Some(index) = bfs.next(&self.graph) {
            reachable.insert(self.graph[index].clone());
        }
        reachable
    }

    /// Nodes on a cycle (non-trivial strongly connected components and
    /// self-loops), in declaration order
    fn cycle_members(&self) -> Vec<String> {
        let mut members: Vec<NodeIndex> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&index| self.graph.contains_edge(index, index))
            })
            .flatten()
            .collect();
        members.sort();
        members
            .into_iter()
            .map(|index| self.graph[index].clone())
            .collect()
    }
}

/// Ordered node ids an execution attempt walks through
///
/// - `single_node_mode`: only the trigger node
/// - trigger node present in the graph: the topological order restricted to
///   nodes reachable from it
/// - otherwise: the full topological order
///
/// A cycle anywhere in the graph fails the plan.
pub fn plan_execution(
    workflow: &ValidatedWorkflow,
    trigger_node_id: &str,
    single_node_mode: bool,
) -> EngineResult<Vec<String>> {
    let graph = WorkflowGraph::build(workflow);
    let order = graph.topological_order(workflow)?;

    if single_node_mode {
        if !workflow.contains(trigger_node_id) {
            return Err(EngineError::InvalidWorkflow(format!(
                "single node mode requires a known trigger node, got '{}'",
                trigger_node_id
            )));
        }
        return Ok(vec![trigger_node_id.to_string()]);
    }

    if trigger_node_id.is_empty() || !workflow.contains(trigger_node_id) {
        if !trigger_node_id.is_empty() {
            tracing::warn!(
                "⚠️ Trigger node '{}' not in workflow, executing every node",
                trigger_node_id
            );
        }
        return Ok(order);
    }

    let reachable = graph.reachable_from(trigger_node_id);
    let planned: Vec<String> = order.into_iter().filter(|id| reachable.contains(id)).collect();
    tracing::debug!(
        "📋 Execution plan from '{}': {:?}",
        trigger_node_id,
        planned
    );
    Ok(planned)
}
