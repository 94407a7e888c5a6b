//! Job DAG (Directed Acyclic Graph) for dependency management.
//!
//! Explicit dependencies and on-success edges both become edges of one
//! graph: an on-success edge from A to B means the same thing as B depending
//! on A. Nodes are inserted in declaration order, so every query that walks
//! `node_indices()` answers in declaration order.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::core::job::JobState;
use crate::error::{Error, Result};

/// Where an edge between two jobs was declared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared in the target's dependency list.
    Dependency,
    /// Declared in the source's on-success list.
    OnSuccess,
    /// Declared both ways.
    Both,
}

impl EdgeKind {
    fn merge(self, other: EdgeKind) -> EdgeKind {
        if self == other {
            self
        } else {
            EdgeKind::Both
        }
    }

    pub fn is_dependency(&self) -> bool {
        matches!(self, EdgeKind::Dependency | EdgeKind::Both)
    }

    pub fn is_on_success(&self) -> bool {
        matches!(self, EdgeKind::OnSuccess | EdgeKind::Both)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeKind::Dependency => write!(f, "dependency"),
            EdgeKind::OnSuccess => write!(f, "on_success"),
            EdgeKind::Both => write!(f, "dependency+on_success"),
        }
    }
}

/// The job dependency graph.
///
/// Node weights are job names; edges point from the job that must succeed
/// first to the job that waits on it.
#[derive(Clone)]
pub struct JobDAG {
    graph: DiGraph<String, EdgeKind>,
    index: HashMap<String, NodeIndex>,
}

impl JobDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }

    /// Add a job node. Adding an existing name returns its existing index.
    pub fn add_job(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.index.get(name) {
            return index;
        }
        let index = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), index);
        index
    }

    /// Add an edge meaning `to` may not start until `from` succeeded.
    ///
    /// Declaring the same pair twice merges the edge kinds instead of
    /// adding a parallel edge.
    ///
    /// # Errors
    /// Returns a configuration error if either job is unknown or the edge
    /// is a self-loop.
    pub fn add_edge(&mut self, from: &str, to: &str, kind: EdgeKind) -> Result<()> {
        let from_index = *self.index.get(from).ok_or_else(|| {
            Error::config(format!("job {} references undeclared job {}", to, from))
        })?;
        let to_index = *self.index.get(to).ok_or_else(|| {
            Error::config(format!("job {} references undeclared job {}", from, to))
        })?;
        if from_index == to_index {
            return Err(Error::config(format!("job {} references itself", from)));
        }

        match self.graph.find_edge(from_index, to_index) {
            Some(edge) => {
                if let Some(weight) = self.graph.edge_weight_mut(edge) {
                    *weight = weight.merge(kind);
                }
            }
            None => {
                self.graph.add_edge(from_index, to_index, kind);
            }
        }
        Ok(())
    }

    pub fn contains_job(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn job_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_kind(&self, from: &str, to: &str) -> Option<EdgeKind> {
        let from = self.index.get(from)?;
        let to = self.index.get(to)?;
        let edge = self.graph.find_edge(*from, *to)?;
        self.graph.edge_weight(edge).copied()
    }

    /// Jobs that must succeed before `name` may start.
    pub fn upstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Jobs waiting on `name`.
    pub fn downstream(&self, name: &str) -> Vec<&str> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, dir: Direction) -> Vec<&str> {
        let Some(&index) = self.index.get(name) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(index, dir).collect();
        found.sort();
        found
            .into_iter()
            .map(|n| self.graph[n].as_str())
            .collect()
    }

    /// Every job reachable from `name` along outgoing edges.
    pub fn descendants(&self, name: &str) -> Vec<&str> {
        self.reachable(name, Direction::Outgoing)
    }

    /// Every job `name` transitively waits on.
    pub fn ancestors(&self, name: &str) -> Vec<&str> {
        self.reachable(name, Direction::Incoming)
    }

    fn reachable(&self, name: &str, dir: Direction) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for next in self.graph.neighbors_directed(node, dir) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        let mut found: Vec<NodeIndex> = seen.into_iter().collect();
        found.sort();
        found.into_iter().map(|n| self.graph[n].as_str()).collect()
    }

    /// Whether `to` is reachable from `from` using only edges accepted by
    /// `follow`.
    pub fn reaches_via(&self, from: &str, to: &str, follow: impl Fn(EdgeKind) -> bool) -> bool {
        let (Some(&start), Some(&goal)) = (self.index.get(from), self.index.get(to)) else {
            return false;
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for edge in self.graph.edges_directed(node, Direction::Outgoing) {
                if !follow(*edge.weight()) {
                    continue;
                }
                let next = edge.target();
                if next == goal {
                    return true;
                }
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        false
    }

    /// Find a cycle with a depth-first search that tracks the current
    /// recursion stack. Returns the job names along the cycle, with the
    /// first name repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            // Explicit stack of (node, remaining successors) to avoid recursion.
            let mut path: Vec<NodeIndex> = vec![root];
            let mut frames: Vec<Vec<NodeIndex>> = vec![self.successors(root)];
            marks[root.index()] = Mark::OnStack;

            while let Some(frame) = frames.last_mut() {
                match frame.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::OnStack => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|n| self.graph[*n].clone()).collect();
                            cycle.push(self.graph[next].clone());
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            path.push(next);
                            frames.push(self.successors(next));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        frames.pop();
                        if let Some(done) = path.pop() {
                            marks[done.index()] = Mark::Done;
                        }
                    }
                }
            }
        }
        None
    }

    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(node, Direction::Outgoing)
            .collect();
        // Reverse so pop() visits in declaration order.
        next.sort_by(|a, b| b.cmp(a));
        next
    }

    // ========== Scheduling Operations ==========

    /// Pending jobs whose upstream jobs have all succeeded, in declaration
    /// order. Jobs absent from `states` count as pending.
    pub fn ready_jobs(&self, states: &HashMap<String, JobState>) -> Vec<&str> {
        let state_of = |name: &str| states.get(name).copied().unwrap_or_default();
        self.graph
            .node_indices()
            .filter(|&index| state_of(&self.graph[index]) == JobState::Pending)
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| state_of(&self.graph[dep]) == JobState::Success)
            })
            .map(|index| self.graph[index].as_str())
            .collect()
    }

    /// Pending jobs that can never run because an upstream job failed or was
    /// skipped, paired with that upstream job's name.
    pub fn blocked_jobs(&self, states: &HashMap<String, JobState>) -> Vec<(&str, &str)> {
        let state_of = |name: &str| states.get(name).copied().unwrap_or_default();
        self.graph
            .node_indices()
            .filter(|&index| state_of(&self.graph[index]) == JobState::Pending)
            .filter_map(|index| {
                let mut upstream: Vec<NodeIndex> = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .collect();
                upstream.sort();
                upstream
                    .into_iter()
                    .find(|dep| {
                        matches!(
                            state_of(&self.graph[*dep]),
                            JobState::Failed | JobState::Skipped
                        )
                    })
                    .map(|dep| (self.graph[index].as_str(), self.graph[dep].as_str()))
            })
            .collect()
    }

    /// Whether every job is in a terminal state.
    pub fn all_terminal(&self, states: &HashMap<String, JobState>) -> bool {
        self.index
            .keys()
            .all(|name| states.get(name).is_some_and(JobState::is_terminal))
    }

    /// Job names in an order where every job follows its upstream jobs.
    ///
    /// # Errors
    /// Returns a configuration error if the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<&str>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            Error::config(format!(
                "cycle detected at job {}",
                self.graph[cycle.node_id()]
            ))
        })?;
        Ok(sorted.into_iter().map(|n| self.graph[n].as_str()).collect())
    }

    /// All edges as `(from, to, kind)`, grouped by source in declaration order.
    pub fn edges(&self) -> Vec<(&str, &str, EdgeKind)> {
        let mut edges: Vec<(NodeIndex, NodeIndex, EdgeKind)> = self
            .graph
            .edge_references()
            .map(|e| (e.source(), e.target(), *e.weight()))
            .collect();
        edges.sort_by_key(|(from, to, _)| (*from, *to));
        edges
            .into_iter()
            .map(|(from, to, kind)| (self.graph[from].as_str(), self.graph[to].as_str(), kind))
            .collect()
    }
}

impl Default for JobDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for JobDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDAG")
            .field("jobs", &self.job_count())
            .field("edges", &self.edge_count())
            .finish()
    }
}
