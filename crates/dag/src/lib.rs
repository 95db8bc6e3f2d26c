// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::hash::Hash;

use petgraph::{
    algo::{kosaraju_scc, toposort},
    prelude::DiGraph,
    visit::{Dfs, Walker},
};

/// NodeIndex as employed in quarry usage
pub type NodeIndex = petgraph::prelude::NodeIndex<u32>;

/// Simplistic encapsulation of petgraph APIs to provide
/// suitable mechanisms to empower dependency ordering code
#[derive(Debug, Clone)]
pub struct Dag<N: Hash + Eq> {
    graph: DiGraph<N, (), u32>,
    indices: HashMap<N, NodeIndex>,
}

impl<N: Hash + Eq> Default for Dag<N> {
    fn default() -> Self {
        Self {
            graph: DiGraph::default(),
            indices: HashMap::default(),
        }
    }
}

impl<N> Dag<N>
where
    N: Copy + Hash + Eq,
{
    /// Construct a new Dag
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds node N to the graph and returns the index.
    /// If N already exists, it'll return the index of that node.
    pub fn add_node_or_get_index(&mut self, node: N) -> NodeIndex {
        if let Some(index) = self.indices.get(&node) {
            *index
        } else {
            let index = self.graph.add_node(node);
            self.indices.insert(node, index);
            index
        }
    }

    /// Returns true if the node exists
    pub fn node_exists(&self, node: &N) -> bool {
        self.indices.contains_key(node)
    }

    /// Add an edge from a to b, returning false if it already exists
    pub fn add_edge(&mut self, a: N, b: N) -> bool {
        let a = self.add_node_or_get_index(a);
        let b = self.add_node_or_get_index(b);

        if self.graph.find_edge(a, b).is_some() {
            return false;
        }

        self.graph.add_edge(a, b, ());

        true
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &'_ N> {
        self.graph.node_indices().map(|i| &self.graph[i])
    }

    /// Perform a depth-first search over the closure reachable from `start`
    pub fn dfs(&self, start: N) -> impl Iterator<Item = &'_ N> {
        let index = self.indices.get(&start).copied();

        index
            .map(|index| Dfs::new(&self.graph, index))
            .into_iter()
            .flat_map(|dfs| dfs.iter(&self.graph).map(|i| &self.graph[i]))
    }

    /// Perform a topological sort, or report the members of a cycle
    pub fn topo(&self) -> Result<Vec<N>, Cycle<N>> {
        match toposort(&self.graph, None) {
            Ok(sorted) => Ok(sorted.into_iter().map(|i| self.graph[i]).collect()),
            Err(e) => Err(self.cycle_of(e.node_id())),
        }
    }

    /// The cycle containing `node`, in edge order
    fn cycle_of(&self, node: NodeIndex) -> Cycle<N> {
        let members = kosaraju_scc(&self.graph)
            .into_iter()
            .find(|scc| scc.contains(&node))
            .unwrap_or_else(|| vec![node])
            .into_iter()
            .map(|i| self.graph[i])
            .collect();

        Cycle { members }
    }
}

/// A dependency cycle uncovered during [`Dag::topo`]
#[derive(Debug, Clone)]
pub struct Cycle<N> {
    pub members: Vec<N>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn chain(dag: &mut Dag<i32>, nodes: &[i32]) {
        for pair in nodes.windows(2) {
            dag.add_edge(pair[0], pair[1]);
        }
    }

    #[test]
    fn basic_topo() {
        let mut dag = Dag::new();
        chain(&mut dag, &[1, 2, 3]);
        dag.add_edge(1, 3);

        let order = dag.topo().expect("acyclic");
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn duplicate_edges_rejected() {
        let mut dag = Dag::new();
        assert!(dag.add_edge(1, 2));
        assert!(!dag.add_edge(1, 2));
    }

    #[test]
    fn cycle_reported_with_members() {
        let mut dag = Dag::new();
        chain(&mut dag, &[1, 2, 3, 1]);
        dag.add_edge(0, 1);

        let cycle = dag.topo().expect_err("cyclic");
        let mut members = cycle.members;
        members.sort_unstable();
        assert_eq!(members, vec![1, 2, 3]);
    }

    #[test]
    fn dfs_closure() {
        let mut dag = Dag::new();
        chain(&mut dag, &[1, 2, 4]);
        dag.add_edge(2, 3);
        dag.add_edge(5, 1);

        let mut seen: Vec<i32> = dag.dfs(2).copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3, 4]);
    }
}
