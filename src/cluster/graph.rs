//! Dependency graph over service nodes

use crate::error::{FlotillaError, Result};
use crate::node::{NodeState, ServiceNode};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Directed acyclic graph of nodes, edges pointing from dependent to dependency
///
/// Nodes are kept in registration order; that order breaks ties between
/// independent nodes so the same graph always starts the same way.
#[derive(Debug, Default)]
pub struct ClusterGraph {
    nodes: Vec<ServiceNode>,
    /// Node name to registration index
    index: HashMap<String, usize>,
}

impl ClusterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node depending on already registered nodes
    ///
    /// Nothing is changed when the node is rejected.
    pub fn add_node(&mut self, mut node: ServiceNode, depends_on: &[&str]) -> Result<()> {
        let name = node.name().to_string();

        if self.index.contains_key(&name) {
            return Err(FlotillaError::NodeExists(name));
        }

        for dependency in depends_on {
            if *dependency == name {
                return Err(FlotillaError::Cycle(vec![name.clone(), name]));
            }
        }

        for dependency in node.dependencies().iter().map(String::as_str).chain(depends_on.iter().copied()) {
            if !self.index.contains_key(dependency) {
                return Err(FlotillaError::UnknownDependency {
                    node: name,
                    dependency: dependency.to_string(),
                });
            }
        }

        for dependency in depends_on {
            node.push_dependency(dependency);
        }

        tracing::debug!("Registered {} depending on {:?}", name, node.dependencies());
        self.index.insert(name, self.nodes.len());
        self.nodes.push(node);

        Ok(())
    }

    /// Make `dependent` depend on `dependency`, both already registered
    ///
    /// Fails with `Cycle` when `dependency` already depends on `dependent`,
    /// leaving the graph unchanged.
    pub fn add_edge(&mut self, dependent: &str, dependency: &str) -> Result<()> {
        let dependent_idx = *self.index.get(dependent)
            .ok_or_else(|| FlotillaError::NodeNotFound(dependent.to_string()))?;

        if !self.index.contains_key(dependency) {
            return Err(FlotillaError::UnknownDependency {
                node: dependent.to_string(),
                dependency: dependency.to_string(),
            });
        }

        if self.nodes[dependent_idx].state() != NodeState::Created {
            return Err(FlotillaError::AlreadyStarted(dependent.to_string()));
        }

        if let Some(path) = self.dependency_path(dependency, dependent) {
            let mut cycle = vec![dependent.to_string()];
            cycle.extend(path);
            return Err(FlotillaError::Cycle(cycle));
        }

        self.nodes[dependent_idx].push_dependency(dependency);
        Ok(())
    }

    /// Path from `from` to `to` following dependency edges
    fn dependency_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let mut stack = vec![vec![from.to_string()]];
        let mut seen = HashSet::new();

        while let Some(path) = stack.pop() {
            let current = path.last()?.clone();
            if current == to {
                return Some(path);
            }
            if !seen.insert(current.clone()) {
                continue;
            }

            if let Some(node) = self.node(&current) {
                for dependency in node.dependencies() {
                    let mut next = path.clone();
                    next.push(dependency.clone());
                    stack.push(next);
                }
            }
        }

        None
    }

    /// Node names with every dependency before its dependents
    pub fn topological_start_order(&self) -> Result<Vec<String>> {
        Ok(self.sorted_indices()?
            .into_iter()
            .map(|i| self.nodes[i].name().to_string())
            .collect())
    }

    /// Exact reverse of the start order
    pub fn reverse_stop_order(&self) -> Result<Vec<String>> {
        let mut order = self.topological_start_order()?;
        order.reverse();
        Ok(order)
    }

    /// Start order grouped into waves; every node's dependencies are in
    /// earlier waves
    pub fn start_waves(&self) -> Result<Vec<Vec<String>>> {
        let order = self.sorted_indices()?;
        let mut depth = vec![0usize; self.nodes.len()];
        let mut waves: Vec<Vec<String>> = Vec::new();

        for i in order {
            let level = self.nodes[i].dependencies().iter()
                .filter_map(|d| self.index.get(d))
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
            depth[i] = level;

            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(self.nodes[i].name().to_string());
        }

        Ok(waves)
    }

    /// Kahn's algorithm, lowest registration index first among ready nodes
    fn sorted_indices(&self) -> Result<Vec<usize>> {
        let count = self.nodes.len();
        let mut pending = vec![0usize; count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

        for (i, node) in self.nodes.iter().enumerate() {
            for dependency in node.dependencies() {
                if let Some(&d) = self.index.get(dependency) {
                    pending[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending.iter()
            .enumerate()
            .filter(|&(_, &n)| n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(count);

        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &dependent in &dependents[i] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        if order.len() < count {
            let stuck = (0..count)
                .filter(|&i| pending[i] > 0)
                .map(|i| self.nodes[i].name().to_string())
                .collect();
            return Err(FlotillaError::Cycle(stuck));
        }

        Ok(order)
    }

    pub fn node(&self, name: &str) -> Option<&ServiceNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut ServiceNode> {
        match self.index.get(name) {
            Some(&i) => Some(&mut self.nodes[i]),
            None => None,
        }
    }

    /// Nodes in registration order
    pub fn nodes(&self) -> &[ServiceNode] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [ServiceNode] {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies_of(&self, name: &str) -> Result<&[String]> {
        self.node(name)
            .map(|n| n.dependencies())
            .ok_or_else(|| FlotillaError::NodeNotFound(name.to_string()))
    }

    /// Nodes that directly depend on `name`
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.nodes.iter()
            .filter(|n| n.dependencies().iter().any(|d| d == name))
            .map(|n| n.name().to_string())
            .collect()
    }
}
