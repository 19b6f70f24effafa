//! Per-partition overlay graph and the greedy balancing heuristic.
//!
//! The graph is undirected: an edge `a - b` means the tracker wants `a` and
//! `b` to be neighbors. Balancing keeps every degree at or below
//! `min(max_neighbors, n - 1)` and joins components until the graph is
//! connected, which always succeeds when `max_neighbors >= 2`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use strand_protocol::PeerId;

/// Upper bound on fill/repair rounds per balance.
const MAX_PASSES: usize = 4;

/// Desired neighbor assignments of one partition.
#[derive(Debug, Clone)]
pub struct OverlayTopology {
    max_neighbors: usize,
    nodes: BTreeMap<PeerId, BTreeSet<PeerId>>,
}

impl OverlayTopology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new(max_neighbors: usize) -> Self {
        Self {
            max_neighbors,
            nodes: BTreeMap::new(),
        }
    }

    /// Adds a node with no edges. Returns false if it was already present.
    pub fn add_node(&mut self, id: PeerId) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, BTreeSet::new());
        true
    }

    /// Returns true if the node is part of the topology.
    #[must_use]
    pub fn has_node(&self, id: &PeerId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Removes a node and returns its former neighbors.
    pub fn remove_node(&mut self, id: &PeerId) -> BTreeSet<PeerId> {
        let neighbors = self.nodes.remove(id).unwrap_or_default();
        for neighbor in &neighbors {
            if let Some(set) = self.nodes.get_mut(neighbor) {
                set.remove(id);
            }
        }
        neighbors
    }

    /// Seeds a node's edges from the neighbors it reports.
    ///
    /// Lets a restarted tracker keep connections that already exist. An edge
    /// is only added while both ends are below `max_neighbors`.
    pub fn seed(&mut self, id: &PeerId, reported: &[PeerId]) {
        for other in reported {
            if other == id || !self.has_node(other) {
                continue;
            }
            if self.degree(id) < self.max_neighbors && self.degree(other) < self.max_neighbors {
                self.link(id, other);
            }
        }
    }

    /// Returns the node's assigned neighbors in ascending order.
    #[must_use]
    pub fn neighbors(&self, id: &PeerId) -> Vec<PeerId> {
        self.nodes
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns every node's assigned neighbors.
    #[must_use]
    pub fn assignments(&self) -> BTreeMap<PeerId, Vec<PeerId>> {
        self.nodes
            .iter()
            .map(|(id, set)| (id.clone(), set.iter().cloned().collect()))
            .collect()
    }

    /// Returns the node ids in ascending order.
    pub fn node_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.nodes.keys()
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the topology has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the largest degree in the graph.
    #[must_use]
    pub fn max_degree(&self) -> usize {
        self.nodes.values().map(BTreeSet::len).max().unwrap_or(0)
    }

    /// Returns the connected components.
    #[must_use]
    pub fn components(&self) -> Vec<BTreeSet<PeerId>> {
        let mut seen = BTreeSet::new();
        let mut components = Vec::new();
        for id in self.nodes.keys() {
            if seen.contains(id) {
                continue;
            }
            let component = self.reachable(id, None);
            seen.extend(component.iter().cloned());
            components.push(component);
        }
        components
    }

    /// Returns true if every node can reach every other node.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.components().len() <= 1
    }

    /// Rebalances the graph.
    ///
    /// `rtt(a, b)` is the round-trip time `a` reported to `b`, used to break
    /// ties between equally loaded candidates.
    pub fn balance<F>(&mut self, rtt: F)
    where
        F: Fn(&PeerId, &PeerId) -> Option<u64>,
    {
        self.trim();
        for _ in 0..MAX_PASSES {
            let before = self.nodes.clone();
            self.fill(&rtt);
            self.break_pairs();
            self.repair();
            if self.nodes == before {
                break;
            }
        }
    }

    fn target(&self) -> usize {
        self.max_neighbors.min(self.nodes.len().saturating_sub(1))
    }

    fn degree(&self, id: &PeerId) -> usize {
        self.nodes.get(id).map_or(0, BTreeSet::len)
    }

    fn is_free(&self, id: &PeerId) -> bool {
        self.degree(id) < self.target()
    }

    fn adjacent(&self, a: &PeerId, b: &PeerId) -> bool {
        self.nodes.get(a).is_some_and(|set| set.contains(b))
    }

    fn link(&mut self, a: &PeerId, b: &PeerId) {
        if let Some(set) = self.nodes.get_mut(a) {
            set.insert(b.clone());
        }
        if let Some(set) = self.nodes.get_mut(b) {
            set.insert(a.clone());
        }
    }

    fn unlink(&mut self, a: &PeerId, b: &PeerId) {
        if let Some(set) = self.nodes.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = self.nodes.get_mut(b) {
            set.remove(a);
        }
    }

    /// Drops edges of over-full nodes, busiest neighbors first.
    fn trim(&mut self) {
        let target = self.target();
        let ids: Vec<PeerId> = self.nodes.keys().cloned().collect();
        for id in ids {
            while self.degree(&id) > target {
                let busiest = self.nodes[&id]
                    .iter()
                    .max_by_key(|n| (self.degree(n), (*n).clone()))
                    .cloned();
                match busiest {
                    Some(neighbor) => self.unlink(&id, &neighbor),
                    None => break,
                }
            }
        }
    }

    /// Connects free nodes to the least loaded free candidates.
    ///
    /// Degrees only grow here, so a node that finds no candidate will not
    /// find one later in the same pass.
    fn fill<F>(&mut self, rtt: &F)
    where
        F: Fn(&PeerId, &PeerId) -> Option<u64>,
    {
        let mut order: Vec<PeerId> = self.nodes.keys().cloned().collect();
        order.sort_by_key(|id| (self.degree(id), id.clone()));

        for id in order {
            while self.is_free(&id) {
                let candidate = self
                    .nodes
                    .keys()
                    .filter(|other| **other != id)
                    .filter(|other| !self.adjacent(&id, other))
                    .filter(|other| self.is_free(other))
                    .min_by_key(|other| {
                        (
                            self.degree(other),
                            rtt(&id, *other).unwrap_or(u64::MAX),
                            (*other).clone(),
                        )
                    })
                    .cloned();
                match candidate {
                    Some(other) => self.link(&id, &other),
                    None => break,
                }
            }
        }
    }

    /// Gives nodes with two or more free slots the ends of an edge they are
    /// not part of. Degrees of the edge ends stay the same.
    fn break_pairs(&mut self) {
        let ids: Vec<PeerId> = self.nodes.keys().cloned().collect();
        for id in ids {
            while self.target().saturating_sub(self.degree(&id)) >= 2 {
                let Some((a, b)) = self.edge_away_from(&id) else {
                    break;
                };
                self.unlink(&a, &b);
                self.link(&id, &a);
                self.link(&id, &b);
            }
        }
    }

    fn edge_away_from(&self, id: &PeerId) -> Option<(PeerId, PeerId)> {
        self.edges()
            .find(|(a, b)| a != id && b != id && !self.adjacent(id, a) && !self.adjacent(id, b))
    }

    /// Joins components until the graph is connected or no join applies.
    fn repair(&mut self) {
        let mut budget = self.nodes.len() * 2;
        while budget > 0 {
            budget -= 1;
            let components = self.components();
            if components.len() <= 1 {
                return;
            }
            let joined = components[1..]
                .iter()
                .any(|other| self.join(&components[0], other));
            if !joined {
                return;
            }
        }
    }

    fn join(&mut self, left: &BTreeSet<PeerId>, right: &BTreeSet<PeerId>) -> bool {
        let free_left = self.least_loaded_free(left);
        let free_right = self.least_loaded_free(right);

        match (free_left, free_right) {
            (Some(a), Some(b)) => {
                self.link(&a, &b);
                true
            }
            (Some(free), None) => self.attach(&free, right),
            (None, Some(free)) => self.attach(&free, left),
            (None, None) => {
                let (Some((a1, b1)), Some((a2, b2))) =
                    (self.non_bridge_edge(left), self.non_bridge_edge(right))
                else {
                    return false;
                };
                self.unlink(&a1, &b1);
                self.unlink(&a2, &b2);
                self.link(&a1, &a2);
                self.link(&b1, &b2);
                true
            }
        }
    }

    /// Splices a free node into a cycle of a full component.
    fn attach(&mut self, free: &PeerId, component: &BTreeSet<PeerId>) -> bool {
        let Some((a, b)) = self.non_bridge_edge(component) else {
            return false;
        };
        self.unlink(&a, &b);
        self.link(free, &a);
        if self.is_free(free) {
            self.link(free, &b);
        }
        true
    }

    fn least_loaded_free(&self, component: &BTreeSet<PeerId>) -> Option<PeerId> {
        component
            .iter()
            .filter(|id| self.is_free(id))
            .min_by_key(|id| (self.degree(id), (*id).clone()))
            .cloned()
    }

    /// Finds an edge whose removal keeps the component connected.
    fn non_bridge_edge(&self, component: &BTreeSet<PeerId>) -> Option<(PeerId, PeerId)> {
        self.edges()
            .filter(|(a, _)| component.contains(a))
            .find(|(a, b)| self.reachable(a, Some((a, b))).contains(b))
    }

    fn edges(&self) -> impl Iterator<Item = (PeerId, PeerId)> + '_ {
        self.nodes.iter().flat_map(|(a, set)| {
            set.iter()
                .filter(move |b| a < *b)
                .map(move |b| (a.clone(), b.clone()))
        })
    }

    fn reachable(&self, start: &PeerId, without: Option<(&PeerId, &PeerId)>) -> BTreeSet<PeerId> {
        let mut seen = BTreeSet::from([start.clone()]);
        let mut queue = VecDeque::from([start.clone()]);
        while let Some(id) = queue.pop_front() {
            let Some(set) = self.nodes.get(&id) else {
                continue;
            };
            for next in set {
                let skipped = without
                    .is_some_and(|(a, b)| (&id == a && next == b) || (&id == b && next == a));
                if !skipped && seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen
    }
}
