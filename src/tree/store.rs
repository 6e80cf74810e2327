//! The node arena and the rebalance protocol.
//!
//! All structural operations go through a [`Store`]: nodes are looked up by
//! id for every hop, never held across mutations, so the cyclic
//! parent/child graph needs no ownership tricks. Mutations only flag a node
//! for a later shape check; the queue is drained by [`Store::run_checks`],
//! which decouples mutation latency from rebalance cost and lets many
//! mutations share one fixup. Randomized per-node thresholds keep replicas
//! from splitting or merging in lockstep.

use std::collections::VecDeque;
use std::ops::RangeInclusive;

use rustc_hash::FxHashMap;

use crate::set::FilteredOrSet;
use crate::set::OrSet;

use super::contained_in;
use super::disjoint;
use super::entry_affinity;
use super::entry_order;
use super::node::JOIN_THRESHOLD;
use super::node::SPLIT_THRESHOLD;
use super::prefix_len;
use super::weighted_prefix_score;
use super::Item;
use super::Key;
use super::Node;
use super::NodeId;
use super::RangeEntry;
use super::Target;

/// Arena of tree nodes plus the process-scoped state around them: the root
/// replica, the deferred-check queue, and rebalance counters.
pub struct Store<S = FilteredOrSet<Item>> {
    pub(crate) nodes: FxHashMap<NodeId, Node<S>>,
    /// Distinguished top-level replica holding the current root pointer.
    /// Concurrent root changes may transiently leave several candidates;
    /// any of them works.
    pub(crate) root_replica: FilteredOrSet<NodeId>,
    pending: VecDeque<NodeId>,
    split_range: RangeInclusive<usize>,
    join_range: RangeInclusive<usize>,
    pub split_count: u64,
    pub merge_count: u64,
}

/// Best weighted score between any concrete endpoint of a node's computed
/// range and any concrete bound of a candidate entry.
fn range_affinity(my_min: &Option<Key>, my_max: &Option<Key>, entry: &RangeEntry) -> u128 {
    let mut score = 0;
    for mine in [my_min, my_max] {
        let Some(mine) = mine else { continue };
        for theirs in [&entry.min, &entry.max] {
            let Some(theirs) = theirs else { continue };
            score = score.max(weighted_prefix_score(mine, theirs));
        }
    }
    return score;
}

impl<S: OrSet<Item> + Default> Store<S> {
    /// Create an empty store with the default threshold ranges.
    pub fn new() -> Store<S> {
        return Store::with_threshold_ranges(SPLIT_THRESHOLD, JOIN_THRESHOLD);
    }

    /// Create an empty store whose nodes draw thresholds from the given
    /// ranges. Tests pin these to force splits and merges early.
    pub fn with_threshold_ranges(
        split_range: RangeInclusive<usize>,
        join_range: RangeInclusive<usize>,
    ) -> Store<S> {
        return Store {
            nodes: FxHashMap::default(),
            root_replica: FilteredOrSet::new(),
            pending: VecDeque::new(),
            split_range,
            join_range,
            split_count: 0,
            merge_count: 0,
        };
    }

    fn fresh_node(&self) -> Node<S> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let split = rng.gen_range(self.split_range.clone());
        let join = rng.gen_range(self.join_range.clone());
        return Node::with_thresholds(split, join);
    }

    /// Create, register, and point the root replica at a fresh empty node.
    pub fn init_root(&mut self) -> NodeId {
        let node = self.fresh_node();
        let id = self.register(node);
        self.set_root(id);
        return id;
    }

    /// Announce a node to the store.
    pub fn register(&mut self, node: Node<S>) -> NodeId {
        let id = node.id;
        self.nodes.insert(id, node);
        return id;
    }

    /// Record a new root pointer, retiring any previous candidates.
    pub fn set_root(&mut self, id: NodeId) {
        let previous: Vec<NodeId> = self.root_replica.iter().copied().collect();
        for old in previous {
            self.root_replica.remove(&old);
        }
        self.root_replica.add(id);
    }

    /// Current root candidates.
    pub fn roots(&self) -> Vec<NodeId> {
        return self.root_replica.iter().copied().collect();
    }

    /// Any current root.
    pub fn root(&self) -> Option<NodeId> {
        return self.roots().into_iter().next();
    }

    pub fn node(&self, id: NodeId) -> Option<&Node<S>> {
        return self.nodes.get(&id);
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<S>> {
        return self.nodes.get_mut(&id);
    }

    /// Number of registered nodes, reachable or not.
    pub fn node_count(&self) -> usize {
        return self.nodes.len();
    }

    /// Flag a node for a deferred shape check.
    pub fn check(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if !node.should_check {
                node.should_check = true;
                self.pending.push_back(id);
            }
        }
    }

    /// Drain the check queue, rebalancing every flagged node.
    pub fn run_checks(&mut self) {
        while let Some(id) = self.pending.pop_front() {
            if self.nodes.get(&id).is_some_and(|node| node.should_check) {
                self.do_check(id);
            }
        }
    }

    /// Insert a payload under `key`, routing from the root. Every node on
    /// the path is flagged for a deferred check.
    pub fn add_leaf_item(&mut self, key: &str, value: &str) {
        let root = match self.root() {
            Some(root) => root,
            None => self.init_root(),
        };
        self.add_at(root, key, value);
    }

    fn add_at(&mut self, id: NodeId, key: &str, value: &str) {
        let mut descend: Option<NodeId> = None;
        {
            let Some(node) = self.nodes.get_mut(&id) else { return };
            if node.is_leaf_node() {
                node.add_entry(RangeEntry::leaf(key, value));
            } else {
                let containing: Vec<&RangeEntry> = node
                    .entries()
                    .filter(|entry| entry.child_id().is_some() && entry.contains(key))
                    .collect();
                let pool = if containing.is_empty() {
                    node.entries().filter(|entry| entry.child_id().is_some()).collect()
                } else {
                    containing
                };
                descend = pool
                    .into_iter()
                    .max_by_key(|entry| entry_affinity(entry, key))
                    .and_then(RangeEntry::child_id);
            }
        }
        if let Some(child) = descend {
            self.add_at(child, key, value);
        }
        self.check(id);
    }

    /// Delete the payload stored under `key`, if any.
    pub fn del_leaf_item(&mut self, key: &str) {
        if let Some(root) = self.root() {
            self.del_at(root, key);
        }
    }

    fn del_at(&mut self, id: NodeId, key: &str) {
        let mut descend: Vec<NodeId> = Vec::new();
        {
            let Some(node) = self.nodes.get_mut(&id) else { return };
            if node.is_leaf_node() {
                let hits: Vec<RangeEntry> =
                    node.entries().filter(|entry| entry.matches_point(key)).cloned().collect();
                for entry in hits {
                    node.remove_entry(&entry);
                }
            } else {
                // Point hits can sit next to child entries after a merge
                // folded a leaf node into an inner one.
                let hits: Vec<RangeEntry> =
                    node.entries().filter(|entry| entry.matches_point(key)).cloned().collect();
                for entry in hits {
                    node.remove_entry(&entry);
                }
                for entry in node.entries() {
                    if entry.contains(key) {
                        if let Some(child) = entry.child_id() {
                            descend.push(child);
                        }
                    }
                }
            }
        }
        for child in descend {
            self.del_at(child, key);
        }
        self.check(id);
    }

    /// Look up the payload stored under `key`. Reads do not flag checks.
    pub fn query_leaf_item(&self, key: &str) -> Option<String> {
        return self.root().and_then(|root| self.query_at(root, key));
    }

    fn query_at(&self, id: NodeId, key: &str) -> Option<String> {
        let node = self.nodes.get(&id)?;
        if node.is_leaf_node() {
            return node.entries().find(|entry| entry.matches_point(key)).and_then(|entry| {
                match &entry.target {
                    Target::Payload(value) => Some(value.clone()),
                    Target::Child(_) => None,
                }
            });
        }
        for entry in node.entries() {
            if !entry.contains(key) {
                continue;
            }
            match &entry.target {
                Target::Payload(value) if entry.matches_point(key) => return Some(value.clone()),
                Target::Payload(_) => {}
                Target::Child(child) => {
                    if let Some(found) = self.query_at(*child, key) {
                        return Some(found);
                    }
                }
            }
        }
        return None;
    }

    /// Every `(key, payload)` pair reachable from the root. Unresolvable
    /// children contribute nothing.
    pub fn all_items(&self) -> Vec<(String, String)> {
        return match self.root() {
            Some(root) => self.items_under(root),
            None => Vec::new(),
        };
    }

    /// Depth-first enumeration of the payloads reachable from one node.
    pub fn items_under(&self, id: NodeId) -> Vec<(String, String)> {
        let mut result = Vec::new();
        let Some(node) = self.nodes.get(&id) else { return result };
        for entry in node.entries() {
            match &entry.target {
                Target::Payload(value) => {
                    if let Some(key) = &entry.min {
                        result.push((key.clone(), value.clone()));
                    }
                }
                Target::Child(child) => result.extend(self.items_under(*child)),
            }
        }
        return result;
    }

    /// Rebalance one node: prune stale parent links, merge on underflow,
    /// repair overlapping children, split on overflow, refresh the summary
    /// entry in each parent, and finally self-delete when empty.
    pub fn do_check(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else { return };
        node.should_check = false;
        let parents: Vec<NodeId> = node.parents().collect();

        // A sole listed parent may simply not have registered us yet
        // (fresh split); only prune when more than one parent is listed.
        if parents.len() > 1 {
            let stale: Vec<NodeId> = parents
                .iter()
                .copied()
                .filter(|parent| {
                    !self.nodes.get(parent).is_some_and(|p| p.children().contains(&id))
                })
                .collect();
            if let Some(node) = self.nodes.get_mut(&id) {
                for parent in stale {
                    node.remove_parent(parent);
                }
            }
        }

        let (count, join_threshold) = match self.nodes.get(&id) {
            Some(node) => (node.entry_count(), node.join_threshold),
            None => return,
        };
        if count <= join_threshold {
            self.merge(id, None);
            return;
        }

        // Concurrent splits merged through the underlying set can leave
        // sibling ranges overlapping. Scan sorted neighbors from the top;
        // fold each overlapping pair into one child and skip the pair,
        // since our snapshot of it is stale after the merge.
        let is_leaf = self.nodes.get(&id).is_some_and(|node| node.is_leaf_node());
        if !is_leaf {
            let mut entries: Vec<RangeEntry> = match self.nodes.get(&id) {
                Some(node) => node.entries().cloned().collect(),
                None => return,
            };
            entries.sort_by(entry_order);
            let mut finger = entries.len() as isize - 1;
            while finger > 0 {
                let left = &entries[finger as usize - 1];
                let right = &entries[finger as usize];
                if disjoint(left, right) {
                    finger -= 1;
                    continue;
                }
                tracing::debug!(node = %id, ?left, ?right, "overlapping children; merging");
                if let (Some(left_child), Some(right_child)) = (left.child_id(), right.child_id()) {
                    if contained_in(left, right) {
                        self.merge(left_child, Some(right_child));
                    } else {
                        self.merge(right_child, Some(left_child));
                    }
                }
                finger -= 2;
            }
        }

        let (count, split_threshold) = match self.nodes.get(&id) {
            Some(node) => (node.entry_count(), node.split_threshold),
            None => return,
        };
        if count > split_threshold {
            self.split(id);
        }

        // Refresh our summary entry in every resolvable parent.
        let (range_min, range_max, parents) = match self.nodes.get(&id) {
            Some(node) => {
                let (min, max) = node.compute_range();
                (min, max, node.parents().collect::<Vec<_>>())
            }
            None => return,
        };
        for parent_id in parents {
            let Some(parent) = self.nodes.get_mut(&parent_id) else { continue };
            let current = parent.entries().any(|entry| {
                entry.min == range_min && entry.max == range_max && entry.child_id() == Some(id)
            });
            if !current {
                parent.remove_child_entries(id);
                parent.add_entry(RangeEntry::child(range_min.clone(), range_max.clone(), id));
            }
        }

        if self.nodes.get(&id).is_some_and(|node| node.entry_count() == 0) {
            self.delete(id);
        }
    }

    /// Detach a node: remove its summary entry from every resolvable
    /// parent and drop all parent back-links.
    pub fn delete(&mut self, id: NodeId) {
        let parents: Vec<NodeId> = match self.nodes.get(&id) {
            Some(node) => node.parents().collect(),
            None => return,
        };
        for parent in &parents {
            if let Some(parent) = self.nodes.get_mut(parent) {
                parent.remove_child_entries(id);
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            for parent in parents {
                node.remove_parent(parent);
            }
        }
    }

    /// Fold this node into a sibling. With no sibling given, pick the
    /// lexicographically closest other child among all parents. A root has
    /// no sibling; it only collapses the tree when a single child entry is
    /// left, promoting that child to root.
    pub fn merge(&mut self, id: NodeId, sibling: Option<NodeId>) {
        let Some(node) = self.nodes.get(&id) else { return };
        let parents: Vec<NodeId> = node.parents().collect();

        if parents.is_empty() {
            if node.entry_count() == 1 && !node.is_leaf_node() {
                let child = node.entries().next().and_then(RangeEntry::child_id);
                if let Some(child) = child {
                    if let Some(child_node) = self.nodes.get_mut(&child) {
                        child_node.remove_parent(id);
                    }
                    self.set_root(child);
                }
            }
            return;
        }

        let sibling = sibling.or_else(|| self.select_sibling(id, &parents));
        let Some(sibling_id) = sibling else { return };

        self.merge_count += 1;
        tracing::debug!(node = %id, sibling = %sibling_id, "merging into sibling");
        self.delete(id);
        let entries: Vec<RangeEntry> = match self.nodes.get(&id) {
            Some(node) => node.entries().cloned().collect(),
            None => return,
        };
        for entry in entries {
            if let Some(sibling_node) = self.nodes.get_mut(&sibling_id) {
                sibling_node.add_entry(entry.clone());
            }
            if let Some(child) = entry.child_id() {
                if let Some(child_node) = self.nodes.get_mut(&child) {
                    child_node.add_parent(sibling_id);
                    child_node.remove_parent(id);
                }
            }
        }
        self.do_check(sibling_id);
    }

    /// The other child, across all parents, whose range endpoints share the
    /// most prefix with ours. First candidate wins ties.
    fn select_sibling(&self, id: NodeId, parents: &[NodeId]) -> Option<NodeId> {
        let node = self.nodes.get(&id)?;
        let (range_min, range_max) = node.compute_range();
        let mut best: Option<(u128, NodeId)> = None;
        for parent in parents {
            let Some(parent) = self.nodes.get(parent) else { continue };
            for entry in parent.entries() {
                let Some(candidate) = entry.child_id() else { continue };
                if candidate == id {
                    continue;
                }
                let score = range_affinity(&range_min, &range_max, entry);
                if best.is_none_or(|(top, _)| score > top) {
                    best = Some((score, candidate));
                }
            }
        }
        return best.map(|(_, candidate)| candidate);
    }

    /// Split off a sibling carrying roughly half of this node's entries,
    /// partitioned around the median boundary value.
    pub fn split(&mut self, id: NodeId) {
        let (entries, split_threshold) = match self.nodes.get(&id) {
            Some(node) => (node.entries().cloned().collect::<Vec<_>>(), node.split_threshold),
            None => return,
        };

        let mut boundaries: Vec<Key> = Vec::new();
        for entry in &entries {
            if let Some(min) = &entry.min {
                if !boundaries.contains(min) {
                    boundaries.push(min.clone());
                }
            }
            if let Some(max) = &entry.max {
                if !boundaries.contains(max) {
                    boundaries.push(max.clone());
                }
            }
        }
        boundaries.sort();
        if boundaries.len() < 2 {
            // A node with a single distinct boundary value cannot be
            // bisected by key.
            return;
        }
        self.split_count += 1;
        let median = boundaries[boundaries.len() >> 1].clone();

        let mut left: Vec<RangeEntry> = Vec::new();
        let mut right: Vec<RangeEntry> = Vec::new();
        for entry in &entries {
            match (&entry.min, &entry.max) {
                (None, _) => left.push(entry.clone()),
                (_, None) => right.push(entry.clone()),
                (Some(min), Some(max)) => {
                    if *max < median {
                        left.push(entry.clone());
                    } else if *min > median {
                        right.push(entry.clone());
                    } else if prefix_len(min, &median) < prefix_len(max, &median) {
                        left.push(entry.clone());
                    } else {
                        right.push(entry.clone());
                    }
                }
            }
        }

        if left.is_empty() || right.is_empty() {
            // Pathological key distribution; a random cut still guarantees
            // the node shrinks.
            use rand::seq::SliceRandom;
            let mut shuffled = entries.clone();
            shuffled.shuffle(&mut rand::thread_rng());
            let cut = (split_threshold >> 1).min(shuffled.len());
            right = shuffled.split_off(cut);
        }

        // A parentless node first puts a fresh root above itself.
        let parents: Vec<NodeId> = match self.nodes.get(&id) {
            Some(node) => node.parents().collect(),
            None => return,
        };
        if parents.is_empty() {
            let new_root = self.fresh_node();
            let new_root_id = self.register(new_root);
            if let Some(node) = self.nodes.get_mut(&id) {
                node.add_parent(new_root_id);
            }
            self.set_root(new_root_id);
        }

        let parents: Vec<NodeId> = match self.nodes.get(&id) {
            Some(node) => node.parents().collect(),
            None => return,
        };
        let mut sibling = self.fresh_node();
        let sibling_id = sibling.id;
        for parent in &parents {
            sibling.add_parent(*parent);
        }
        self.register(sibling);

        tracing::debug!(node = %id, sibling = %sibling_id, moved = right.len(), "splitting node");
        for entry in right {
            if let Some(sibling_node) = self.nodes.get_mut(&sibling_id) {
                sibling_node.add_entry(entry.clone());
            }
            if let Some(child) = entry.child_id() {
                if let Some(child_node) = self.nodes.get_mut(&child) {
                    child_node.add_parent(sibling_id);
                    child_node.remove_parent(id);
                }
            }
            if let Some(node) = self.nodes.get_mut(&id) {
                node.remove_entry(&entry);
            }
        }

        // Force the sibling to register its own summary entry upward.
        self.do_check(sibling_id);
    }

    /// Render the tree shape through `tracing::debug`, flagging children
    /// that cannot be resolved locally.
    pub fn debug_dump(&self) {
        if let Some(root) = self.root() {
            self.dump_node(root, 0);
        }
    }

    fn dump_node(&self, id: NodeId, depth: usize) {
        let indent = "  ".repeat(depth);
        let Some(node) = self.nodes.get(&id) else {
            tracing::debug!("{indent}{id} MISSING");
            return;
        };
        let parents: Vec<String> = node.parents().map(|parent| parent.to_string()).collect();
        tracing::debug!("{indent}{id} parents [{}]", parents.join(", "));
        for entry in node.entries() {
            match &entry.target {
                Target::Payload(value) => {
                    tracing::debug!("{indent} - [{:?} - {:?}] = {value}", entry.min, entry.max);
                }
                Target::Child(child) => {
                    tracing::debug!("{indent} - [{:?} - {:?}] -> {child}", entry.min, entry.max);
                    self.dump_node(*child, depth + 1);
                }
            }
        }
    }
}

impl<S: OrSet<Item> + Default> Default for Store<S> {
    fn default() -> Self {
        return Self::new();
    }
}
