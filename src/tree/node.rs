//! A single tree node: a replicated set of range entries and parent links.

use crate::set::FilteredOrSet;
use crate::set::OrSet;

use super::Item;
use super::Key;
use super::NodeId;
use super::RangeEntry;

/// Default range for randomized split thresholds.
pub const SPLIT_THRESHOLD: std::ops::RangeInclusive<usize> = 24..=48;

/// Default range for randomized join thresholds.
pub const JOIN_THRESHOLD: std::ops::RangeInclusive<usize> = 8..=12;

/// One node of the range index.
///
/// `state` is a replica: independent copies of the same node on different
/// peers converge through the set's `combine`. Thresholds are drawn per
/// node so the fleet never splits or merges in lockstep.
#[derive(Clone, Debug)]
pub struct Node<S = FilteredOrSet<Item>> {
    pub id: NodeId,
    pub state: S,
    pub split_threshold: usize,
    pub join_threshold: usize,
    pub(crate) should_check: bool,
}

impl<S: OrSet<Item> + Default> Node<S> {
    /// Create an empty node with thresholds drawn from the default ranges.
    pub fn new() -> Node<S> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let split = rng.gen_range(SPLIT_THRESHOLD);
        let join = rng.gen_range(JOIN_THRESHOLD);
        return Node::with_thresholds(split, join);
    }

    /// Create an empty node with fixed thresholds.
    pub fn with_thresholds(split_threshold: usize, join_threshold: usize) -> Node<S> {
        return Node {
            id: NodeId::fresh(),
            state: S::default(),
            split_threshold,
            join_threshold,
            should_check: false,
        };
    }
}

impl<S: OrSet<Item> + Default> Default for Node<S> {
    fn default() -> Self {
        return Self::new();
    }
}

impl<S: OrSet<Item>> Node<S> {
    /// Wrap a replica fetched from a peer in a local node. Thresholds are a
    /// local matter and are drawn fresh.
    pub fn from_state(id: NodeId, state: S) -> Node<S> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        return Node {
            id,
            state,
            split_threshold: rng.gen_range(SPLIT_THRESHOLD),
            join_threshold: rng.gen_range(JOIN_THRESHOLD),
            should_check: false,
        };
    }

    /// The node's range entries, leaving parent links aside.
    pub fn entries(&self) -> impl Iterator<Item = &RangeEntry> {
        return self.state.iter().filter_map(|item| match item {
            Item::Range(entry) => Some(entry),
            Item::Parent(_) => None,
        });
    }

    /// Number of range entries.
    pub fn entry_count(&self) -> usize {
        return self.entries().count();
    }

    /// Parent back-links.
    pub fn parents(&self) -> impl Iterator<Item = NodeId> {
        return self.state.iter().filter_map(|item| match item {
            Item::Parent(id) => Some(*id),
            Item::Range(_) => None,
        });
    }

    pub fn add_parent(&mut self, parent: NodeId) {
        self.state.add(Item::Parent(parent));
    }

    pub fn remove_parent(&mut self, parent: NodeId) {
        self.state.remove(&Item::Parent(parent));
    }

    pub fn add_entry(&mut self, entry: RangeEntry) {
        self.state.add(Item::Range(entry));
    }

    pub fn remove_entry(&mut self, entry: &RangeEntry) {
        self.state.remove(&Item::Range(entry.clone()));
    }

    /// Drop every entry delegating to `child`.
    pub fn remove_child_entries(&mut self, child: NodeId) {
        let stale: Vec<RangeEntry> = self
            .entries()
            .filter(|entry| entry.child_id() == Some(child))
            .cloned()
            .collect();
        for entry in stale {
            self.remove_entry(&entry);
        }
    }

    /// True when every entry is a payload point (vacuously true when
    /// empty).
    pub fn is_leaf_node(&self) -> bool {
        return self.entries().all(RangeEntry::is_leaf);
    }

    /// Distinct child node ids, in no particular order.
    pub fn children(&self) -> Vec<NodeId> {
        let mut result = Vec::new();
        for entry in self.entries() {
            if let Some(child) = entry.child_id() {
                if !result.contains(&child) {
                    result.push(child);
                }
            }
        }
        return result;
    }

    /// Aggregate key range over this node's entries, ignoring unbounded
    /// sentinels: the least concrete `min` and the greatest concrete `max`.
    pub fn compute_range(&self) -> (Option<Key>, Option<Key>) {
        let mut range_min: Option<Key> = None;
        let mut range_max: Option<Key> = None;
        for entry in self.entries() {
            if let Some(min) = &entry.min {
                if range_min.as_ref().is_none_or(|current| min < current) {
                    range_min = Some(min.clone());
                }
            }
            if let Some(max) = &entry.max {
                if range_max.as_ref().is_none_or(|current| max > current) {
                    range_max = Some(max.clone());
                }
            }
        }
        return (range_min, range_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Target;

    fn leaf_node() -> Node {
        let mut node: Node = Node::with_thresholds(4, 0);
        node.add_entry(RangeEntry::leaf("a", "1"));
        node.add_entry(RangeEntry::leaf("b", "2"));
        return node;
    }

    #[test]
    fn entries_and_parents_are_partitioned() {
        let mut node = leaf_node();
        node.add_parent(NodeId(7));
        assert_eq!(node.entry_count(), 2);
        assert_eq!(node.parents().collect::<Vec<_>>(), vec![NodeId(7)]);
    }

    #[test]
    fn leaf_detection() {
        let mut node = leaf_node();
        assert!(node.is_leaf_node());
        node.add_entry(RangeEntry::child(Some("a".into()), Some("z".into()), NodeId(9)));
        assert!(!node.is_leaf_node());
    }

    #[test]
    fn compute_range_spans_entries() {
        let node = leaf_node();
        assert_eq!(node.compute_range(), (Some("a".to_string()), Some("b".to_string())));
    }

    #[test]
    fn compute_range_ignores_unbounded() {
        let mut node: Node = Node::with_thresholds(4, 0);
        node.add_entry(RangeEntry::child(None, Some("c".into()), NodeId(1)));
        node.add_entry(RangeEntry::child(Some("c".into()), Some("f".into()), NodeId(2)));
        assert_eq!(node.compute_range(), (Some("c".to_string()), Some("f".to_string())));
    }

    #[test]
    fn remove_child_entries_only_hits_that_child() {
        let mut node: Node = Node::with_thresholds(4, 0);
        node.add_entry(RangeEntry::child(Some("a".into()), Some("c".into()), NodeId(1)));
        node.add_entry(RangeEntry::child(Some("d".into()), Some("f".into()), NodeId(2)));
        node.remove_child_entries(NodeId(1));
        let remaining: Vec<_> = node.entries().collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].target, Target::Child(NodeId(2)));
    }
}
