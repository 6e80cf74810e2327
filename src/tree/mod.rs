//! A replicated range index: a tree of nodes whose contents are themselves
//! replicated sets.
//!
//! Nodes reference each other only by stable identifier, resolved through
//! the store (or any other [`NodeSource`]); there are no owned child
//! pointers. Each node's set holds two kinds of replicated items: range
//! entries pointing down at payloads or child nodes, and parent back-links
//! pointing up. Concurrent splits and merges can transiently leave a node
//! with several parents or overlapping siblings; the rebalance pass in
//! [`Store`] repairs shape instead of preventing it.

pub mod node;
pub mod query;
pub mod store;

use std::cmp::Ordering;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

pub use node::Node;
pub use query::NodeSource;
pub use query::query_leaf_item;
pub use store::Store;

/// Keys are strings compared lexicographically by byte.
pub type Key = String;

/// Stable random identifier of a tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn fresh() -> NodeId {
        return NodeId(rand::random());
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a range entry points at.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// A stored value; the entry is a leaf with `min == max`.
    Payload(String),
    /// A child node covering the entry's range.
    Child(NodeId),
}

/// One range entry in a node. `None` bounds are unbounded: negative
/// infinity as a `min`, positive infinity as a `max`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RangeEntry {
    pub min: Option<Key>,
    pub max: Option<Key>,
    pub target: Target,
}

impl RangeEntry {
    /// A point entry holding a payload.
    pub fn leaf(key: &str, value: &str) -> RangeEntry {
        return RangeEntry {
            min: Some(key.to_string()),
            max: Some(key.to_string()),
            target: Target::Payload(value.to_string()),
        };
    }

    /// An entry delegating a range to a child node.
    pub fn child(min: Option<Key>, max: Option<Key>, id: NodeId) -> RangeEntry {
        return RangeEntry { min, max, target: Target::Child(id) };
    }

    /// True for payload-bearing point entries.
    pub fn is_leaf(&self) -> bool {
        return matches!(self.target, Target::Payload(_));
    }

    /// The child node this entry delegates to, if it is not a leaf.
    pub fn child_id(&self) -> Option<NodeId> {
        return match self.target {
            Target::Child(id) => Some(id),
            Target::Payload(_) => None,
        };
    }

    /// True iff `key` falls inside this entry's (closed) range.
    pub fn contains(&self, key: &str) -> bool {
        let above = self.min.as_deref().is_none_or(|min| min <= key);
        let below = self.max.as_deref().is_none_or(|max| key <= max);
        return above && below;
    }

    /// True for an exact point hit on a payload entry.
    pub fn matches_point(&self, key: &str) -> bool {
        return self.is_leaf()
            && self.min.as_deref() == Some(key)
            && self.max.as_deref() == Some(key);
    }
}

/// Replicated item in a node's set: a range entry or a parent back-link.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Item {
    Range(RangeEntry),
    Parent(NodeId),
}

/// Order lower bounds; `None` is negative infinity.
pub(crate) fn cmp_min(a: &Option<Key>, b: &Option<Key>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Order upper bounds; `None` is positive infinity.
pub(crate) fn cmp_max(a: &Option<Key>, b: &Option<Key>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Sort order for a node's entries: by lower bound, then upper.
pub(crate) fn entry_order(a: &RangeEntry, b: &RangeEntry) -> Ordering {
    cmp_min(&a.min, &b.min).then_with(|| cmp_max(&a.max, &b.max))
}

/// Disjointness of a sorted `left`/`right` pair: no key can be in both iff
/// `left.max < right.min`. An unbounded upper bound reaches everything to
/// its right; an unbounded lower bound reaches everything to its left.
pub(crate) fn disjoint(left: &RangeEntry, right: &RangeEntry) -> bool {
    match (&left.max, &right.min) {
        (Some(left_max), Some(right_min)) => left_max < right_min,
        _ => false,
    }
}

/// True iff `inner`'s range lies entirely within `outer`'s.
pub(crate) fn contained_in(inner: &RangeEntry, outer: &RangeEntry) -> bool {
    cmp_min(&outer.min, &inner.min) != Ordering::Greater
        && cmp_max(&inner.max, &outer.max) != Ordering::Greater
}

/// Length of the shared byte prefix of two keys.
pub fn prefix_len(a: &str, b: &str) -> usize {
    a.as_bytes().iter().zip(b.as_bytes()).take_while(|(x, y)| x == y).count()
}

/// Locality score: `2^(prefix+8)` plus the closeness of the first differing
/// byte. Prefix length dominates; the byte distance only breaks ties within
/// equal prefix length. The shift saturates at the integer width, where the
/// secondary term can no longer change the ordering.
pub fn weighted_prefix_score(a: &str, b: &str) -> u128 {
    let prefix = prefix_len(a, b);
    let distance = match (a.as_bytes().get(prefix), b.as_bytes().get(prefix)) {
        (Some(&x), Some(&y)) => x.abs_diff(y),
        _ => 0,
    };
    let shift = (prefix + 8).min(119) as u32;
    return (1u128 << shift) + (255 - distance) as u128;
}

/// Best weighted score between `key` and either of an entry's concrete
/// bounds; unbounded bounds contribute nothing.
pub(crate) fn entry_affinity(entry: &RangeEntry, key: &str) -> u128 {
    let low = entry.min.as_deref().map_or(0, |min| weighted_prefix_score(min, key));
    let high = entry.max.as_deref().map_or(0, |max| weighted_prefix_score(max, key));
    low.max(high)
}
