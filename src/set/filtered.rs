//! Observed-remove set with bloom-filter tombstones.
//!
//! Removals tombstone an entry's tag into the last filter of a growable
//! chain. Each filter in the chain is sized at double the previous one's
//! capacity, and a new filter is started once the current one gets within a
//! fixed slack of overflowing, so the false-positive rate stays bounded as
//! tombstone volume grows. Filters at the same chain index are always built
//! from the same sizing formula, which keeps the index-wise bitwise-OR in
//! `combine` well defined between replicas.

use std::hash::Hash;

use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde::Serialize;

use crate::bloom::BloomFilter;
use crate::bloom::EXPECTED_ELEMENTS;

use super::fresh_tag;
use super::OrSet;
use super::Replicated;
use super::Tag;

/// Remaining headroom in the last filter that triggers appending the next,
/// double-capacity filter before tombstoning into it.
pub const BLOOM_SLACK: usize = 550;

/// An OR-Set whose tombstones live in an append-only chain of bloom filters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilteredOrSet<T: Eq + Hash> {
    entries: FxHashSet<(T, Tag)>,
    filters: Vec<BloomFilter>,
    dirty: bool,
}

impl<T: Eq + Hash> FilteredOrSet<T> {
    /// Create an empty set with a single filter at the default capacity.
    pub fn new() -> FilteredOrSet<T> {
        return FilteredOrSet {
            entries: FxHashSet::default(),
            filters: vec![BloomFilter::new(EXPECTED_ELEMENTS)],
            // A fresh replica counts as dirty so it announces itself.
            dirty: true,
        };
    }

    /// True iff some filter in the chain reports `tag` removed.
    fn removed(&self, tag: Tag) -> bool {
        return self.filters.iter().any(|filter| filter.lookup(&tag.to_le_bytes()));
    }
}

impl<T: Eq + Hash> Default for FilteredOrSet<T> {
    fn default() -> Self {
        return Self::new();
    }
}

impl<T: Clone + Eq + Hash> OrSet<T> for FilteredOrSet<T> {
    fn add(&mut self, value: T) {
        if !self.lookup(&value) {
            self.dirty = true;
            self.entries.insert((value, fresh_tag()));
        }
    }

    fn remove(&mut self, value: &T) {
        let removals: Vec<(T, Tag)> = self
            .entries
            .iter()
            .filter(|entry| &entry.0 == value)
            .cloned()
            .collect();
        for entry in removals {
            self.dirty = true;
            self.entries.remove(&entry);
            let last = self.filters.last().expect("filter chain is never empty");
            if last.estimated_len() >= last.capacity().saturating_sub(BLOOM_SLACK) as f64 {
                let doubled = last.capacity() * 2;
                self.filters.push(BloomFilter::new(doubled));
            }
            let last = self.filters.last_mut().expect("filter chain is never empty");
            last.add(&entry.1.to_le_bytes());
        }
    }

    fn lookup(&self, value: &T) -> bool {
        return self.entries.iter().any(|entry| &entry.0 == value);
    }

    fn len(&self) -> usize {
        return self.entries.len();
    }

    fn iter<'a>(&'a self) -> impl Iterator<Item = &'a T> where T: 'a {
        return self.entries.iter().map(|entry| &entry.0);
    }

    fn is_dirty(&self) -> bool {
        return self.dirty;
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl<T: Clone + Eq + Hash> Replicated for FilteredOrSet<T> {
    /// Union the filter chains index-wise, then rebuild the entry set: the
    /// intersection survives outright, and an entry seen on only one side
    /// survives unless some combined filter has proof of its removal.
    fn combine(&mut self, other: &Self) {
        for index in 0..self.filters.len().max(other.filters.len()) {
            match (index < self.filters.len(), other.filters.get(index)) {
                (true, Some(theirs)) => self.filters[index].combine(theirs),
                (false, Some(theirs)) => self.filters.push(theirs.clone()),
                (_, None) => {}
            }
        }

        let mut merged: FxHashSet<(T, Tag)> =
            self.entries.intersection(&other.entries).cloned().collect();
        for entry in self.entries.symmetric_difference(&other.entries) {
            if !self.removed(entry.1) {
                merged.insert(entry.clone());
            }
        }

        self.dirty |= merged != self.entries;
        self.entries = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_lookup() {
        let mut set = FilteredOrSet::new();
        set.add("a");
        assert!(set.lookup(&"a"));
        assert_eq!(set.len(), 1);
        // A second add of a visible value is a no-op.
        set.add("a");
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_tombstones_the_tag() {
        let mut set = FilteredOrSet::new();
        set.add("a");
        let tag = set.entries.iter().next().map(|entry| entry.1).unwrap();
        set.remove(&"a");
        assert!(!set.lookup(&"a"));
        assert!(set.removed(tag));
    }

    #[test]
    fn removal_survives_combine_from_stale_replica() {
        let mut a = FilteredOrSet::new();
        a.add("x");
        let mut b = a.clone();
        a.remove(&"x");
        // b still carries the entry; a's filter proves it removed.
        a.combine(&b);
        assert!(!a.lookup(&"x"));
        b.combine(&a);
        assert!(!b.lookup(&"x"));
    }

    #[test]
    fn concurrent_add_survives_remote_remove() {
        let mut a = FilteredOrSet::new();
        let mut b = FilteredOrSet::new();
        a.add("x");
        b.add("x");
        a.remove(&"x");
        a.combine(&b);
        b.combine(&a);
        assert!(a.lookup(&"x"));
        assert!(b.lookup(&"x"));
    }

    #[test]
    fn combine_is_idempotent() {
        let mut a = FilteredOrSet::new();
        a.add("x");
        a.add("y");
        a.remove(&"y");
        let snapshot = a.clone();
        a.combine(&snapshot);
        assert_eq!(a.entries, snapshot.entries);
    }

    #[test]
    fn chain_rolls_over_before_the_filter_fills() {
        let mut set = FilteredOrSet::new();
        // Capacity 2000 minus slack 550: the 1451st removal starts filter #2.
        for n in 0..1500u32 {
            set.add(n);
            set.remove(&n);
        }
        assert_eq!(set.filters.len(), 2);
        assert_eq!(set.filters[1].capacity(), 2 * EXPECTED_ELEMENTS);
    }

    #[test]
    fn combine_adopts_longer_chains() {
        let mut a = FilteredOrSet::new();
        let mut b = FilteredOrSet::new();
        for n in 0..1500u32 {
            b.add(n);
            b.remove(&n);
        }
        a.add(9999u32);
        a.combine(&b);
        assert_eq!(a.filters.len(), b.filters.len());
        assert!(a.lookup(&9999));
        assert!(!a.lookup(&0));
    }
}
