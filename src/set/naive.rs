//! Baseline observed-remove set with explicit tombstones.
//!
//! The insert and tombstone sets only ever grow, so space is proportional to
//! the total number of historical operations. This variant exists to measure
//! what the compacting designs save; see `benches/set_bench.rs`.

use std::hash::Hash;

use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde::Serialize;

use super::fresh_tag;
use super::OrSet;
use super::Replicated;
use super::Tag;

/// An OR-Set whose removals are recorded as explicit tombstoned entries.
/// Visible membership is `inserts \ tombstones`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NaiveOrSet<T: Eq + Hash> {
    inserts: FxHashSet<(T, Tag)>,
    tombstones: FxHashSet<(T, Tag)>,
    dirty: bool,
}

impl<T: Eq + Hash> NaiveOrSet<T> {
    /// Create an empty set.
    pub fn new() -> NaiveOrSet<T> {
        return NaiveOrSet {
            inserts: FxHashSet::default(),
            tombstones: FxHashSet::default(),
            dirty: false,
        };
    }

    fn visible(&self) -> impl Iterator<Item = &(T, Tag)> {
        return self.inserts.iter().filter(|entry| !self.tombstones.contains(entry));
    }
}

impl<T: Eq + Hash> Default for NaiveOrSet<T> {
    fn default() -> Self {
        return Self::new();
    }
}

impl<T: Clone + Eq + Hash> OrSet<T> for NaiveOrSet<T> {
    fn add(&mut self, value: T) {
        if !self.lookup(&value) {
            self.dirty = true;
            self.inserts.insert((value, fresh_tag()));
        }
    }

    fn remove(&mut self, value: &T) {
        let hit = self.visible().find(|entry| &entry.0 == value).cloned();
        if let Some(entry) = hit {
            self.dirty = true;
            self.tombstones.insert(entry);
        }
    }

    fn lookup(&self, value: &T) -> bool {
        return self.visible().any(|entry| &entry.0 == value);
    }

    fn len(&self) -> usize {
        return self.visible().count();
    }

    fn iter<'a>(&'a self) -> impl Iterator<Item = &'a T> where T: 'a {
        return self.visible().map(|entry| &entry.0);
    }

    fn is_dirty(&self) -> bool {
        return self.dirty;
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl<T: Clone + Eq + Hash> Replicated for NaiveOrSet<T> {
    /// Grow-only union of both component sets.
    fn combine(&mut self, other: &Self) {
        let mut changed = false;
        for entry in &other.inserts {
            changed |= self.inserts.insert(entry.clone());
        }
        for entry in &other.tombstones {
            changed |= self.tombstones.insert(entry.clone());
        }
        self.dirty |= changed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_lookup() {
        let mut set = NaiveOrSet::new();
        set.add("a");
        assert!(set.lookup(&"a"));
        assert!(!set.lookup(&"b"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_hides_value() {
        let mut set = NaiveOrSet::new();
        set.add("a");
        set.remove(&"a");
        assert!(!set.lookup(&"a"));
        assert_eq!(set.len(), 0);
        // The tombstoned entry is retained, not erased.
        assert_eq!(set.inserts.len(), 1);
        assert_eq!(set.tombstones.len(), 1);
    }

    #[test]
    fn concurrent_add_survives_remote_remove() {
        let mut a = NaiveOrSet::new();
        let mut b = NaiveOrSet::new();
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
        let mut a = NaiveOrSet::new();
        a.add("x");
        a.add("y");
        a.remove(&"y");
        let snapshot = a.clone();
        a.combine(&snapshot);
        assert_eq!(a.inserts, snapshot.inserts);
        assert_eq!(a.tombstones, snapshot.tombstones);
    }

    #[test]
    fn dirty_tracks_observable_changes() {
        let mut a = NaiveOrSet::new();
        assert!(!a.is_dirty());
        a.add("x");
        assert!(a.is_dirty());
        a.mark_clean();
        let snapshot = a.clone();
        a.combine(&snapshot);
        assert!(!a.is_dirty());
    }
}
