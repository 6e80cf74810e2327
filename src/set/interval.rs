//! Observed-remove set backed by interval-compressed version vectors.
//!
//! Instead of remembering removals, each replica remembers which clock ticks
//! from every replica it has already observed, as an ordered list of disjoint
//! closed intervals. An entry missing from one side of a merge was either
//! not yet seen there (one vector does not cover its tick) or removed (both
//! vectors cover it). Space is O(replicas x gaps) rather than
//! O(historical removals); with mostly in-order delivery each replica's
//! list collapses to a single interval.

use std::hash::Hash;

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde::Serialize;
use smallvec::SmallVec;

use super::OrSet;
use super::Replicated;

/// Identifies the replica that created an entry.
pub type ReplicaId = u128;

/// Closed interval of observed clock ticks.
type Interval = (u64, u64);

type IntervalSeq = SmallVec<[Interval; 4]>;

/// Per-replica observed clock ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalVector {
    seen: FxHashMap<ReplicaId, IntervalSeq>,
}

/// Fold adjacent or overlapping intervals together, scanning from the top so
/// removals never shift unvisited elements. Expects the list sorted by low
/// endpoint.
fn collapse(intervals: &mut IntervalSeq) {
    let mut index = intervals.len();
    while index > 1 {
        index -= 1;
        let (low, high) = intervals[index];
        let lower = &mut intervals[index - 1];
        if lower.1 >= low.saturating_sub(1) {
            *lower = (lower.0.min(low), lower.1.max(high));
            intervals.remove(index);
        }
    }
}

impl IntervalVector {
    /// True iff `clock` from `replica` has been observed.
    pub fn contains(&self, replica: ReplicaId, clock: u64) -> bool {
        return self
            .seen
            .get(&replica)
            .is_some_and(|intervals| intervals.iter().any(|&(low, high)| low <= clock && clock <= high));
    }

    /// Record one observed clock tick.
    pub fn observe(&mut self, replica: ReplicaId, clock: u64) {
        let intervals = self.seen.entry(replica).or_default();
        intervals.push((clock, clock));
        intervals.sort_unstable_by_key(|interval| interval.0);
        collapse(intervals);
    }

    /// Union another vector's intervals into this one, re-collapsing each
    /// touched replica's list.
    pub fn union(&mut self, other: &IntervalVector) {
        for (replica, theirs) in &other.seen {
            let intervals = self.seen.entry(*replica).or_default();
            intervals.extend(theirs.iter().copied());
            intervals.sort_unstable_by_key(|interval| interval.0);
            collapse(intervals);
        }
    }
}

/// An OR-Set that encodes removals purely as covered clock ticks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntervalOrSet<T: Eq + Hash> {
    entries: FxHashSet<(T, ReplicaId, u64)>,
    vector: IntervalVector,
    id: ReplicaId,
    clock: u64,
    dirty: bool,
}

impl<T: Eq + Hash> IntervalOrSet<T> {
    /// Create an empty set under a fresh replica identity.
    pub fn new() -> IntervalOrSet<T> {
        return IntervalOrSet {
            entries: FxHashSet::default(),
            vector: IntervalVector::default(),
            id: rand::random(),
            clock: 0,
            dirty: false,
        };
    }

    /// This replica's identifier.
    pub fn replica_id(&self) -> ReplicaId {
        return self.id;
    }

    /// Re-identify after cloning this state onto a new peer. A copied
    /// replica must not continue another replica's clock.
    pub fn fork(&mut self) {
        self.id = rand::random();
        self.clock = 0;
    }

    /// Advance the local clock one tick and mark it observed. Every local
    /// add and remove is one tick.
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.vector.observe(self.id, self.clock);
        return self.clock;
    }
}

impl<T: Eq + Hash> Default for IntervalOrSet<T> {
    fn default() -> Self {
        return Self::new();
    }
}

impl<T: Clone + Eq + Hash> OrSet<T> for IntervalOrSet<T> {
    fn add(&mut self, value: T) {
        let clock = self.tick();
        self.entries.insert((value, self.id, clock));
        self.dirty = true;
    }

    fn remove(&mut self, value: &T) {
        let removals: Vec<(T, ReplicaId, u64)> = self
            .entries
            .iter()
            .filter(|entry| &entry.0 == value)
            .cloned()
            .collect();
        if !removals.is_empty() {
            for entry in removals {
                self.entries.remove(&entry);
            }
            // The removal itself is just another observed tick; no
            // tombstone record is kept.
            self.tick();
            self.dirty = true;
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

impl<T: Clone + Eq + Hash> Replicated for IntervalOrSet<T> {
    /// Keep the entry intersection; an entry on only one side is dropped
    /// only when both vectors cover its tick (seen everywhere, so its
    /// absence means removal). Vectors are unioned afterwards, so the
    /// causal test runs against the pre-merge views.
    fn combine(&mut self, other: &Self) {
        let mut merged: FxHashSet<(T, ReplicaId, u64)> =
            self.entries.intersection(&other.entries).cloned().collect();
        for entry in self.entries.symmetric_difference(&other.entries) {
            let covered = self.vector.contains(entry.1, entry.2)
                && other.vector.contains(entry.1, entry.2);
            if !covered {
                merged.insert(entry.clone());
            }
        }
        self.dirty |= merged != self.entries;
        self.entries = merged;
        self.vector.union(&other.vector);
    }
}
