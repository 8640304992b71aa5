//! Logical timestamps for field-level last-writer-wins merging.
//!
//! Every field write carries a [`Stamp`] `(counter, replica_id)`. Stamps are
//! totally ordered: the counter decides first, and equal counters fall back
//! to the replica id (the lexically greater id wins). The counter is a
//! Lamport clock: a replica advances past every counter it observes, so a
//! local write made after merging a remote change always supersedes it.
//!
//! A [`VersionVector`] records, per replica, the highest counter a party
//! has seen. It is the cursor used by `diff_since` during reconciliation.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Logical timestamp attached to a single field write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub counter: u64,
    pub replica_id: String,
}

impl Stamp {
    pub fn new(counter: u64, replica_id: impl Into<String>) -> Self {
        Self {
            counter,
            replica_id: replica_id.into(),
        }
    }
}

impl Ord for Stamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.replica_id.cmp(&other.replica_id))
    }
}

impl PartialOrd for Stamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.replica_id)
    }
}

/// Per-replica Lamport clock.
#[derive(Debug, Clone)]
pub struct Clock {
    replica_id: String,
    counter: u64,
}

impl Clock {
    pub fn new(replica_id: impl Into<String>) -> Self {
        Self::with_counter(replica_id, 0)
    }

    /// Resume a clock from a persisted counter.
    pub fn with_counter(replica_id: impl Into<String>, counter: u64) -> Self {
        Self {
            replica_id: replica_id.into(),
            counter,
        }
    }

    /// Advance the clock and return a fresh stamp for a local write.
    pub fn tick(&mut self) -> Stamp {
        self.counter += 1;
        Stamp::new(self.counter, self.replica_id.clone())
    }

    /// Fold in a counter seen on a remote stamp.
    pub fn observe(&mut self, counter: u64) {
        if counter > self.counter {
            self.counter = counter;
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }
}

/// Highest counter seen per replica.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter recorded for `replica_id` (0 when unknown).
    pub fn get(&self, replica_id: &str) -> u64 {
        self.0.get(replica_id).copied().unwrap_or(0)
    }

    /// Record a stamp, keeping the per-replica maximum.
    pub fn observe(&mut self, stamp: &Stamp) {
        let entry = self.0.entry(stamp.replica_id.clone()).or_insert(0);
        if stamp.counter > *entry {
            *entry = stamp.counter;
        }
    }

    /// Whether a write with this stamp is already accounted for.
    pub fn covers(&self, stamp: &Stamp) -> bool {
        stamp.counter <= self.get(&stamp.replica_id)
    }

    /// Pointwise maximum with another vector.
    pub fn join(&mut self, other: &VersionVector) {
        for (replica, counter) in &other.0 {
            let entry = self.0.entry(replica.clone()).or_insert(0);
            if *counter > *entry {
                *entry = *counter;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut vv = VersionVector::new();
        for (replica, counter) in iter {
            vv.observe(&Stamp::new(counter, replica));
        }
        vv
    }
}
