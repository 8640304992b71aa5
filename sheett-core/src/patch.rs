//! Patches: bounded sets of stamped field changes.
//!
//! A patch is the unit exchanged between replicas. Applying a patch is
//! idempotent and order-independent because every change carries the
//! [`Stamp`] that decides it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::stamp::{Stamp, VersionVector};
use crate::value::CellValue;

/// Addressable field inside a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Target {
    /// A field of a table row.
    Cell {
        table: String,
        row_id: String,
        field: String,
    },
    /// A top-level value.
    Value { key: String },
}

impl Target {
    pub fn cell(table: impl Into<String>, row_id: impl Into<String>, field: impl Into<String>) -> Self {
        Target::Cell {
            table: table.into(),
            row_id: row_id.into(),
            field: field.into(),
        }
    }

    pub fn value(key: impl Into<String>) -> Self {
        Target::Value { key: key.into() }
    }
}

/// Current content of a field: a value or a deletion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldState {
    Value(CellValue),
    Tombstone,
}

impl FieldState {
    pub fn value(&self) -> Option<&CellValue> {
        match self {
            FieldState::Value(v) => Some(v),
            FieldState::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, FieldState::Tombstone)
    }
}

/// A stored field: content plus the stamp that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub state: FieldState,
    pub stamp: Stamp,
}

/// One stamped change to one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub target: Target,
    pub state: FieldState,
    pub stamp: Stamp,
}

impl Change {
    pub fn entry(&self) -> Entry {
        Entry {
            state: self.state.clone(),
            stamp: self.stamp.clone(),
        }
    }
}

/// An ordered set of field changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub changes: Vec<Change>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// Append all changes of `other`.
    pub fn extend(&mut self, other: Patch) {
        self.changes.extend(other.changes);
    }

    /// Collapse changes to one per target, keeping the greatest stamp.
    ///
    /// The result merges to the same state as the original patch.
    pub fn coalesce(self) -> Patch {
        let mut latest: BTreeMap<Target, Change> = BTreeMap::new();
        for change in self.changes {
            match latest.get(&change.target) {
                Some(existing) if existing.stamp >= change.stamp => {}
                _ => {
                    latest.insert(change.target.clone(), change);
                }
            }
        }
        Patch {
            changes: latest.into_values().collect(),
        }
    }

    /// Version vector covering every stamp in this patch.
    pub fn version_vector(&self) -> VersionVector {
        let mut vv = VersionVector::new();
        for change in &self.changes {
            vv.observe(&change.stamp);
        }
        vv
    }
}

impl FromIterator<Change> for Patch {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        Patch {
            changes: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str, counter: u64, replica: &str) -> Change {
        Change {
            target: Target::value(key),
            state: FieldState::Value(CellValue::from(value)),
            stamp: Stamp::new(counter, replica),
        }
    }

    #[test]
    fn test_coalesce_keeps_latest_per_target() {
        let patch: Patch = vec![
            set("name", "a", 1, "A"),
            set("name", "c", 3, "A"),
            set("name", "b", 2, "B"),
            set("description", "d", 1, "B"),
        ]
        .into_iter()
        .collect();

        let coalesced = patch.coalesce();
        assert_eq!(coalesced.len(), 2);
        let name = coalesced
            .iter()
            .find(|c| c.target == Target::value("name"))
            .unwrap();
        assert_eq!(name.state, FieldState::Value(CellValue::from("c")));
    }

    #[test]
    fn test_patch_version_vector() {
        let patch: Patch = vec![set("x", "1", 4, "A"), set("y", "2", 9, "B"), set("z", "3", 2, "A")]
            .into_iter()
            .collect();
        let vv = patch.version_vector();
        assert_eq!(vv.get("A"), 4);
        assert_eq!(vv.get("B"), 9);
    }

    #[test]
    fn test_field_state_helpers() {
        assert!(FieldState::Tombstone.is_tombstone());
        assert_eq!(FieldState::Tombstone.value(), None);
        let v = FieldState::Value(CellValue::from(1.0));
        assert_eq!(v.value(), Some(&CellValue::from(1.0)));
    }
}
