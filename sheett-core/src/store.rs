//! Mergeable key/value store with per-field stamps.
//!
//! ```text
//! MergeableStore
//!   ├── tables: table → row → field → Entry { state, stamp }
//!   ├── values: key → Entry { state, stamp }
//!   ├── clock:  Lamport counter for this replica
//!   └── listeners: row-id-set / cell / value notifications
//! ```
//!
//! Local writes tick the clock and return a [`Patch`] that can be shipped
//! to other replicas. `merge` applies each incoming change only if its
//! stamp is greater than the stored one, which makes merge commutative,
//! associative and idempotent. Deletions are tombstones, so an older write
//! arriving late cannot resurrect a deleted field.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;
use crate::patch::{Change, Entry, FieldState, Patch, Target};
use crate::stamp::{Clock, VersionVector};
use crate::value::CellValue;

/// Field name → stamped entry.
pub type Row = BTreeMap<String, Entry>;
/// Row id → row.
pub type Table = BTreeMap<String, Row>;

/// Visible content of a store (tombstones removed).
pub type VisibleTables = BTreeMap<String, BTreeMap<String, BTreeMap<String, CellValue>>>;

/// Change notification delivered after a mutation or merge completes.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A field's visible value changed (`None` = deleted).
    CellChanged {
        table: String,
        row_id: String,
        field: String,
        value: Option<CellValue>,
    },
    /// A row appeared in or disappeared from a table.
    RowIdsChanged { table: String },
    /// A top-level value changed (`None` = deleted).
    ValueChanged { key: String, value: Option<CellValue> },
}

type Listener = Box<dyn FnMut(&StoreEvent) + Send>;

/// Handle returned by the `subscribe*` methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Serialized form of a store, written by persisters.
///
/// Unknown fields are ignored on load so newer writers stay readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub replica_id: String,
    #[serde(default)]
    pub counter: u64,
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
    #[serde(default)]
    pub values: BTreeMap<String, Entry>,
    #[serde(default)]
    pub sync_cursor: Option<VersionVector>,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(self).map_err(|e| CoreError::Snapshot(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Snapshot(e.to_string()))
    }
}

fn row_is_visible(row: &Row) -> bool {
    row.values().any(|entry| !entry.state.is_tombstone())
}

/// A replica of one logical document.
pub struct MergeableStore {
    id: String,
    clock: Clock,
    tables: BTreeMap<String, Table>,
    values: BTreeMap<String, Entry>,
    /// Canonical version vector this replica last fully reconciled with.
    sync_cursor: Option<VersionVector>,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl fmt::Debug for MergeableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeableStore")
            .field("id", &self.id)
            .field("replica_id", &self.clock.replica_id())
            .field("counter", &self.clock.counter())
            .field("tables", &self.tables.len())
            .field("values", &self.values.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl MergeableStore {
    /// Create an empty store with a fresh random replica id.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_replica(id, Uuid::new_v4().to_string())
    }

    /// Create an empty store with an explicit replica id.
    pub fn with_replica(id: impl Into<String>, replica_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            clock: Clock::new(replica_id),
            tables: BTreeMap::new(),
            values: BTreeMap::new(),
            sync_cursor: None,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Rebuild a store from a snapshot.
    ///
    /// The clock resumes above every stamp in the snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut counter = snapshot.counter;
        for table in snapshot.tables.values() {
            for row in table.values() {
                for entry in row.values() {
                    counter = counter.max(entry.stamp.counter);
                }
            }
        }
        for entry in snapshot.values.values() {
            counter = counter.max(entry.stamp.counter);
        }

        Self {
            id: snapshot.id,
            clock: Clock::with_counter(snapshot.replica_id, counter),
            tables: snapshot.tables,
            values: snapshot.values,
            sync_cursor: snapshot.sync_cursor,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    /// Capture the full stamped state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            id: self.id.clone(),
            replica_id: self.clock.replica_id().to_string(),
            counter: self.clock.counter(),
            tables: self.tables.clone(),
            values: self.values.clone(),
            sync_cursor: self.sync_cursor.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn replica_id(&self) -> &str {
        self.clock.replica_id()
    }

    pub fn counter(&self) -> u64 {
        self.clock.counter()
    }

    // ─── Local writes ─────────────────────────────────────────────────

    /// Write one field of a row.
    pub fn set_cell(
        &mut self,
        table: &str,
        row_id: &str,
        field: &str,
        value: impl Into<CellValue>,
    ) -> Patch {
        let stamp = self.clock.tick();
        let change = Change {
            target: Target::cell(table, row_id, field),
            state: FieldState::Value(value.into()),
            stamp,
        };
        self.commit(vec![change])
    }

    /// Write several fields of a row under one stamp.
    pub fn set_row<I, K, V>(&mut self, table: &str, row_id: &str, fields: I) -> Patch
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<CellValue>,
    {
        let stamp = self.clock.tick();
        let changes = fields
            .into_iter()
            .map(|(field, value)| Change {
                target: Target::cell(table, row_id, field),
                state: FieldState::Value(value.into()),
                stamp: stamp.clone(),
            })
            .collect();
        self.commit(changes)
    }

    /// Tombstone a single field. Returns an empty patch if it was not set.
    pub fn del_cell(&mut self, table: &str, row_id: &str, field: &str) -> Patch {
        if self.get_cell(table, row_id, field).is_none() {
            return Patch::new();
        }
        let stamp = self.clock.tick();
        self.commit(vec![Change {
            target: Target::cell(table, row_id, field),
            state: FieldState::Tombstone,
            stamp,
        }])
    }

    /// Tombstone every live field of a row.
    pub fn del_row(&mut self, table: &str, row_id: &str) -> Patch {
        let fields: Vec<String> = match self.tables.get(table).and_then(|t| t.get(row_id)) {
            Some(row) => row
                .iter()
                .filter(|(_, entry)| !entry.state.is_tombstone())
                .map(|(field, _)| field.clone())
                .collect(),
            None => return Patch::new(),
        };
        if fields.is_empty() {
            return Patch::new();
        }

        let stamp = self.clock.tick();
        let changes = fields
            .into_iter()
            .map(|field| Change {
                target: Target::cell(table, row_id, field),
                state: FieldState::Tombstone,
                stamp: stamp.clone(),
            })
            .collect();
        self.commit(changes)
    }

    /// Write a top-level value.
    pub fn set_value(&mut self, key: &str, value: impl Into<CellValue>) -> Patch {
        let stamp = self.clock.tick();
        self.commit(vec![Change {
            target: Target::value(key),
            state: FieldState::Value(value.into()),
            stamp,
        }])
    }

    /// Tombstone a top-level value.
    pub fn del_value(&mut self, key: &str) -> Patch {
        if self.get_value(key).is_none() {
            return Patch::new();
        }
        let stamp = self.clock.tick();
        self.commit(vec![Change {
            target: Target::value(key),
            state: FieldState::Tombstone,
            stamp,
        }])
    }

    fn commit(&mut self, changes: Vec<Change>) -> Patch {
        let mut events = Vec::new();
        let mut applied = Patch::new();
        for change in changes {
            if self.apply(&change, &mut events) {
                applied.push(change);
            }
        }
        self.emit(events);
        applied
    }

    // ─── Merge & reconciliation ───────────────────────────────────────

    /// Merge a remote patch.
    ///
    /// Returns the subset of changes that won against local state; the
    /// rest were already known or superseded and are dropped silently.
    pub fn merge(&mut self, patch: &Patch) -> Patch {
        let mut events = Vec::new();
        let mut applied = Patch::new();
        for change in patch.iter() {
            self.clock.observe(change.stamp.counter);
            if self.apply(change, &mut events) {
                applied.push(change.clone());
            }
        }
        if !applied.is_empty() {
            log::trace!(
                "store {}: merged {}/{} changes",
                self.id,
                applied.len(),
                patch.len()
            );
        }
        self.emit(events);
        applied
    }

    /// All entries whose stamp is not covered by `cursor`.
    pub fn diff_since(&self, cursor: &VersionVector) -> Patch {
        let mut patch = Patch::new();
        for (table_id, table) in &self.tables {
            for (row_id, row) in table {
                for (field, entry) in row {
                    if !cursor.covers(&entry.stamp) {
                        patch.push(Change {
                            target: Target::cell(table_id.as_str(), row_id.as_str(), field.as_str()),
                            state: entry.state.clone(),
                            stamp: entry.stamp.clone(),
                        });
                    }
                }
            }
        }
        for (key, entry) in &self.values {
            if !cursor.covers(&entry.stamp) {
                patch.push(Change {
                    target: Target::value(key.as_str()),
                    state: entry.state.clone(),
                    stamp: entry.stamp.clone(),
                });
            }
        }
        patch
    }

    /// Every stored entry, tombstones included.
    pub fn full_patch(&self) -> Patch {
        self.diff_since(&VersionVector::new())
    }

    /// Highest stamp counter held per replica.
    pub fn version_vector(&self) -> VersionVector {
        let mut vv = VersionVector::new();
        for table in self.tables.values() {
            for row in table.values() {
                for entry in row.values() {
                    vv.observe(&entry.stamp);
                }
            }
        }
        for entry in self.values.values() {
            vv.observe(&entry.stamp);
        }
        vv
    }

    pub fn sync_cursor(&self) -> Option<&VersionVector> {
        self.sync_cursor.as_ref()
    }

    pub fn set_sync_cursor(&mut self, cursor: VersionVector) {
        self.sync_cursor = Some(cursor);
    }

    fn apply(&mut self, change: &Change, events: &mut Vec<StoreEvent>) -> bool {
        match &change.target {
            Target::Cell {
                table,
                row_id,
                field,
            } => {
                let row = self
                    .tables
                    .entry(table.clone())
                    .or_default()
                    .entry(row_id.clone())
                    .or_default();
                if row.get(field).is_some_and(|e| e.stamp >= change.stamp) {
                    return false;
                }

                let was_visible = row_is_visible(row);
                let old_value = row.get(field).and_then(|e| e.state.value().cloned());
                row.insert(field.clone(), change.entry());
                let now_visible = row_is_visible(row);

                if old_value.as_ref() != change.state.value() {
                    events.push(StoreEvent::CellChanged {
                        table: table.clone(),
                        row_id: row_id.clone(),
                        field: field.clone(),
                        value: change.state.value().cloned(),
                    });
                }
                if was_visible != now_visible {
                    events.push(StoreEvent::RowIdsChanged {
                        table: table.clone(),
                    });
                }
                true
            }
            Target::Value { key } => {
                if self
                    .values
                    .get(key)
                    .is_some_and(|e| e.stamp >= change.stamp)
                {
                    return false;
                }
                let old_value = self
                    .values
                    .insert(key.clone(), change.entry())
                    .and_then(|e| e.state.value().cloned());
                if old_value.as_ref() != change.state.value() {
                    events.push(StoreEvent::ValueChanged {
                        key: key.clone(),
                        value: change.state.value().cloned(),
                    });
                }
                true
            }
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn get_cell(&self, table: &str, row_id: &str, field: &str) -> Option<&CellValue> {
        self.tables
            .get(table)?
            .get(row_id)?
            .get(field)?
            .state
            .value()
    }

    /// Live fields of a row, or `None` if the row has none.
    pub fn get_row(&self, table: &str, row_id: &str) -> Option<BTreeMap<String, CellValue>> {
        let row = self.tables.get(table)?.get(row_id)?;
        let fields: BTreeMap<String, CellValue> = row
            .iter()
            .filter_map(|(field, entry)| entry.state.value().map(|v| (field.clone(), v.clone())))
            .collect();
        if fields.is_empty() {
            None
        } else {
            Some(fields)
        }
    }

    pub fn has_row(&self, table: &str, row_id: &str) -> bool {
        self.tables
            .get(table)
            .and_then(|t| t.get(row_id))
            .is_some_and(row_is_visible)
    }

    /// Ids of rows with at least one live field, in key order.
    pub fn row_ids(&self, table: &str) -> Vec<String> {
        match self.tables.get(table) {
            Some(t) => t
                .iter()
                .filter(|(_, row)| row_is_visible(row))
                .map(|(id, _)| id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .get(table)
            .map_or(0, |t| t.values().filter(|row| row_is_visible(row)).count())
    }

    /// Tables holding at least one live row.
    pub fn table_ids(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, t)| t.values().any(row_is_visible))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Row ids ordered by the value of `field`, then by row id.
    ///
    /// Rows missing the field sort first. `offset`/`limit` page the result.
    pub fn sorted_row_ids(
        &self,
        table: &str,
        field: &str,
        descending: bool,
        offset: usize,
        limit: Option<usize>,
    ) -> Vec<String> {
        let mut ids = self.row_ids(table);
        ids.sort_by(|a, b| {
            let va = self.get_cell(table, a, field);
            let vb = self.get_cell(table, b, field);
            let ord = match (va, vb) {
                (Some(x), Some(y)) => x.sort_cmp(y),
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
            .then_with(|| a.cmp(b));
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        let iter = ids.into_iter().skip(offset);
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<&CellValue> {
        self.values.get(key)?.state.value()
    }

    /// Keys of live top-level values.
    pub fn value_keys(&self) -> Vec<String> {
        self.values
            .iter()
            .filter(|(_, e)| !e.state.is_tombstone())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Stored entry for a target, tombstones included.
    pub fn entry(&self, target: &Target) -> Option<&Entry> {
        match target {
            Target::Cell {
                table,
                row_id,
                field,
            } => self.tables.get(table)?.get(row_id)?.get(field),
            Target::Value { key } => self.values.get(key),
        }
    }

    /// All live table content.
    pub fn visible_tables(&self) -> VisibleTables {
        let mut out = VisibleTables::new();
        for table_id in self.table_ids() {
            let rows = self
                .row_ids(&table_id)
                .into_iter()
                .filter_map(|row_id| {
                    self.get_row(&table_id, &row_id)
                        .map(|fields| (row_id, fields))
                })
                .collect();
            out.insert(table_id, rows);
        }
        out
    }

    /// All live top-level values.
    pub fn visible_values(&self) -> BTreeMap<String, CellValue> {
        self.values
            .iter()
            .filter_map(|(k, e)| e.state.value().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    // ─── Subscriptions ────────────────────────────────────────────────

    /// Receive every change event.
    ///
    /// Listeners run synchronously after the mutation that caused them and
    /// must not call back into the store.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Called with the table's current row ids whenever the set changes.
    pub fn subscribe_row_ids<F>(&mut self, table: &str, mut listener: F) -> SubscriptionId
    where
        F: FnMut(&str) + Send + 'static,
    {
        let table = table.to_string();
        self.subscribe(move |event| {
            if let StoreEvent::RowIdsChanged { table: t } = event {
                if *t == table {
                    listener(t);
                }
            }
        })
    }

    /// Called with the new value (or `None`) of one field.
    pub fn subscribe_cell<F>(
        &mut self,
        table: &str,
        row_id: &str,
        field: &str,
        mut listener: F,
    ) -> SubscriptionId
    where
        F: FnMut(Option<&CellValue>) + Send + 'static,
    {
        let (table, row_id, field) = (table.to_string(), row_id.to_string(), field.to_string());
        self.subscribe(move |event| {
            if let StoreEvent::CellChanged {
                table: t,
                row_id: r,
                field: f,
                value,
            } = event
            {
                if *t == table && *r == row_id && *f == field {
                    listener(value.as_ref());
                }
            }
        })
    }

    /// Called with the new value (or `None`) of a top-level value.
    pub fn subscribe_value<F>(&mut self, key: &str, mut listener: F) -> SubscriptionId
    where
        F: FnMut(Option<&CellValue>) + Send + 'static,
    {
        let key = key.to_string();
        self.subscribe(move |event| {
            if let StoreEvent::ValueChanged { key: k, value } = event {
                if *k == key {
                    listener(value.as_ref());
                }
            }
        })
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, events: Vec<StoreEvent>) {
        if events.is_empty() || self.listeners.is_empty() {
            return;
        }
        let mut deduped: Vec<StoreEvent> = Vec::with_capacity(events.len());
        for event in events {
            if !deduped.contains(&event) {
                deduped.push(event);
            }
        }
        for (_, listener) in self.listeners.iter_mut() {
            for event in &deduped {
                listener(event);
            }
        }
    }
}
