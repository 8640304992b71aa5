//! # sheett-core — mergeable spreadsheet state
//!
//! Field-level last-writer-wins store used by every Sheett replica.
//!
//! ```text
//!   local edit ──► MergeableStore::set_cell ──► Patch ──► (sync / persist)
//!                         ▲
//!   remote Patch ─────────┘ merge: apply iff incoming Stamp > stored Stamp
//! ```
//!
//! ## Modules
//!
//! - [`stamp`] — `(counter, replica_id)` stamps, Lamport clock, version vectors
//! - [`value`] — tagged field values
//! - [`patch`] — stamped changes exchanged between replicas
//! - [`store`] — the mergeable store, snapshots and subscriptions
//! - [`cell_id`] — `<rowId>-<columnId>` ids and column labels
//! - [`spreadsheet`] — spreadsheet and user-store schemas
//! - [`registry`] — session-scoped registry of open stores

pub mod cell_id;
pub mod error;
pub mod patch;
pub mod registry;
pub mod spreadsheet;
pub mod stamp;
pub mod store;
pub mod value;

pub use cell_id::{column_label, CellId};
pub use error::CoreError;
pub use patch::{Change, Entry, FieldState, Patch, Target};
pub use registry::{lock_store, SharedStore, StoreRegistry};
pub use spreadsheet::{
    CellEdited, CellRecord, CollaboratorRole, SpreadsheetExt, SpreadsheetSummary, StoreId,
    UserStoreExt,
};
pub use stamp::{Clock, Stamp, VersionVector};
pub use store::{MergeableStore, Snapshot, StoreEvent, SubscriptionId};
pub use value::CellValue;
