//! Persistent storage for documents.
//!
//! ```text
//! ┌─────────────┐  patch deltas   ┌──────────────┐
//! │ Room actor  │ ──────────────► │ DocumentStore│
//! │ AutoSave    │  checkpoints    │ (RocksDB)    │
//! └─────────────┘                 └──────┬───────┘
//!                                        │ column families
//!                     ┌──────────────────┴───────────────┐
//!                     │ "documents" — JSON snapshots, LZ4 │
//!                     │ "deltas"    — bincode patches, LZ4│
//!                     │ "metadata"  — versions and sizes  │
//!                     └──────────────────────────────────┘
//! ```
//!
//! The server keeps canonical room state here; clients keep their local
//! replica through a [`Persister`].

pub mod persister;
pub mod rocks;

pub use persister::{AutoSave, DocumentStorage, PatchSink, PersistStatus, Persister, PersisterConfig};
pub use rocks::{DocumentMetadata, DocumentStore, LoadedDocument, StoreConfig, StoreError};
