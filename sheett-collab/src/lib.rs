//! # sheett-collab — replication layer for Sheett spreadsheets
//!
//! Keeps every replica of a spreadsheet converging through one
//! authoritative room per document.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐    WebSocket     ┌──────────────────┐
//! │ DocumentSession  │ ◄──────────────► │ SyncServer       │
//! │  Synchronizer    │   Binary Proto   │  (accept loop)   │
//! │  AutoSave        │                  └────────┬─────────┘
//! └────────┬─────────┘                           │ doc id
//!          │                                     ▼
//!          ▼                            ┌──────────────────┐
//! ┌──────────────────┐                  │ RoomActor        │
//! │ MergeableStore   │                  │  canonical store │
//! │ (local replica)  │                  │  LockTable       │
//! └──────────────────┘                  │  BroadcastGroup  │
//!                                       └────────┬─────────┘
//!                                                ▼
//!                                       ┌──────────────────┐
//!                                       │ DocumentStore    │
//!                                       │ (RocksDB)        │
//!                                       └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Per-room fan-out with lag detection
//! - [`room`] — One actor per document owning its canonical state
//! - [`server`] — WebSocket sync server routing connections to rooms
//! - [`client`] — Synchronizer with reconnect and reconciliation
//! - [`locks`] — Advisory, ephemeral cell locks
//! - [`storage`] — RocksDB document store and client persister
//! - [`session`] — Client-side document sessions

pub mod broadcast;
pub mod client;
pub mod locks;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{ConnectionState, SyncConfig, SyncError, SyncEvent, Synchronizer};
pub use locks::{LockError, LockInfo, LockMessage, LockTable, LockView, DEFAULT_LOCK_TIMEOUT};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage, SyncResponse};
pub use room::{RoomConfig, RoomError, RoomHandle, RoomManager, RoomMetrics};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{DocumentSession, SessionConfig, SessionError, SessionRegistry};
pub use storage::{
    AutoSave, DocumentMetadata, DocumentStorage, DocumentStore, PatchSink, PersistStatus, Persister,
    PersisterConfig, StoreConfig, StoreError,
};
