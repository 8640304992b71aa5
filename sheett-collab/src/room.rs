//! Per-document room actors.
//!
//! ```text
//! connection A ──┐  RoomCommand   ┌────────────────────────────┐
//! connection B ──┼──────────────► │ RoomActor (one per doc id) │
//! connection C ──┘    (mpsc)      │  MergeableStore (canonical)│
//!        ▲                        │  LockTable                 │
//!        │   encoded frames       │  BroadcastGroup            │
//!        └────────────────────────┤                            │
//!                                 └─────────────┬──────────────┘
//!                                     WriteJob  │ (mpsc, in order)
//!                                 ┌─────────────▼──────────────┐
//!                                 │ RoomWriter                 │
//!                                 │  DocumentStore (deltas,    │
//!                                 │  checkpoints)              │
//!                                 └────────────────────────────┘
//! ```
//!
//! Every mutation of a document goes through its actor, so patches from
//! different connections are merged in arrival order without locks.
//! Documents never share an actor and run concurrently. Storage writes are
//! queued to a writer task per room and applied in submission order.
//!
//! A room loads its persisted state before it is registered; a failed load
//! is reported to the caller and nothing is cached, so the next connection
//! attempt retries the load. Loads, closes and evictions of one document
//! serialize on that document's slot in the [`RoomManager`].
//!
//! A persisted room with no peers for `idle_timeout` checkpoints, removes
//! itself from the manager and stops. Rooms without storage hold the only
//! copy of their document and stay resident.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::{Duration, Instant};

use sheett_core::spreadsheet::CELLS_TABLE;
use sheett_core::{MergeableStore, Patch, Snapshot, Target, VersionVector};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame};
use crate::locks::{LockError, LockInfo, LockMessage, LockTable, DEFAULT_LOCK_TIMEOUT};
use crate::protocol::{PeerInfo, SyncMessage, SyncResponse};
use crate::storage::{DocumentStore, StoreError};

/// Replica id the canonical stores are created with. Rooms never author
/// changes, so it only shows up in snapshots.
const ROOM_REPLICA_ID: &str = "room";

/// Room errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoomError {
    #[error("Failed to load document {doc_id}: {reason}")]
    LoadFailed { doc_id: String, reason: String },
    #[error("Room {0} is closed")]
    Closed(String),
    #[error("Room {doc_id} is full ({max} peers)")]
    RoomFull { doc_id: String, max: usize },
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Per-room settings.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub broadcast_capacity: usize,
    pub max_peers: usize,
    pub lock_timeout: Duration,
    /// How often expired locks are swept
    pub lock_sweep_interval: Duration,
    /// Command queue depth per room (also bounds queued storage writes)
    pub command_capacity: usize,
    /// How long a persisted room stays resident without peers
    pub idle_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers: 100,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_sweep_interval: Duration::from_secs(1),
            command_capacity: 1024,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Persistence counters shared by every room of a manager.
#[derive(Debug, Default)]
pub struct RoomMetrics {
    pub persisted_deltas: AtomicU64,
    pub persisted_snapshots: AtomicU64,
    pub failed_writes: AtomicU64,
    pub failed_loads: AtomicU64,
    pub evicted_rooms: AtomicU64,
}

/// What a joining connection gets back.
pub struct JoinAck {
    /// Every frame the room broadcasts from now on
    pub frames: broadcast::Receiver<Frame>,
    /// Locks currently held
    pub locks: Vec<LockInfo>,
    /// Peers connected before this one
    pub peers: Vec<PeerInfo>,
}

enum RoomCommand {
    Join {
        info: PeerInfo,
        reply: oneshot::Sender<Result<JoinAck, RoomError>>,
    },
    Leave {
        peer_id: Uuid,
    },
    Patch {
        peer_id: Uuid,
        clock: u64,
        patch: Patch,
    },
    Sync {
        cursor: Option<VersionVector>,
        reply: oneshot::Sender<SyncResponse>,
    },
    Lock {
        peer_id: Uuid,
        msg: LockMessage,
        reply: oneshot::Sender<Option<LockMessage>>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Stats {
        reply: oneshot::Sender<BroadcastStats>,
    },
    Close {
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
    Delete {
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
}

/// Cloneable address of one room actor.
#[derive(Clone)]
pub struct RoomHandle {
    doc_id: Arc<str>,
    /// Distinguishes successive actors of the same document
    id: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Whether the actor has stopped or is shutting down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn send(&self, cmd: RoomCommand) -> Result<(), RoomError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| RoomError::Closed(self.doc_id.to_string()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| RoomError::Closed(self.doc_id.to_string()))
    }

    pub async fn join(&self, info: PeerInfo) -> Result<JoinAck, RoomError> {
        self.request(|reply| RoomCommand::Join { info, reply }).await?
    }

    pub async fn leave(&self, peer_id: Uuid) -> Result<(), RoomError> {
        self.send(RoomCommand::Leave { peer_id }).await
    }

    pub async fn apply_patch(&self, peer_id: Uuid, clock: u64, patch: Patch) -> Result<(), RoomError> {
        self.send(RoomCommand::Patch { peer_id, clock, patch }).await
    }

    /// Reconciliation: everything canonical state holds beyond `cursor`.
    pub async fn sync(&self, cursor: Option<VersionVector>) -> Result<SyncResponse, RoomError> {
        self.request(|reply| RoomCommand::Sync { cursor, reply }).await
    }

    /// Submit a lock request. Returns the direct answer, if any.
    pub async fn lock(&self, peer_id: Uuid, msg: LockMessage) -> Result<Option<LockMessage>, RoomError> {
        self.request(|reply| RoomCommand::Lock { peer_id, msg, reply }).await
    }

    /// Copy of the canonical state.
    pub async fn snapshot(&self) -> Result<Snapshot, RoomError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    pub async fn stats(&self) -> Result<BroadcastStats, RoomError> {
        self.request(|reply| RoomCommand::Stats { reply }).await
    }

    /// Checkpoint and stop the actor.
    pub async fn close(&self) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Close { reply }).await?
    }

    /// Remove the persisted document and stop the actor.
    pub async fn delete(&self) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Delete { reply }).await?
    }
}

/// The live actor of one document, if any.
type RoomSlot = Arc<tokio::sync::Mutex<Option<RoomHandle>>>;
type RoomMap = Arc<std::sync::Mutex<HashMap<String, RoomSlot>>>;

fn lock_map(rooms: &RoomMap) -> MutexGuard<'_, HashMap<String, RoomSlot>> {
    rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drop `slot` from the map unless a newer slot replaced it.
fn forget_slot(rooms: &RoomMap, doc_id: &str, slot: &RoomSlot) {
    let mut rooms = lock_map(rooms);
    if rooms.get(doc_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
        rooms.remove(doc_id);
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .unwrap_or_else(|e| Err(StoreError::DatabaseError(e.to_string())))
}

enum WriteJob {
    Delta {
        version: u64,
        patch: Patch,
    },
    Checkpoint {
        snapshot: Snapshot,
        version: u64,
        reply: Option<oneshot::Sender<Result<(), RoomError>>>,
    },
    Delete {
        reply: oneshot::Sender<Result<(), RoomError>>,
    },
}

/// Applies one room's storage writes in order, off the actor.
struct RoomWriter {
    doc_id: String,
    storage: Arc<DocumentStore>,
    metrics: Arc<RoomMetrics>,
    /// Set while canonical state holds changes no snapshot covers
    dirty: Arc<AtomicBool>,
}

impl RoomWriter {
    async fn run(self, mut jobs: mpsc::Receiver<WriteJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                WriteJob::Delta { version, patch } => self.write_delta(version, patch).await,
                WriteJob::Checkpoint { snapshot, version, reply } => {
                    let result = self.checkpoint(snapshot, version).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                WriteJob::Delete { reply } => {
                    let storage = self.storage.clone();
                    let doc_id = self.doc_id.clone();
                    let result = blocking(move || storage.delete_document(&doc_id)).await;
                    let _ = reply.send(result.map_err(RoomError::from));
                }
            }
        }
        log::debug!("Writer for room {} stopped", self.doc_id);
    }

    async fn write_delta(&self, version: u64, patch: Patch) {
        let storage = self.storage.clone();
        let doc_id = self.doc_id.clone();
        match blocking(move || storage.store_patch(&doc_id, version, &patch)).await {
            Ok(_) => {
                self.metrics.persisted_deltas.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // Canonical state stays in memory; the next checkpoint covers it.
                self.metrics.failed_writes.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to persist delta v{version} of {}: {e}", self.doc_id);
            }
        }
    }

    async fn checkpoint(&self, snapshot: Snapshot, version: u64) -> Result<(), RoomError> {
        let storage = self.storage.clone();
        let doc_id = self.doc_id.clone();
        match blocking(move || storage.checkpoint(&doc_id, &snapshot, version)).await {
            Ok(meta) => {
                self.metrics.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Checkpointed room {} at v{} ({} bytes compressed)",
                    self.doc_id,
                    meta.snapshot_version,
                    meta.compressed_size
                );
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.metrics.failed_writes.fetch_add(1, Ordering::Relaxed);
                log::error!("Failed to checkpoint room {}: {e}", self.doc_id);
                Err(e.into())
            }
        }
    }
}

struct RoomActor {
    doc_id: String,
    id: u64,
    store: MergeableStore,
    group: BroadcastGroup,
    locks: LockTable,
    /// `None` for in-memory rooms
    writer: Option<mpsc::Sender<WriteJob>>,
    writer_task: Option<JoinHandle<()>>,
    dirty: Arc<AtomicBool>,
    /// Last delta version submitted
    version: u64,
    /// Set once the actor stops taking new peers
    draining: bool,
    slot: RoomSlot,
    rooms: RoomMap,
    metrics: Arc<RoomMetrics>,
    config: RoomConfig,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let mut sweep = tokio::time::interval(self.config.lock_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle_since = Some(tokio::time::Instant::now());

        loop {
            let idle_deadline = match (&self.writer, idle_since) {
                (Some(_), Some(since)) => Some(since + self.config.idle_timeout),
                _ => None,
            };
            let idle = async move {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = self.checkpoint(true).await;
                        self.finish_writes().await;
                        break;
                    };
                    if self.handle(cmd).await {
                        break;
                    }
                }
                _ = sweep.tick() => self.expire_locks(),
                _ = idle => {
                    if self.evict(&mut rx).await {
                        break;
                    }
                    // Someone is loading or closing this document; look again later.
                    idle_since = Some(tokio::time::Instant::now());
                }
            }

            if self.group.peer_count() == 0 {
                idle_since.get_or_insert_with(tokio::time::Instant::now);
            } else {
                idle_since = None;
            }
        }

        log::info!("Room {} stopped", self.doc_id);
    }

    /// Returns true once the actor must stop.
    async fn handle(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Join { info, reply } => {
                let _ = reply.send(self.join(info));
            }
            RoomCommand::Leave { peer_id } => self.leave(peer_id).await,
            RoomCommand::Patch { peer_id, clock, patch } => {
                self.apply_patch(peer_id, clock, patch).await;
            }
            RoomCommand::Sync { cursor, reply } => {
                let _ = reply.send(self.sync(cursor.as_ref()));
            }
            RoomCommand::Lock { peer_id, msg, reply } => {
                let _ = reply.send(self.lock(peer_id, msg));
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.store.snapshot());
            }
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.group.stats());
            }
            RoomCommand::Close { reply } => {
                let result = self.checkpoint(true).await;
                self.finish_writes().await;
                self.notify_closing("room closed");
                let _ = reply.send(result);
                return true;
            }
            RoomCommand::Delete { reply } => {
                let result = self.delete().await;
                self.finish_writes().await;
                self.notify_closing("document deleted");
                let _ = reply.send(result);
                return true;
            }
        }
        false
    }

    /// Leave the manager, finish queued commands and checkpoint.
    ///
    /// Returns false if the slot is busy with a load or close of this
    /// document; the actor keeps running in that case.
    async fn evict(&mut self, rx: &mut mpsc::Receiver<RoomCommand>) -> bool {
        let Ok(mut slot) = self.slot.clone().try_lock_owned() else {
            return false;
        };
        let ours = slot.as_ref().is_some_and(|room| room.id == self.id);
        if ours {
            *slot = None;
        }

        // Commands already queued still run; new joins are refused and
        // retried against a fresh load, which waits on `slot`.
        rx.close();
        self.draining = true;
        let mut stopped = false;
        while let Some(cmd) = rx.recv().await {
            if !stopped {
                stopped = self.handle(cmd).await;
            }
        }
        if !stopped {
            let _ = self.checkpoint(true).await;
        }
        self.finish_writes().await;
        // A reload may start once the slot is released; storage is final by now.
        if ours {
            forget_slot(&self.rooms, &self.doc_id, &self.slot);
        }
        drop(slot);

        self.metrics.evicted_rooms.fetch_add(1, Ordering::Relaxed);
        log::info!("Room {} evicted after {:?} without peers", self.doc_id, self.config.idle_timeout);
        true
    }

    fn join(&mut self, info: PeerInfo) -> Result<JoinAck, RoomError> {
        if self.draining {
            return Err(RoomError::Closed(self.doc_id.clone()));
        }
        if !self.group.has_peer(&info.peer_id) && self.group.peer_count() >= self.config.max_peers {
            return Err(RoomError::RoomFull {
                doc_id: self.doc_id.clone(),
                max: self.config.max_peers,
            });
        }

        let peers = self.group.peers();
        let frames = self.group.add_peer(info.clone());
        match SyncMessage::peer_joined(&self.doc_id, &info) {
            Ok(msg) => {
                let _ = self.group.broadcast(&msg);
            }
            Err(e) => log::warn!("Failed to encode join of {}: {e}", info.peer_id),
        }

        log::info!(
            "Peer {} ({}, user {}) joined room {} ({} peers)",
            info.name,
            info.peer_id,
            info.user_id,
            self.doc_id,
            self.group.peer_count()
        );

        Ok(JoinAck {
            frames,
            locks: self.locks.snapshot(),
            peers,
        })
    }

    async fn leave(&mut self, peer_id: Uuid) {
        let Some(info) = self.group.remove_peer(&peer_id) else {
            return;
        };

        for cell_id in self.locks.release_peer(peer_id) {
            self.broadcast_lock(&LockMessage::Unlocked { cell_id });
        }
        let _ = self.group.broadcast(&SyncMessage::peer_left(peer_id, &self.doc_id));

        log::info!(
            "Peer {} ({}) left room {} ({} peers)",
            info.name,
            peer_id,
            self.doc_id,
            self.group.peer_count()
        );

        if self.group.peer_count() == 0 {
            let _ = self.checkpoint(false).await;
        }
    }

    async fn apply_patch(&mut self, peer_id: Uuid, clock: u64, patch: Patch) {
        let applied = self.store.merge(&patch);
        log::debug!(
            "Room {}: patch from {peer_id} ({} changes, {} applied)",
            self.doc_id,
            patch.len(),
            applied.len()
        );

        if let Some(owner) = self.group.peer(&peer_id).map(|p| p.user_id.clone()) {
            let now = Instant::now();
            for change in patch.iter() {
                if let Target::Cell { table, row_id, .. } = &change.target {
                    if table == CELLS_TABLE {
                        self.locks.touch(row_id, &owner, now);
                    }
                }
            }
        }

        if applied.is_empty() {
            return;
        }

        match SyncMessage::patch(peer_id, &self.doc_id, clock, &applied) {
            Ok(msg) => {
                let _ = self.group.broadcast(&msg);
            }
            Err(e) => log::error!("Failed to encode patch for room {}: {e}", self.doc_id),
        }

        self.persist(applied).await;
    }

    /// Queue an applied patch for the writer.
    async fn persist(&mut self, applied: Patch) {
        let Some(writer) = &self.writer else {
            return;
        };
        self.version += 1;
        self.dirty.store(true, Ordering::SeqCst);
        let job = WriteJob::Delta {
            version: self.version,
            patch: applied,
        };
        if writer.send(job).await.is_err() {
            log::error!("Writer for room {} is gone, delta v{} not persisted", self.doc_id, self.version);
        }
    }

    fn sync(&self, cursor: Option<&VersionVector>) -> SyncResponse {
        let patch = match cursor {
            Some(cursor) => self.store.diff_since(cursor),
            None => self.store.full_patch(),
        };
        SyncResponse {
            patch,
            cursor: self.store.version_vector(),
        }
    }

    fn lock(&mut self, peer_id: Uuid, msg: LockMessage) -> Option<LockMessage> {
        let owner = match self.group.peer(&peer_id) {
            Some(info) => info.user_id.clone(),
            None => {
                log::warn!("Lock request from unknown peer {peer_id} in room {}", self.doc_id);
                return None;
            }
        };

        match msg {
            LockMessage::Acquire { cell_id } => {
                match self.locks.try_lock(&cell_id, &owner, peer_id, Instant::now()) {
                    Ok(info) => {
                        self.broadcast_lock(&LockMessage::Locked(info.clone()));
                        Some(LockMessage::Granted(info))
                    }
                    Err(LockError::HeldByOther { cell_id, holder }) => {
                        Some(LockMessage::Denied { cell_id, holder })
                    }
                }
            }
            LockMessage::Release { cell_id } => {
                if self.locks.unlock(&cell_id, &owner) {
                    self.broadcast_lock(&LockMessage::Unlocked { cell_id });
                }
                None
            }
            other => {
                log::warn!("Unexpected lock message from {peer_id}: {other:?}");
                None
            }
        }
    }

    fn expire_locks(&mut self) {
        for cell_id in self.locks.expire(Instant::now()) {
            log::debug!("Lock on {cell_id} in room {} expired", self.doc_id);
            self.broadcast_lock(&LockMessage::Unlocked { cell_id });
        }
    }

    /// Lock broadcasts carry the nil peer id so every connection gets them.
    fn broadcast_lock(&self, msg: &LockMessage) {
        match SyncMessage::lock_update(Uuid::nil(), &self.doc_id, msg) {
            Ok(frame) => {
                let _ = self.group.broadcast(&frame);
            }
            Err(e) => log::error!("Failed to encode lock update: {e}"),
        }
    }

    fn notify_closing(&self, reason: &str) {
        let _ = self.group.broadcast(&SyncMessage::error(&self.doc_id, reason));
    }

    /// Snapshot canonical state if anything changed since the last one.
    /// With `wait`, returns once the writer has stored it.
    async fn checkpoint(&mut self, wait: bool) -> Result<(), RoomError> {
        let Some(writer) = self.writer.clone() else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let (reply, done) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let job = WriteJob::Checkpoint {
            snapshot: self.store.snapshot(),
            version: self.version,
            reply,
        };
        let closed = || RoomError::Closed(self.doc_id.clone());
        writer.send(job).await.map_err(|_| closed())?;
        match done {
            Some(done) => done.await.map_err(|_| closed())?,
            None => Ok(()),
        }
    }

    /// Stop the writer once every queued job is stored.
    async fn finish_writes(&mut self) {
        self.writer = None;
        if let Some(task) = self.writer_task.take() {
            if let Err(e) = task.await {
                log::error!("Writer for room {} failed: {e}", self.doc_id);
            }
        }
    }

    async fn delete(&mut self) -> Result<(), RoomError> {
        let Some(writer) = self.writer.clone() else {
            return Ok(());
        };
        let (reply, done) = oneshot::channel();
        let closed = || RoomError::Closed(self.doc_id.clone());
        writer.send(WriteJob::Delete { reply }).await.map_err(|_| closed())?;
        done.await.map_err(|_| closed())??;
        self.dirty.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Maps document ids to live room actors.
pub struct RoomManager {
    rooms: RoomMap,
    storage: Option<Arc<DocumentStore>>,
    config: RoomConfig,
    metrics: Arc<RoomMetrics>,
    next_room_id: AtomicU64,
}

impl RoomManager {
    pub fn new(config: RoomConfig, storage: Option<Arc<DocumentStore>>) -> Self {
        Self {
            rooms: Arc::new(std::sync::Mutex::new(HashMap::new())),
            storage,
            config,
            metrics: Arc::new(RoomMetrics::default()),
            next_room_id: AtomicU64::new(1),
        }
    }

    pub fn metrics(&self) -> &Arc<RoomMetrics> {
        &self.metrics
    }

    pub fn storage(&self) -> Option<&Arc<DocumentStore>> {
        self.storage.as_ref()
    }

    fn slot(&self, doc_id: &str) -> RoomSlot {
        lock_map(&self.rooms).entry(doc_id.to_string()).or_default().clone()
    }

    fn existing_slot(&self, doc_id: &str) -> Option<RoomSlot> {
        lock_map(&self.rooms).get(doc_id).cloned()
    }

    fn is_current(&self, doc_id: &str, slot: &RoomSlot) -> bool {
        lock_map(&self.rooms)
            .get(doc_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Get the room for `doc_id`, loading it from storage first if needed.
    ///
    /// Only callers of the same document wait for a load in progress.
    pub async fn get_or_load(&self, doc_id: &str) -> Result<RoomHandle, RoomError> {
        loop {
            let slot = self.slot(doc_id);
            let mut room = slot.lock().await;
            if let Some(live) = room.as_ref().filter(|r| !r.is_closed()) {
                return Ok(live.clone());
            }
            // Evicted or closed while we waited.
            if !self.is_current(doc_id, &slot) {
                continue;
            }

            match self.load(doc_id).await {
                Ok((store, version)) => {
                    let handle = self.spawn(doc_id, store, version, slot.clone());
                    *room = Some(handle.clone());
                    return Ok(handle);
                }
                Err(e) => {
                    *room = None;
                    forget_slot(&self.rooms, doc_id, &slot);
                    self.metrics.failed_loads.fetch_add(1, Ordering::Relaxed);
                    log::error!("{e}");
                    return Err(e);
                }
            }
        }
    }

    /// Join `doc_id`, loading the room if needed.
    ///
    /// A room that is being evicted refuses the join; the second attempt
    /// waits for the eviction and loads a fresh actor.
    pub async fn join(&self, doc_id: &str, info: PeerInfo) -> Result<(RoomHandle, JoinAck), RoomError> {
        let room = self.get_or_load(doc_id).await?;
        match room.join(info.clone()).await {
            Err(RoomError::Closed(_)) => {
                let room = self.get_or_load(doc_id).await?;
                let ack = room.join(info).await?;
                Ok((room, ack))
            }
            result => result.map(|ack| (room, ack)),
        }
    }

    fn spawn(&self, doc_id: &str, store: MergeableStore, version: u64, slot: RoomSlot) -> RoomHandle {
        let capacity = self.config.command_capacity.max(1);
        let id = self.next_room_id.fetch_add(1, Ordering::Relaxed);
        let dirty = Arc::new(AtomicBool::new(false));

        let (writer, writer_task) = match self.storage.clone() {
            Some(storage) => {
                let (jobs_tx, jobs_rx) = mpsc::channel(capacity);
                let writer = RoomWriter {
                    doc_id: doc_id.to_string(),
                    storage,
                    metrics: self.metrics.clone(),
                    dirty: dirty.clone(),
                };
                (Some(jobs_tx), Some(tokio::spawn(writer.run(jobs_rx))))
            }
            None => (None, None),
        };

        let (tx, rx) = mpsc::channel(capacity);
        let actor = RoomActor {
            doc_id: doc_id.to_string(),
            id,
            store,
            group: BroadcastGroup::new(self.config.broadcast_capacity),
            locks: LockTable::new(self.config.lock_timeout),
            writer,
            writer_task,
            dirty,
            version,
            draining: false,
            slot,
            rooms: self.rooms.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(actor.run(rx));

        RoomHandle {
            doc_id: Arc::from(doc_id),
            id,
            tx,
        }
    }

    async fn load(&self, doc_id: &str) -> Result<(MergeableStore, u64), RoomError> {
        let Some(storage) = self.storage.clone() else {
            return Ok((MergeableStore::with_replica(doc_id, ROOM_REPLICA_ID), 0));
        };

        let id = doc_id.to_string();
        let loaded = blocking(move || storage.load_document(&id, ROOM_REPLICA_ID))
            .await
            .map_err(|e| RoomError::LoadFailed {
                doc_id: doc_id.to_string(),
                reason: e.to_string(),
            })?;

        match loaded {
            Some(doc) => {
                log::info!(
                    "Loaded room {doc_id} from storage (v{}, {} deltas replayed)",
                    doc.version,
                    doc.replayed_deltas
                );
                Ok((doc.store, doc.version))
            }
            None => {
                log::info!("Created room {doc_id}");
                Ok((MergeableStore::with_replica(doc_id, ROOM_REPLICA_ID), 0))
            }
        }
    }

    pub async fn get(&self, doc_id: &str) -> Option<RoomHandle> {
        let slot = self.existing_slot(doc_id)?;
        let room = slot.lock().await;
        room.as_ref().filter(|r| !r.is_closed()).cloned()
    }

    /// Checkpoint and stop a resident room.
    pub async fn close_room(&self, doc_id: &str) -> Result<bool, RoomError> {
        let Some(slot) = self.existing_slot(doc_id) else {
            return Ok(false);
        };
        let mut room = slot.lock().await;
        let result = match room.take() {
            Some(live) if !live.is_closed() => live.close().await.map(|()| true),
            _ => Ok(false),
        };
        // Waiting loaders see a stale slot and start over with a fresh one.
        forget_slot(&self.rooms, doc_id, &slot);
        result
    }

    /// Delete a document's canonical copy, resident or not.
    pub async fn delete_document(&self, doc_id: &str) -> Result<(), RoomError> {
        let slot = self.slot(doc_id);
        let mut room = slot.lock().await;
        let result = match room.take().filter(|r| !r.is_closed()) {
            Some(live) => live.delete().await,
            None => match self.storage.clone() {
                Some(storage) => {
                    let id = doc_id.to_string();
                    blocking(move || storage.delete_document(&id))
                        .await
                        .map_err(RoomError::from)
                }
                None => Ok(()),
            },
        };
        forget_slot(&self.rooms, doc_id, &slot);
        result
    }

    /// Checkpoint and stop every room.
    pub async fn shutdown(&self) {
        let slots: Vec<RoomSlot> = lock_map(&self.rooms).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let room = slot.lock().await.take();
            if let Some(live) = room.filter(|r| !r.is_closed()) {
                if let Err(e) = live.close().await {
                    log::warn!("Closing room {} failed: {e}", live.doc_id());
                }
            }
        }
    }

    /// Resident rooms. Documents in the middle of a load or close are not
    /// counted.
    pub async fn room_count(&self) -> usize {
        self.live_rooms().len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.live_rooms()
            .into_iter()
            .map(|room| room.doc_id().to_string())
            .collect()
    }

    fn live_rooms(&self) -> Vec<RoomHandle> {
        let slots: Vec<RoomSlot> = lock_map(&self.rooms).values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| {
                let room = slot.try_lock().ok()?;
                room.as_ref().filter(|r| !r.is_closed()).cloned()
            })
            .collect()
    }
}
