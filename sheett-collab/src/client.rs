//! Client synchronizer: keeps one local store replicated with its room.
//!
//! ```text
//!   Disconnected ──► Connecting ──► Reconciling ──► Synced
//!        ▲               │               │             │
//!        └───────────────┴─── transport failure ───────┘
//!                 (bounded exponential backoff + jitter)
//! ```
//!
//! Reconciliation on every (re)connect:
//! 1. send `full-sync-request` with the cursor of the last completed
//!    reconciliation (none on first contact)
//! 2. merge the room's diff, then send the local changes the room's
//!    returned cursor does not cover and ask again with that cursor
//! 3. once a round brings nothing new in either direction, store the
//!    room's cursor and switch to `Synced`
//!
//! Local changes made while offline need no queue: they are exactly what
//! step 2 sends. While connected every local patch is streamed at once.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use sheett_core::{lock_store, Patch, SharedStore};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::locks::{LockError, LockMessage, LockView};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::storage::PatchSink;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ClientSink = SplitSink<ClientStream, Message>;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Reconciling,
    Synced,
}

/// Synchronizer settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket URL of the sync server
    pub server_url: String,
    /// Limit for establishing the transport
    pub connection_timeout: Duration,
    /// First reconnect delay; doubles per failed attempt
    pub min_reconnect_delay: Duration,
    /// Upper bound of the reconnect delay
    pub max_reconnect_delay: Duration,
    /// Reconciliation rounds before settling for `Synced` without a cursor
    pub max_reconcile_rounds: usize,
    /// How long `try_lock` waits for the room's answer
    pub lock_timeout: Duration,
    /// Ping period while connected
    pub heartbeat_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            connection_timeout: Duration::from_secs(1),
            min_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(1),
            max_reconcile_rounds: 8,
            lock_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    pub fn for_testing(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            connection_timeout: Duration::from_millis(500),
            min_reconnect_delay: Duration::from_millis(20),
            max_reconnect_delay: Duration::from_millis(200),
            max_reconcile_rounds: 8,
            lock_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Synchronizer errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),
    #[error("Cell {cell_id} is locked by {holder}")]
    LockHeldByOther { cell_id: String, holder: String },
    #[error("Timed out waiting for the room")]
    Timeout,
    #[error("Synchronizer closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<LockError> for SyncError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::HeldByOther { cell_id, holder } => SyncError::LockHeldByOther { cell_id, holder },
        }
    }
}

/// Events emitted by the synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(ConnectionState),
    /// Remote changes merged into the local store (nil peer for sync responses)
    RemotePatch { peer_id: Uuid, applied: usize },
    /// A reconciliation completed
    Reconciled { rounds: usize, received: usize, sent: usize },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// Lock mirror changed; `owner` is `None` when the cell became free
    LockChanged { cell_id: String, owner: Option<String> },
    /// A lock granted while offline was refused by the room
    LockLost { cell_id: String, holder: String },
    /// The room refused the connection or closed
    RoomError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Disconnected,
    Closed,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the owner and the connection task.
struct Shared {
    doc_id: String,
    user_id: String,
    name: String,
    store: SharedStore,
    outgoing: Mutex<Option<mpsc::UnboundedSender<SyncMessage>>>,
    state_tx: watch::Sender<ConnectionState>,
    locks: Mutex<LockView>,
    pending_locks: Mutex<HashMap<String, oneshot::Sender<LockMessage>>>,
    events: mpsc::UnboundedSender<SyncEvent>,
    sink: Mutex<Option<Arc<dyn PatchSink>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state_tx.send_replace(state) != state {
            log::debug!("{}: {:?}", self.doc_id, state);
            self.emit(SyncEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn is_online(&self) -> bool {
        matches!(self.state(), ConnectionState::Reconciling | ConnectionState::Synced)
    }

    /// Queue a frame on the live connection. False when offline.
    fn send(&self, msg: SyncMessage) -> bool {
        match guard(&self.outgoing).as_ref() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Merge a remote patch and hand the winning changes to the sink.
    fn merge_remote(&self, patch: &Patch) -> usize {
        let applied = lock_store(&self.store).merge(patch);
        if applied.is_empty() {
            return 0;
        }
        if let Some(sink) = guard(&self.sink).as_ref() {
            sink.record(&applied);
        }
        applied.len()
    }

    fn handle_lock(&self, msg: LockMessage) {
        let answered = match &msg {
            LockMessage::Granted(info) => Some(info.cell_id.clone()),
            LockMessage::Denied { cell_id, .. } => Some(cell_id.clone()),
            _ => None,
        };
        let waiter = answered
            .as_ref()
            .and_then(|cell_id| guard(&self.pending_locks).remove(cell_id));

        if waiter.is_none() {
            if let LockMessage::Denied { cell_id, holder } = &msg {
                let mine = guard(&self.locks).holder(cell_id) == Some(self.user_id.as_str());
                if mine {
                    log::warn!("Lock on {cell_id} taken offline was refused, held by {holder}");
                    self.emit(SyncEvent::LockLost {
                        cell_id: cell_id.clone(),
                        holder: holder.clone(),
                    });
                }
            }
        }

        let changes = guard(&self.locks).apply(&msg);
        for (cell_id, owner) in changes {
            self.emit(SyncEvent::LockChanged { cell_id, owner });
        }

        if let Some(waiter) = waiter {
            let _ = waiter.send(msg);
        }
    }

    /// Forget everything tied to the connection that just ended.
    fn disconnected(&self) {
        *guard(&self.outgoing) = None;
        guard(&self.pending_locks).clear();
        guard(&self.locks).retain_owned_by(&self.user_id);
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Replication session between a local store and its room.
pub struct Synchronizer {
    shared: Arc<Shared>,
    config: SyncConfig,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl Synchronizer {
    /// Create a synchronizer for `store`. Nothing happens until [`start`].
    ///
    /// `user_id` is the externally authenticated identity locks belong to.
    ///
    /// [`start`]: Synchronizer::start
    pub fn new(
        doc_id: impl Into<String>,
        user_id: impl Into<String>,
        name: impl Into<String>,
        store: SharedStore,
        config: SyncConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                doc_id: doc_id.into(),
                user_id: user_id.into(),
                name: name.into(),
                store,
                outgoing: Mutex::new(None),
                state_tx,
                locks: Mutex::new(LockView::new()),
                pending_locks: Mutex::new(HashMap::new()),
                events: event_tx,
                sink: Mutex::new(None),
            }),
            config,
            state_rx,
            shutdown_tx,
            task: None,
            event_rx: Some(event_rx),
        }
    }

    /// Send every remote change merged from now on to `sink`.
    pub fn set_patch_sink(&self, sink: Arc<dyn PatchSink>) {
        *guard(&self.shared.sink) = Some(sink);
    }

    /// Spawn the connection task. No-op if already running.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.task = Some(tokio::spawn(run_sync_loop(
            self.shared.clone(),
            self.config.clone(),
            shutdown_rx,
        )));
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> Result<(), SyncError> {
        let mut rx = self.state_rx.clone();
        match tokio::time::timeout(limit, rx.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SyncError::Closed),
            Err(_) => Err(SyncError::Timeout),
        }
    }

    /// Stream a local patch to the room.
    ///
    /// Returns false when offline; the change then travels with the next
    /// reconciliation.
    pub fn send_patch(&self, patch: &Patch) -> bool {
        if patch.is_empty() || !self.shared.is_online() {
            return false;
        }
        let clock = lock_store(&self.shared.store).counter();
        match SyncMessage::patch(Uuid::nil(), &self.shared.doc_id, clock, patch) {
            Ok(msg) => self.shared.send(msg),
            Err(e) => {
                log::error!("Failed to encode patch for {}: {e}", self.shared.doc_id);
                false
            }
        }
    }

    /// Take the advisory lock on a cell.
    ///
    /// Fails fast if the mirror shows another holder. While connected the
    /// room decides; while offline the lock is granted locally and
    /// re-requested on reconnect.
    pub async fn try_lock(&self, cell_id: &str) -> Result<(), SyncError> {
        let user_id = self.shared.user_id.as_str();
        if let Some(holder) = guard(&self.shared.locks).holder(cell_id) {
            if holder != user_id {
                return Err(SyncError::LockHeldByOther {
                    cell_id: cell_id.to_string(),
                    holder: holder.to_string(),
                });
            }
        }

        if !self.shared.is_online() {
            guard(&self.shared.locks).insert_local(cell_id, user_id);
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        guard(&self.shared.pending_locks).insert(cell_id.to_string(), tx);
        let request = SyncMessage::lock_update(
            Uuid::nil(),
            &self.shared.doc_id,
            &LockMessage::Acquire {
                cell_id: cell_id.to_string(),
            },
        )?;
        if !self.shared.send(request) {
            guard(&self.shared.pending_locks).remove(cell_id);
            guard(&self.shared.locks).insert_local(cell_id, user_id);
            return Ok(());
        }

        match tokio::time::timeout(self.config.lock_timeout, rx).await {
            Ok(Ok(LockMessage::Granted(_))) => Ok(()),
            Ok(Ok(LockMessage::Denied { cell_id, holder })) => Err(SyncError::LockHeldByOther { cell_id, holder }),
            Ok(Ok(other)) => Err(SyncError::Connectivity(format!("unexpected lock answer {other:?}"))),
            Ok(Err(_)) => Err(SyncError::Connectivity("connection lost during lock request".into())),
            Err(_) => {
                guard(&self.shared.pending_locks).remove(cell_id);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Release a lock held by this user. Returns false if it was not held.
    pub fn unlock(&self, cell_id: &str) -> bool {
        {
            let mut locks = guard(&self.shared.locks);
            if locks.holder(cell_id) != Some(self.shared.user_id.as_str()) {
                return false;
            }
            locks.remove(cell_id);
        }
        if self.shared.is_online() {
            let release = LockMessage::Release {
                cell_id: cell_id.to_string(),
            };
            match SyncMessage::lock_update(Uuid::nil(), &self.shared.doc_id, &release) {
                Ok(msg) => {
                    self.shared.send(msg);
                }
                Err(e) => log::error!("Failed to encode lock release: {e}"),
            }
        }
        true
    }

    /// Current holder of a cell according to the local mirror.
    pub fn lock_holder(&self, cell_id: &str) -> Option<String> {
        guard(&self.shared.locks).holder(cell_id).map(str::to_string)
    }

    /// Cells this user holds.
    pub fn owned_locks(&self) -> Vec<String> {
        guard(&self.shared.locks).owned_by(&self.shared.user_id)
    }

    pub fn doc_id(&self) -> &str {
        &self.shared.doc_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.user_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cancel pending retries, close the transport and wait for the task.
    pub async fn close(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Sync task for {} failed: {e}", self.shared.doc_id);
            }
        }
        self.shared.disconnected();
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Bounded exponential backoff; the delay is drawn from the upper half of
/// the current window.
fn reconnect_delay(config: &SyncConfig, attempt: u32) -> Duration {
    let window = config
        .min_reconnect_delay
        .saturating_mul(1u32 << attempt.min(16))
        .min(config.max_reconnect_delay);
    let half = window / 2;
    let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
    (half + Duration::from_millis(jitter_ms)).min(config.max_reconnect_delay)
}

async fn run_sync_loop(shared: Arc<Shared>, config: SyncConfig, mut shutdown_rx: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);

        let connected = tokio::select! {
            result = tokio::time::timeout(
                config.connection_timeout,
                tokio_tungstenite::connect_async(config.server_url.as_str()),
            ) => result,
            _ = shutdown_rx.changed() => break,
        };

        let end = match connected {
            Ok(Ok((ws, _))) => {
                let end = match run_session(&shared, &config, ws, &mut shutdown_rx).await {
                    Ok(end) => end,
                    Err(e) => {
                        log::warn!("Sync session for {} failed: {e}", shared.doc_id);
                        SessionEnd::Disconnected
                    }
                };
                if shared.state() == ConnectionState::Synced {
                    attempt = 0;
                }
                end
            }
            Ok(Err(e)) => {
                log::debug!("Connecting to {} failed: {e}", config.server_url);
                SessionEnd::Disconnected
            }
            Err(_) => {
                log::debug!("Connecting to {} timed out", config.server_url);
                SessionEnd::Disconnected
            }
        };

        shared.disconnected();
        if end == SessionEnd::Closed {
            break;
        }

        let delay = reconnect_delay(&config, attempt);
        attempt = attempt.saturating_add(1);
        log::debug!("Reconnecting {} in {delay:?}", shared.doc_id);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    shared.disconnected();
}

async fn send_frame(sink: &mut ClientSink, msg: &SyncMessage) -> Result<(), SyncError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into()))
        .await
        .map_err(|e| SyncError::Connectivity(e.to_string()))
}

async fn run_session(
    shared: &Arc<Shared>,
    config: &SyncConfig,
    ws: ClientStream,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, SyncError> {
    let (mut sink, mut stream) = ws.split();
    let doc_id = shared.doc_id.as_str();

    // A fresh peer id per connection keeps a late leave of the previous
    // connection from touching this one.
    let info = PeerInfo::new(shared.user_id.clone(), shared.name.clone());
    let peer_id = info.peer_id;
    send_frame(&mut sink, &SyncMessage::peer_joined(doc_id, &info)?).await?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    *guard(&shared.outgoing) = Some(out_tx);
    shared.set_state(ConnectionState::Reconciling);

    let held_offline = guard(&shared.locks).owned_by(&shared.user_id);
    for cell_id in held_offline {
        shared.send(SyncMessage::lock_update(peer_id, doc_id, &LockMessage::Acquire { cell_id })?);
    }
    let cursor = lock_store(&shared.store).sync_cursor().cloned();
    shared.send(SyncMessage::full_sync_request(peer_id, doc_id, cursor.as_ref())?);

    let mut rounds = 0usize;
    let mut received = 0usize;
    let mut sent = 0usize;
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                while let Ok(msg) = out_rx.try_recv() {
                    let _ = send_frame(&mut sink, &msg).await;
                }
                let _ = send_frame(&mut sink, &SyncMessage::peer_left(peer_id, doc_id)).await;
                let _ = sink.send(Message::Close(None)).await;
                return Ok(SessionEnd::Closed);
            }

            Some(msg) = out_rx.recv() => send_frame(&mut sink, &msg).await?,

            _ = heartbeat.tick() => send_frame(&mut sink, &SyncMessage::ping(peer_id)).await?,

            frame = stream.next() => {
                let bytes: Vec<u8> = match frame {
                    Some(Ok(Message::Binary(data))) => data.into(),
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                    Some(Err(e)) => return Err(SyncError::Connectivity(e.to_string())),
                    Some(Ok(_)) => continue,
                };
                let msg = match SyncMessage::decode(&bytes) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("Undecodable frame for {doc_id}: {e}");
                        continue;
                    }
                };

                match msg.msg_type {
                    MessageType::FullSyncResponse => {
                        let response = msg.sync_response()?;
                        let applied = shared.merge_remote(&response.patch);
                        received += applied;
                        if applied > 0 {
                            shared.emit(SyncEvent::RemotePatch { peer_id: Uuid::nil(), applied });
                        }
                        if shared.state() != ConnectionState::Reconciling {
                            continue;
                        }

                        rounds += 1;
                        let local = lock_store(&shared.store).diff_since(&response.cursor);
                        if applied == 0 && local.is_empty() {
                            lock_store(&shared.store).set_sync_cursor(response.cursor);
                            shared.set_state(ConnectionState::Synced);
                            log::info!("{doc_id} synced ({rounds} rounds, {received} in, {sent} out)");
                            shared.emit(SyncEvent::Reconciled { rounds, received, sent });
                            continue;
                        }

                        if !local.is_empty() {
                            sent += local.len();
                            let clock = lock_store(&shared.store).counter();
                            shared.send(SyncMessage::patch(peer_id, doc_id, clock, &local)?);
                        }
                        if rounds >= config.max_reconcile_rounds {
                            log::warn!("{doc_id}: reconciliation still moving after {rounds} rounds");
                            shared.set_state(ConnectionState::Synced);
                            shared.emit(SyncEvent::Reconciled { rounds, received, sent });
                        } else {
                            shared.send(SyncMessage::full_sync_request(peer_id, doc_id, Some(&response.cursor))?);
                        }
                    }
                    MessageType::Patch => {
                        if msg.peer_id == peer_id {
                            continue;
                        }
                        let patch = msg.patch_payload()?;
                        let applied = shared.merge_remote(&patch);
                        if applied > 0 {
                            shared.emit(SyncEvent::RemotePatch { peer_id: msg.peer_id, applied });
                        }
                    }
                    MessageType::LockUpdate => shared.handle_lock(msg.lock_message()?),
                    MessageType::PeerJoined => {
                        if msg.peer_id != peer_id {
                            shared.emit(SyncEvent::PeerJoined(msg.peer_info()?));
                        }
                    }
                    MessageType::PeerLeft => shared.emit(SyncEvent::PeerLeft(msg.peer_id)),
                    MessageType::Error => {
                        let reason = msg.error_reason()?;
                        log::warn!("Room {doc_id} refused the session: {reason}");
                        shared.emit(SyncEvent::RoomError(reason));
                        return Ok(SessionEnd::Disconnected);
                    }
                    MessageType::Ping => send_frame(&mut sink, &SyncMessage::pong(peer_id)).await?,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::LockInfo;
    use sheett_core::MergeableStore;

    fn synchronizer() -> Synchronizer {
        let store: SharedStore = Arc::new(Mutex::new(MergeableStore::with_replica("doc", "A")));
        Synchronizer::new("doc", "u1", "Alice", store, SyncConfig::for_testing("ws://127.0.0.1:1"))
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(1));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_reconnect_delay_is_bounded() {
        let config = SyncConfig::default();
        for attempt in 0..40 {
            let delay = reconnect_delay(&config, attempt);
            assert!(delay <= config.max_reconnect_delay);
        }
        let first = reconnect_delay(&config, 0);
        assert!(first >= config.min_reconnect_delay / 2);
        assert!(first <= config.min_reconnect_delay);
    }

    #[test]
    fn test_initial_state() {
        let mut sync = synchronizer();
        assert_eq!(sync.state(), ConnectionState::Disconnected);
        assert!(sync.take_event_rx().is_some());
        assert!(sync.take_event_rx().is_none());
    }

    #[test]
    fn test_send_patch_offline_is_deferred() {
        let sync = synchronizer();
        let patch = lock_store(&sync.shared.store).set_value("name", "Budget");
        assert!(!sync.send_patch(&patch));
    }

    #[tokio::test]
    async fn test_offline_lock_granted_locally() {
        let sync = synchronizer();
        sync.try_lock("0-0").await.unwrap();
        assert_eq!(sync.lock_holder("0-0").as_deref(), Some("u1"));
        assert_eq!(sync.owned_locks(), vec!["0-0"]);

        assert!(sync.unlock("0-0"));
        assert!(!sync.unlock("0-0"));
        assert_eq!(sync.lock_holder("0-0"), None);
    }

    #[tokio::test]
    async fn test_lock_held_by_other_fails_fast() {
        let sync = synchronizer();
        sync.shared.handle_lock(LockMessage::Locked(LockInfo {
            cell_id: "0-0".into(),
            owner_id: "u2".into(),
            acquired_at_ms: 1,
        }));
        assert_eq!(
            sync.try_lock("0-0").await,
            Err(SyncError::LockHeldByOther {
                cell_id: "0-0".into(),
                holder: "u2".into()
            })
        );
        // Non-owner unlock is a no-op.
        assert!(!sync.unlock("0-0"));
    }

    #[tokio::test]
    async fn test_refused_offline_lock_emits_lock_lost() {
        let mut sync = synchronizer();
        let mut events = sync.take_event_rx().unwrap();
        sync.try_lock("2-3").await.unwrap();

        sync.shared.handle_lock(LockMessage::Denied {
            cell_id: "2-3".into(),
            holder: "u9".into(),
        });

        assert_eq!(
            events.recv().await,
            Some(SyncEvent::LockLost {
                cell_id: "2-3".into(),
                holder: "u9".into()
            })
        );
        assert_eq!(sync.lock_holder("2-3").as_deref(), Some("u9"));
    }

    #[tokio::test]
    async fn test_remote_merge_feeds_sink() {
        struct Counter(Mutex<usize>);
        impl PatchSink for Counter {
            fn record(&self, patch: &Patch) {
                *self.0.lock().unwrap() += patch.len();
            }
        }

        let sync = synchronizer();
        let counter = Arc::new(Counter(Mutex::new(0)));
        sync.set_patch_sink(counter.clone());

        let mut remote = MergeableStore::with_replica("doc", "B");
        let patch = remote.set_value("description", "Q1 plan");
        assert_eq!(sync.shared.merge_remote(&patch), 1);
        assert_eq!(sync.shared.merge_remote(&patch), 0);
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_cancels_retries() {
        let mut sync = synchronizer();
        sync.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), sync.close())
            .await
            .unwrap();
        assert_eq!(sync.state(), ConnectionState::Disconnected);
    }
}
