//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── connection task ──► RoomHandle ──► RoomActor (doc_id)
//! Client B ──┘         ▲                                 │
//!                      │          encoded frames         ├── MergeableStore
//!                      └──────── BroadcastGroup ◄────────┤
//!                                                        └── DocumentStore (RocksDB)
//! ```
//!
//! The first frame of every connection must be `peer-joined`; it names the
//! document and the user. If the room cannot load its persisted state the
//! connection receives an `error` frame and is closed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::locks::{LockMessage, DEFAULT_LOCK_TIMEOUT};
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::{RoomConfig, RoomHandle, RoomManager};
use crate::storage::{DocumentStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// How long a new connection may take to send its `peer-joined` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds; silent peers are dropped after three
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Inactivity timeout of advisory cell locks
    pub lock_timeout: Duration,
    /// Command queue depth per room actor
    pub room_command_capacity: usize,
    /// How long a persisted room stays loaded after its last peer leaves
    pub room_idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            room_command_capacity: 1024,
            room_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Small buffers and a short lock timeout.
    pub fn for_testing(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            max_peers_per_room: 10,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 30,
            storage_path: None,
            lock_timeout: Duration::from_millis(500),
            room_command_capacity: 64,
            room_idle_timeout: Duration::from_millis(300),
        }
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_peers: self.max_peers_per_room,
            lock_timeout: self.lock_timeout,
            lock_sweep_interval: (self.lock_timeout / 4)
                .clamp(Duration::from_millis(10), Duration::from_secs(1)),
            command_capacity: self.room_command_capacity,
            idle_timeout: self.room_idle_timeout,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub persisted_deltas: u64,
    pub persisted_snapshots: u64,
    /// Rooms unloaded after sitting empty
    pub evicted_rooms: u64,
    /// Connections refused (bad handshake, room failed to load, room full)
    pub rejected_connections: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let storage = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(DocumentStore::open(store_config)?))
            }
            None => None,
        };
        Ok(Self::build(config, storage))
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::build(ServerConfig::default(), None)
    }

    /// Create on top of an already open document store.
    pub fn with_store(config: ServerConfig, storage: Arc<DocumentStore>) -> Self {
        Self::build(config, Some(storage))
    }

    fn build(config: ServerConfig, storage: Option<Arc<DocumentStore>>) -> Self {
        let rooms = Arc::new(RoomManager::new(config.room_config(), storage));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown_tx,
        }
    }

    /// Accept connections until [`SyncServer::shutdown`] is called.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let rooms = self.rooms.clone();
                    let stats = self.stats.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        log::info!("Sync server on {} shutting down", self.config.bind_addr);
        self.rooms.shutdown().await;
        Ok(())
    }

    /// Stop accepting connections and checkpoint every room.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::serve_peer(ws_sender, ws_receiver, addr, &rooms, &stats, &config).await;

        stats.write().await.active_connections -= 1;
        result
    }

    async fn serve_peer(
        mut ws_sender: WsSink,
        mut ws_receiver: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        addr: SocketAddr,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        // Opening frame names the peer and the document.
        let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, Self::next_message(&mut ws_receiver)).await {
            Ok(Some(msg)) => msg,
            _ => {
                log::warn!("No handshake from {addr}");
                stats.write().await.rejected_connections += 1;
                return Ok(());
            }
        };
        let doc_id = hello.doc_id.clone();
        let info: PeerInfo = match hello.peer_info() {
            Ok(info) => info,
            Err(e) => {
                Self::reject(&mut ws_sender, stats, &doc_id, &format!("expected peer-joined: {e}")).await;
                return Ok(());
            }
        };
        let peer_id = info.peer_id;

        let (room, ack) = match rooms.join(&doc_id, info).await {
            Ok(joined) => joined,
            Err(e) => {
                Self::reject(&mut ws_sender, stats, &doc_id, &e.to_string()).await;
                return Ok(());
            }
        };

        // Bring the newcomer up to date on presence and locks.
        for peer in &ack.peers {
            Self::send(&mut ws_sender, &SyncMessage::peer_joined(&doc_id, peer)?).await?;
        }
        let locks = SyncMessage::lock_update(Uuid::nil(), &doc_id, &LockMessage::Snapshot(ack.locks))?;
        Self::send(&mut ws_sender, &locks).await?;

        stats.write().await.active_rooms = rooms.room_count().await;

        let mut frames = ack.frames;
        let result = Self::peer_loop(&mut ws_sender, &mut ws_receiver, &mut frames, &room, peer_id, stats, config).await;

        if let Err(e) = room.leave(peer_id).await {
            log::debug!("Leave of {peer_id} after room stopped: {e}");
        }
        log::info!("Connection {peer_id} from {addr} closed");
        result
    }

    async fn peer_loop(
        ws_sender: &mut WsSink,
        ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        frames: &mut broadcast::Receiver<crate::broadcast::Frame>,
        room: &RoomHandle,
        peer_id: Uuid,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        let heartbeat_period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval(heartbeat_period);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            last_seen = Instant::now();
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {peer_id}: {e}");
                                    continue;
                                }
                            };
                            if sync_msg.msg_type == MessageType::PeerLeft {
                                return Ok(());
                            }
                            match Self::dispatch(room, peer_id, sync_msg).await {
                                Ok(Some(reply)) => Self::send(ws_sender, &reply).await?,
                                Ok(None) => {}
                                Err(e) => {
                                    log::warn!("Room {} refused {peer_id}: {e}", room.doc_id());
                                    let _ = Self::send(ws_sender, &SyncMessage::error(room.doc_id(), &e.to_string())).await;
                                    return Ok(());
                                }
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => return Ok(()),

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {peer_id}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                frame = frames.recv() => {
                    match frame {
                        Ok(data) => {
                            // Don't echo back to sender
                            if let Ok(msg) = SyncMessage::decode(&data) {
                                if msg.peer_id == peer_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Missed patches are recovered with a full-state response.
                            log::warn!("Peer {peer_id} lagged by {n} frames, resending state");
                            let response = room.sync(None).await?;
                            Self::send(ws_sender, &SyncMessage::full_sync_response(room.doc_id(), &response)?).await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > heartbeat_period * 3 {
                        log::warn!("Peer {peer_id} silent for {:?}, dropping", last_seen.elapsed());
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Route one client frame to the room. Returns a direct reply, if any.
    async fn dispatch(
        room: &RoomHandle,
        peer_id: Uuid,
        msg: SyncMessage,
    ) -> Result<Option<SyncMessage>, BoxError> {
        match msg.msg_type {
            MessageType::Patch => {
                let patch = msg.patch_payload()?;
                room.apply_patch(peer_id, msg.clock, patch).await?;
                Ok(None)
            }
            MessageType::FullSyncRequest => {
                let cursor = msg.sync_cursor()?;
                let response = room.sync(cursor).await?;
                log::debug!(
                    "Sync for {peer_id} in {}: {} changes",
                    room.doc_id(),
                    response.patch.len()
                );
                Ok(Some(SyncMessage::full_sync_response(room.doc_id(), &response)?))
            }
            MessageType::LockUpdate => {
                let request = msg.lock_message()?;
                match room.lock(peer_id, request).await? {
                    Some(reply) => Ok(Some(SyncMessage::lock_update(Uuid::nil(), room.doc_id(), &reply)?)),
                    None => Ok(None),
                }
            }
            MessageType::Ping => Ok(Some(SyncMessage::pong(peer_id))),
            MessageType::Pong => Ok(None),
            other => {
                log::debug!("Unhandled message type from {peer_id}: {}", other.as_str());
                Ok(None)
            }
        }
    }

    /// Next binary frame that decodes, or `None` if the socket closed.
    async fn next_message(
        ws_receiver: &mut futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ) -> Option<SyncMessage> {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    match SyncMessage::decode(&bytes) {
                        Ok(msg) => return Some(msg),
                        Err(e) => log::warn!("Undecodable handshake frame: {e}"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => {}
            }
        }
        None
    }

    async fn reject(ws_sender: &mut WsSink, stats: &RwLock<ServerStats>, doc_id: &str, reason: &str) {
        log::warn!("Rejecting connection to {doc_id}: {reason}");
        stats.write().await.rejected_connections += 1;
        let _ = Self::send(ws_sender, &SyncMessage::error(doc_id, reason)).await;
        let _ = ws_sender.send(Message::Close(None)).await;
    }

    async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
        let encoded = msg.encode()?;
        ws_sender.send(Message::Binary(encoded.into())).await?;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let metrics = self.rooms.metrics();
        stats.active_rooms = self.rooms.room_count().await;
        stats.persisted_deltas = metrics.persisted_deltas.load(Ordering::Relaxed);
        stats.persisted_snapshots = metrics.persisted_snapshots.load(Ordering::Relaxed);
        stats.evicted_rooms = metrics.evicted_rooms.load(Ordering::Relaxed);
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.rooms.storage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_room_config_from_server_config() {
        let config = ServerConfig::for_testing("127.0.0.1:0");
        let room = config.room_config();
        assert_eq!(room.max_peers, 10);
        assert_eq!(room.broadcast_capacity, 64);
        assert_eq!(room.lock_timeout, Duration::from_millis(500));
        assert_eq!(room.lock_sweep_interval, Duration::from_millis(125));
        assert_eq!(room.idle_timeout, Duration::from_millis(300));
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store().is_none());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing("127.0.0.1:0")
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.store().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.persisted_deltas, 0);
        assert_eq!(stats.rejected_connections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap());
        let server = Arc::new(SyncServer::with_store(
            ServerConfig::for_testing(format!("127.0.0.1:{port}")),
            storage,
        ));
        let running = tokio::spawn({
            let server = server.clone();
            async move { server.run().await.map_err(|e| e.to_string()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), running).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
