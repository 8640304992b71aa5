//! Fan-out of encoded frames to every connection of one room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` frames; a receiver that falls further behind observes
//! `Lagged` and must resynchronize from the room.
//!
//! The group is owned by its room actor, so membership needs no lock.
//! Receivers see every frame, including their own; connection tasks skip
//! frames whose `peer_id` is their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Frame as delivered to connection tasks.
pub type Frame = Arc<Vec<u8>>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames sent while nobody was subscribed
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters shared with whoever wants to read them without the actor.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: HashMap<Uuid, PeerInfo>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: HashMap::new(),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Add a peer and hand back its receiver.
    ///
    /// The receiver only sees frames sent after this call.
    pub fn add_peer(&mut self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        self.peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub fn remove_peer(&mut self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    /// Encode and fan out a message.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Fan out an already encoded frame.
    pub fn broadcast_raw(&self, encoded: Frame) -> usize {
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(encoded) {
            Ok(count) => count,
            Err(_) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    pub fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Whether another live connection belongs to `user_id`.
    pub fn has_user(&self, user_id: &str) -> bool {
        self.peers.values().any(|p| p.user_id == user_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver not tied to a peer (monitoring, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }
}
