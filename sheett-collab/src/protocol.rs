//! Binary wire protocol between synchronizers and room actors.
//!
//! Every frame is one bincode-encoded [`SyncMessage`] envelope:
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len+utf8 │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are bincode-encoded as well: a [`Patch`] for `patch`, an
//! optional cursor for `full-sync-request`, a [`SyncResponse`] for
//! `full-sync-response`, a [`LockMessage`] for `lock-update`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sheett_core::{Patch, VersionVector};
use thiserror::Error;
use uuid::Uuid;

use crate::locks::LockMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks for everything newer than its cursor
    FullSyncRequest = 1,
    /// Room answers with the diff and its canonical cursor
    FullSyncResponse = 2,
    /// Incremental field changes
    Patch = 3,
    /// Advisory lock request or broadcast
    LockUpdate = 4,
    /// Peer joined notification (also the client's opening frame)
    PeerJoined = 5,
    /// Peer left notification
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Room refused the connection or a request
    Error = 9,
}

impl MessageType {
    /// Envelope type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::FullSyncRequest => "full-sync-request",
            MessageType::FullSyncResponse => "full-sync-response",
            MessageType::Patch => "patch",
            MessageType::LockUpdate => "lock-update",
            MessageType::PeerJoined => "peer-joined",
            MessageType::PeerLeft => "peer-left",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Error => "error",
        }
    }
}

/// Connection identity.
///
/// `user_id` comes from the external identity provider and is what locks
/// are owned by; `peer_id` identifies one connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub user_id: String,
    pub name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Payload of a `full-sync-response`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Canonical changes the requester has not seen
    pub patch: Patch,
    /// Canonical version vector at the time the diff was taken
    pub cursor: VersionVector,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Sender's Lamport counter (informational)
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.to_string(),
            clock,
            payload,
        }
    }

    /// Create an incremental patch message.
    pub fn patch(peer_id: Uuid, doc_id: &str, clock: u64, patch: &Patch) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Patch, peer_id, doc_id, clock, encode_payload(patch)?))
    }

    /// Create a reconciliation request. `None` asks for the full state.
    pub fn full_sync_request(
        peer_id: Uuid,
        doc_id: &str,
        cursor: Option<&VersionVector>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::FullSyncRequest,
            peer_id,
            doc_id,
            0,
            encode_payload(&cursor)?,
        ))
    }

    /// Create a reconciliation response (sent by the room, nil peer).
    pub fn full_sync_response(doc_id: &str, response: &SyncResponse) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::FullSyncResponse,
            Uuid::nil(),
            doc_id,
            0,
            encode_payload(response)?,
        ))
    }

    /// Create a lock request or lock broadcast.
    pub fn lock_update(peer_id: Uuid, doc_id: &str, msg: &LockMessage) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::LockUpdate, peer_id, doc_id, 0, encode_payload(msg)?))
    }

    /// Create a peer joined notification.
    pub fn peer_joined(doc_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::PeerJoined,
            info.peer_id,
            doc_id,
            0,
            encode_payload(info)?,
        ))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, doc_id: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    /// Create an error notice carrying a reason string.
    pub fn error(doc_id: &str, reason: &str) -> Self {
        Self::new(
            MessageType::Error,
            Uuid::nil(),
            doc_id,
            0,
            reason.as_bytes().to_vec(),
        )
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    fn expect(&self, expected: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType {
                expected,
                actual: self.msg_type,
            });
        }
        Ok(())
    }

    /// Parse a `patch` payload.
    pub fn patch_payload(&self) -> Result<Patch, ProtocolError> {
        self.expect(MessageType::Patch)?;
        decode_payload(&self.payload)
    }

    /// Parse a `full-sync-request` payload.
    pub fn sync_cursor(&self) -> Result<Option<VersionVector>, ProtocolError> {
        self.expect(MessageType::FullSyncRequest)?;
        decode_payload(&self.payload)
    }

    /// Parse a `full-sync-response` payload.
    pub fn sync_response(&self) -> Result<SyncResponse, ProtocolError> {
        self.expect(MessageType::FullSyncResponse)?;
        decode_payload(&self.payload)
    }

    /// Parse a `lock-update` payload.
    pub fn lock_message(&self) -> Result<LockMessage, ProtocolError> {
        self.expect(MessageType::LockUpdate)?;
        decode_payload(&self.payload)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    /// Reason text of an `error` message.
    pub fn error_reason(&self) -> Result<String, ProtocolError> {
        self.expect(MessageType::Error)?;
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
