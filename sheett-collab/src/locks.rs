//! Advisory cell locks for editing turn-taking.
//!
//! Locks never touch the mergeable store: they live in the room actor's
//! memory ([`LockTable`]) and reach clients as transient `lock-update`
//! broadcasts, mirrored client-side in a [`LockView`].
//!
//! ```text
//! Unlocked ──try_lock──► Locked(owner, acquired_at) ──unlock/expire/disconnect──► Unlocked
//! ```
//!
//! A lock expires after `timeout` without activity from its owner.
//! Re-acquiring or editing the cell counts as activity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use uuid::Uuid;

/// Default inactivity timeout before a lock auto-releases.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("Cell {cell_id} is locked by {holder}")]
    HeldByOther { cell_id: String, holder: String },
}

/// Public view of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub cell_id: String,
    pub owner_id: String,
    /// Wall-clock acquisition time (ms since epoch)
    pub acquired_at_ms: u64,
}

/// Lock traffic carried in `lock-update` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMessage {
    /// Client → room: lock a cell for the connection's user
    Acquire { cell_id: String },
    /// Client → room: release a cell
    Release { cell_id: String },
    /// Room → requester: lock granted
    Granted(LockInfo),
    /// Room → requester: lock held by someone else
    Denied { cell_id: String, holder: String },
    /// Room → everyone: a cell became locked
    Locked(LockInfo),
    /// Room → everyone: a cell became unlocked
    Unlocked { cell_id: String },
    /// Room → joining peer: all active locks
    Snapshot(Vec<LockInfo>),
}

struct HeldLock {
    owner_id: String,
    peer_id: Uuid,
    last_active: Instant,
    acquired_at_ms: u64,
}

impl HeldLock {
    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_active) >= timeout
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Authoritative lock state of one room.
pub struct LockTable {
    locks: HashMap<String, HeldLock>,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Acquire or refresh a lock.
    ///
    /// Succeeds if the cell is free, expired, or already held by `owner_id`.
    pub fn try_lock(
        &mut self,
        cell_id: &str,
        owner_id: &str,
        peer_id: Uuid,
        now: Instant,
    ) -> Result<LockInfo, LockError> {
        if let Some(held) = self.locks.get_mut(cell_id) {
            if held.owner_id == owner_id {
                held.last_active = now;
                held.peer_id = peer_id;
                return Ok(LockInfo {
                    cell_id: cell_id.to_string(),
                    owner_id: held.owner_id.clone(),
                    acquired_at_ms: held.acquired_at_ms,
                });
            }
            if !held.is_expired(now, self.timeout) {
                return Err(LockError::HeldByOther {
                    cell_id: cell_id.to_string(),
                    holder: held.owner_id.clone(),
                });
            }
        }

        let acquired_at_ms = wall_clock_ms();
        self.locks.insert(
            cell_id.to_string(),
            HeldLock {
                owner_id: owner_id.to_string(),
                peer_id,
                last_active: now,
                acquired_at_ms,
            },
        );
        Ok(LockInfo {
            cell_id: cell_id.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at_ms,
        })
    }

    /// Release a lock held by `owner_id`. No-op for anyone else.
    pub fn unlock(&mut self, cell_id: &str, owner_id: &str) -> bool {
        match self.locks.get(cell_id) {
            Some(held) if held.owner_id == owner_id => {
                self.locks.remove(cell_id);
                true
            }
            _ => false,
        }
    }

    /// Record owner activity on a cell, postponing expiry.
    pub fn touch(&mut self, cell_id: &str, owner_id: &str, now: Instant) {
        if let Some(held) = self.locks.get_mut(cell_id) {
            if held.owner_id == owner_id {
                held.last_active = now;
            }
        }
    }

    /// Drop every lock acquired through a connection. Returns freed cells.
    pub fn release_peer(&mut self, peer_id: Uuid) -> Vec<String> {
        let freed: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, held)| held.peer_id == peer_id)
            .map(|(cell, _)| cell.clone())
            .collect();
        for cell in &freed {
            self.locks.remove(cell);
        }
        freed
    }

    /// Drop locks idle for longer than the timeout. Returns freed cells.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.timeout;
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, held)| held.is_expired(now, timeout))
            .map(|(cell, _)| cell.clone())
            .collect();
        for cell in &expired {
            self.locks.remove(cell);
        }
        expired
    }

    /// Current valid holder of a cell.
    pub fn holder(&self, cell_id: &str, now: Instant) -> Option<&str> {
        self.locks
            .get(cell_id)
            .filter(|held| !held.is_expired(now, self.timeout))
            .map(|held| held.owner_id.as_str())
    }

    /// All held locks, ordered by cell id.
    pub fn snapshot(&self) -> Vec<LockInfo> {
        let mut locks: Vec<LockInfo> = self
            .locks
            .iter()
            .map(|(cell, held)| LockInfo {
                cell_id: cell.clone(),
                owner_id: held.owner_id.clone(),
                acquired_at_ms: held.acquired_at_ms,
            })
            .collect();
        locks.sort_by(|a, b| a.cell_id.cmp(&b.cell_id));
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Client-side mirror of a room's locks, fed by `lock-update` broadcasts.
#[derive(Debug, Default)]
pub struct LockView {
    locks: HashMap<String, LockInfo>,
}

impl LockView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a room broadcast into the mirror.
    ///
    /// Returns the `(cell_id, new owner)` pairs that changed.
    pub fn apply(&mut self, msg: &LockMessage) -> Vec<(String, Option<String>)> {
        match msg {
            LockMessage::Granted(info) | LockMessage::Locked(info) => {
                let changed = self
                    .locks
                    .get(&info.cell_id)
                    .map_or(true, |old| old.owner_id != info.owner_id);
                self.locks.insert(info.cell_id.clone(), info.clone());
                if changed {
                    vec![(info.cell_id.clone(), Some(info.owner_id.clone()))]
                } else {
                    Vec::new()
                }
            }
            LockMessage::Unlocked { cell_id } => match self.locks.remove(cell_id) {
                Some(_) => vec![(cell_id.clone(), None)],
                None => Vec::new(),
            },
            LockMessage::Denied { cell_id, holder } => {
                let info = LockInfo {
                    cell_id: cell_id.clone(),
                    owner_id: holder.clone(),
                    acquired_at_ms: 0,
                };
                self.apply(&LockMessage::Locked(info))
            }
            LockMessage::Snapshot(all) => {
                let mut changes: Vec<(String, Option<String>)> = self
                    .locks
                    .keys()
                    .filter(|cell| !all.iter().any(|l| &l.cell_id == *cell))
                    .map(|cell| (cell.clone(), None))
                    .collect();
                for (cell, _) in &changes {
                    self.locks.remove(cell);
                }
                for info in all {
                    changes.extend(self.apply(&LockMessage::Locked(info.clone())));
                }
                changes
            }
            LockMessage::Acquire { .. } | LockMessage::Release { .. } => Vec::new(),
        }
    }

    /// Record a lock taken while offline.
    pub fn insert_local(&mut self, cell_id: &str, owner_id: &str) {
        self.locks.insert(
            cell_id.to_string(),
            LockInfo {
                cell_id: cell_id.to_string(),
                owner_id: owner_id.to_string(),
                acquired_at_ms: wall_clock_ms(),
            },
        );
    }

    pub fn remove(&mut self, cell_id: &str) -> Option<LockInfo> {
        self.locks.remove(cell_id)
    }

    pub fn holder(&self, cell_id: &str) -> Option<&str> {
        self.locks.get(cell_id).map(|l| l.owner_id.as_str())
    }

    /// Cells currently attributed to `owner_id`.
    pub fn owned_by(&self, owner_id: &str) -> Vec<String> {
        let mut cells: Vec<String> = self
            .locks
            .values()
            .filter(|l| l.owner_id == owner_id)
            .map(|l| l.cell_id.clone())
            .collect();
        cells.sort();
        cells
    }

    /// Forget locks held by others (their state is unknown while offline).
    pub fn retain_owned_by(&mut self, owner_id: &str) {
        self.locks.retain(|_, l| l.owner_id == owner_id);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
