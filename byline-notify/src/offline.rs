//! Offline backlog: notifications parked for users with no live
//! connection, replayed newest-first on reconnect.
//!
//! The backing store is a per-user list with a length cap and a TTL,
//! behind [`BacklogStore`]. Store failures are absorbed and logged; the
//! unicast contract is best-effort, and a dead store must not take the
//! send path down with it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::stats::HubStats;
use crate::types::UserId;

/// Failure surfaced by a backlog backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backlog store unavailable: {0}")]
    Unavailable(String),
}

/// Per-user durable list with TTL and cap. Newest entries first.
pub trait BacklogStore: Send + Sync {
    /// Add a value at the newest end of the list.
    fn append(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Drop everything beyond the newest `n` entries.
    fn trim_to_length(&self, key: &str, n: usize) -> Result<(), StoreError>;
    /// Set or refresh the list's time-to-live.
    fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
    /// All entries, newest first.
    fn read_all(&self, key: &str) -> Result<Vec<String>, StoreError>;
    /// Remove the list and its TTL.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

// ── In-memory backend ────────────────────────────────────────────────

struct MemoryList {
    /// Newest entry at the front.
    entries: VecDeque<String>,
    expires_at: Option<Instant>,
}

/// Process-local backend, used when the server runs without a database
/// path and by tests.
#[derive(Default)]
pub struct MemoryBacklog {
    lists: Mutex<HashMap<String, MemoryList>>,
}

impl MemoryBacklog {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(lists: &mut HashMap<String, MemoryList>, key: &str) {
        let expired = lists
            .get(key)
            .and_then(|list| list.expires_at)
            .is_some_and(|at| Instant::now() >= at);
        if expired {
            lists.remove(key);
        }
    }
}

impl BacklogStore for MemoryBacklog {
    fn append(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut lists = self.lists.lock();
        Self::purge_expired(&mut lists, key);
        lists
            .entry(key.to_string())
            .or_insert_with(|| MemoryList {
                entries: VecDeque::new(),
                expires_at: None,
            })
            .entries
            .push_front(value.to_string());
        Ok(())
    }

    fn trim_to_length(&self, key: &str, n: usize) -> Result<(), StoreError> {
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get_mut(key) {
            list.entries.truncate(n);
        }
        Ok(())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get_mut(key) {
            list.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    fn read_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut lists = self.lists.lock();
        Self::purge_expired(&mut lists, key);
        Ok(lists
            .get(key)
            .map(|list| list.entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lists.lock().remove(key);
        Ok(())
    }
}

// ── Backlog semantics ────────────────────────────────────────────────

/// Cap and TTL on write, newest-first replay with early stop, clear only
/// after a full replay.
pub struct OfflineStore {
    store: Arc<dyn BacklogStore>,
    cap: usize,
    ttl: Duration,
    stats: Arc<HubStats>,
}

impl OfflineStore {
    pub fn new(
        store: Arc<dyn BacklogStore>,
        cap: usize,
        ttl: Duration,
        stats: Arc<HubStats>,
    ) -> Self {
        OfflineStore {
            store,
            cap,
            ttl,
            stats,
        }
    }

    /// The per-user list key.
    pub fn key(user_id: UserId) -> String {
        format!("notify:backlog:{user_id}")
    }

    /// Park an envelope for an offline user: append, trim to the cap,
    /// refresh the TTL. Failures are logged and absorbed.
    pub fn store(&self, user_id: UserId, envelope: &Envelope) {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(user = %user_id, "Unserializable envelope, dropping: {e}");
                return;
            }
        };
        let key = Self::key(user_id);
        let result = self
            .store
            .append(&key, &json)
            .and_then(|_| self.store.trim_to_length(&key, self.cap))
            .and_then(|_| self.store.expire(&key, self.ttl));
        match result {
            Ok(()) => tracing::debug!(user = %user_id, "Notification parked in backlog"),
            Err(e) => {
                tracing::warn!(user = %user_id, "Backlog write failed, dropping notification: {e}");
            }
        }
    }

    /// Replay the user's backlog into a fresh connection, newest first.
    /// Stops at the first failed send, leaving the backlog untouched for
    /// the next reconnect. The backlog is cleared only when every entry
    /// was handed off; an entry that no longer parses is dropped, since
    /// it can never be delivered.
    pub fn replay(&self, conn: &Connection) {
        let user_id = conn.user_id();
        let key = Self::key(user_id);
        let entries = match self.store.read_all(&key) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(user = %user_id, "Backlog read failed, skipping replay: {e}");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        let total = entries.len();
        let mut handed_off = 0usize;
        let mut delivered = 0u64;
        for entry in &entries {
            let envelope = match Envelope::parse(entry) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(user = %user_id, "Dropping unreadable backlog entry: {e}");
                    handed_off += 1;
                    continue;
                }
            };
            if conn.send(envelope).is_err() {
                break;
            }
            handed_off += 1;
            delivered += 1;
        }
        self.stats.add_sent(delivered);
        if handed_off == total {
            if let Err(e) = self.store.delete(&key) {
                tracing::warn!(user = %user_id, "Backlog clear failed after replay: {e}");
            }
            tracing::debug!(user = %user_id, count = delivered, "Backlog replayed");
        } else {
            tracing::debug!(
                user = %user_id,
                delivered,
                remaining = total - handed_off,
                "Backlog replay interrupted, entries kept for next reconnect"
            );
        }
    }
}
