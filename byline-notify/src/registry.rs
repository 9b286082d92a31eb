//! Connection registry.
//!
//! Mutations (register/unregister) are serialized through one coordinator
//! task fed by a bounded command channel; delivery paths only ever take
//! the read half of the map lock. Registering a user displaces any
//! previous connection (one live socket per user) and kicks off backlog
//! replay. Unregistration carries the connection id, so a displaced
//! connection's late unregister cannot evict its successor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::offline::OfflineStore;
use crate::stats::HubStats;
use crate::types::UserId;

/// Registration failure. Either way the socket should be shut
/// immediately; the client may reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The coordinator's command queue is full.
    #[error("registration queue full")]
    Rejected,
    /// The hub is shutting down.
    #[error("hub is shutting down")]
    ShuttingDown,
}

enum Command {
    Register {
        conn: Arc<Connection>,
        done: oneshot::Sender<()>,
    },
    Unregister {
        user_id: UserId,
        conn_id: u64,
    },
}

pub struct Registry {
    connections: RwLock<HashMap<UserId, Arc<Connection>>>,
    commands: mpsc::Sender<Command>,
    offline: Arc<OfflineStore>,
    stats: Arc<HubStats>,
}

impl Registry {
    /// Create the registry and spawn its coordinator, which runs until
    /// `shutdown` flips or every command sender is gone.
    pub fn start(
        command_capacity: usize,
        offline: Arc<OfflineStore>,
        stats: Arc<HubStats>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (registry, commands) = Self::new(command_capacity, offline, stats);
        let registry = Arc::new(registry);
        let handle = tokio::spawn(coordinator(registry.clone(), commands, shutdown));
        (registry, handle)
    }

    fn new(
        command_capacity: usize,
        offline: Arc<OfflineStore>,
        stats: Arc<HubStats>,
    ) -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(command_capacity);
        let registry = Registry {
            connections: RwLock::new(HashMap::new()),
            commands: tx,
            offline,
            stats,
        };
        (registry, rx)
    }

    // ── Serialized mutation path ─────────────────────────────────────

    /// Install a connection, displacing any previous one for the same
    /// user. Resolves once the coordinator has performed the swap. A full
    /// command queue rejects the registration outright.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), ConnectError> {
        let (done, ack) = oneshot::channel();
        self.commands
            .try_send(Command::Register { conn, done })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ConnectError::Rejected,
                mpsc::error::TrySendError::Closed(_) => ConnectError::ShuttingDown,
            })?;
        ack.await.map_err(|_| ConnectError::ShuttingDown)
    }

    /// Queue removal of a connection, matched by id. Fire-and-forget: if
    /// the command queue is full the request is dropped with a warning
    /// and the reaper's next sweep picks the connection up again.
    pub fn unregister(&self, user_id: UserId, conn_id: u64) {
        let cmd = Command::Unregister { user_id, conn_id };
        if self.commands.try_send(cmd).is_err() {
            tracing::warn!(user = %user_id, "Unregister dropped, command queue full or closed");
        }
    }

    // ── Shared read path ─────────────────────────────────────────────

    pub fn get(&self, user_id: UserId) -> Option<Arc<Connection>> {
        self.connections.read().get(&user_id).cloned()
    }

    /// True when the user has a registered, not-yet-closed connection.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.connections
            .read()
            .get(&user_id)
            .is_some_and(|conn| !conn.is_closed())
    }

    pub fn list_online(&self) -> Vec<UserId> {
        let map = self.connections.read();
        let mut users: Vec<UserId> = map
            .values()
            .filter(|conn| !conn.is_closed())
            .map(|conn| conn.user_id())
            .collect();
        users.sort_unstable();
        users
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered connection. Used by the reaper and at shutdown.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Split `users` into online and offline under a single read
    /// acquisition: a broadcast partitions against one consistent view
    /// of the registry.
    pub fn partition(&self, users: &[UserId]) -> (Vec<UserId>, Vec<UserId>) {
        let map = self.connections.read();
        let mut online = Vec::new();
        let mut offline = Vec::new();
        for &user_id in users {
            match map.get(&user_id) {
                Some(conn) if !conn.is_closed() => online.push(user_id),
                _ => offline.push(user_id),
            }
        }
        (online, offline)
    }

    /// One read-lock acquisition covering a whole batch flush.
    pub(crate) fn read_map(&self) -> RwLockReadGuard<'_, HashMap<UserId, Arc<Connection>>> {
        self.connections.read()
    }
}

/// Serialized mutation loop. Owns the write side of the map.
async fn coordinator(
    registry: Arc<Registry>,
    mut commands: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let cmd = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            maybe = commands.recv() => match maybe {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            Command::Register { conn, done } => {
                let user_id = conn.user_id();
                let conn_id = conn.conn_id();
                let displaced = {
                    let mut map = registry.connections.write();
                    map.insert(user_id, conn.clone())
                };
                if let Some(old) = displaced {
                    tracing::info!(
                        user = %user_id,
                        old_conn = old.conn_id(),
                        new_conn = conn_id,
                        "Connection displaced by new registration"
                    );
                    old.close();
                }
                registry.stats.record_connection();
                let _ = done.send(());
                tracing::debug!(user = %user_id, conn = conn_id, "Registered");
                // Replay runs off the command path.
                let offline = registry.offline.clone();
                tokio::spawn(async move {
                    offline.replay(&conn);
                });
            }
            Command::Unregister { user_id, conn_id } => {
                let removed = {
                    let mut map = registry.connections.write();
                    match map.get(&user_id) {
                        Some(current) if current.conn_id() == conn_id => map.remove(&user_id),
                        _ => None,
                    }
                };
                match removed {
                    Some(conn) => {
                        conn.close();
                        tracing::debug!(user = %user_id, conn = conn_id, "Unregistered");
                    }
                    None => {
                        tracing::debug!(user = %user_id, conn = conn_id, "Stale unregister ignored");
                    }
                }
            }
        }
    }
    tracing::debug!("Registry coordinator stopped");
}
