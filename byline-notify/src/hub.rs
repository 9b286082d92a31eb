//! The notification hub: the one entry point the rest of the server
//! talks to. Owns the registry, the batch dispatcher, the offline
//! store, and the background loops, and ties their lifetimes to a
//! single shutdown gate.
//!
//! Delivery rules live here. A unicast tries the live connection and
//! falls back to the backlog when the user is offline or the send is
//! refused. A broadcast partitions its recipients against one registry
//! snapshot: online users go through the batch dispatcher (where a
//! refused send is dropped), offline users get a backlog write.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::envelope::Envelope;
use crate::offline::{BacklogStore, OfflineStore};
use crate::reaper;
use crate::registry::{ConnectError, Registry};
use crate::stats::{HubStats, StatsSnapshot};
use crate::types::{Notification, UserId};

/// Tunables for the hub and its background loops.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Outbound queue depth per connection.
    pub outbound_queue: usize,
    /// Registry command queue depth.
    pub command_queue: usize,
    /// Dispatch ingress queue depth.
    pub dispatch_queue: usize,
    /// Maximum time a broadcast job waits before its batch is flushed.
    pub dispatch_window: Duration,
    /// Batch size that triggers an early flush.
    pub dispatch_threshold: usize,
    /// Backlog entries kept per user.
    pub backlog_cap: usize,
    /// Backlog retention per user.
    pub backlog_ttl: Duration,
    /// Idle time after which the reaper evicts a connection.
    pub max_idle: Duration,
    /// Reaper sweep period.
    pub sweep_interval: Duration,
    /// Liveness ping period for idle sockets.
    pub ping_interval: Duration,
    /// How long shutdown waits for writers to drain.
    pub shutdown_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            outbound_queue: 256,
            command_queue: 1024,
            dispatch_queue: 1024,
            dispatch_window: Duration::from_millis(100),
            dispatch_threshold: 10,
            backlog_cap: 100,
            backlog_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_idle: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Hub {
    config: HubConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    offline: Arc<OfflineStore>,
    stats: Arc<HubStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Bring up the hub and its background loops over the given backlog
    /// store.
    pub fn start(config: HubConfig, store: Arc<dyn BacklogStore>) -> Arc<Self> {
        let stats = Arc::new(HubStats::default());
        let offline = Arc::new(OfflineStore::new(
            store,
            config.backlog_cap,
            config.backlog_ttl,
            stats.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (registry, registry_task) = Registry::start(
            config.command_queue,
            offline.clone(),
            stats.clone(),
            shutdown_rx.clone(),
        );
        let (dispatcher, dispatch_task) = Dispatcher::start(
            config.dispatch_queue,
            config.dispatch_window,
            config.dispatch_threshold,
            registry.clone(),
            stats.clone(),
            shutdown_rx.clone(),
        );
        let reaper_task = reaper::start(
            config.sweep_interval,
            config.max_idle,
            registry.clone(),
            shutdown_rx,
        );
        Arc::new(Hub {
            config,
            registry,
            dispatcher,
            offline,
            stats,
            shutdown,
            tasks: Mutex::new(vec![registry_task, dispatch_task, reaper_task]),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// A receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open a connection for `user_id` and install it in the registry,
    /// displacing any previous one. The returned receiver is the
    /// connection's outbound queue; the caller owns draining it.
    pub async fn connect(
        &self,
        user_id: UserId,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<Envelope>), ConnectError> {
        let (tx, rx) = mpsc::channel(self.config.outbound_queue);
        let conn = Arc::new(Connection::new(user_id, tx));
        self.registry.register(conn.clone()).await?;
        Ok((conn, rx))
    }

    /// Queue removal of a connection. Safe to call for an already
    /// displaced connection; the id match makes it a no-op then.
    pub fn disconnect(&self, conn: &Connection) {
        self.registry.unregister(conn.user_id(), conn.conn_id());
    }

    // ── Delivery ─────────────────────────────────────────────────────

    /// Deliver one notification to one user, falling back to the
    /// backlog when the user is offline or the live send is refused.
    pub fn send_to_user(&self, user_id: UserId, notification: Notification) {
        let envelope = Envelope::notification(notification.body, notification.message_id);
        match self.registry.get(user_id) {
            Some(conn) => match conn.send(envelope.clone()) {
                Ok(()) => self.stats.record_sent(),
                Err(e) => {
                    self.stats.record_error();
                    tracing::debug!(user = %user_id, "Live send refused, storing offline: {e}");
                    self.offline.store(user_id, &envelope);
                }
            },
            None => self.offline.store(user_id, &envelope),
        }
    }

    /// Deliver one notification to many users. Recipients are split
    /// online/offline against a single registry snapshot; every copy
    /// shares the message id. The online half goes to the dispatcher as
    /// one batch job.
    pub fn send_to_users(&self, users: &[UserId], notification: Notification) {
        let envelope = Envelope::notification(notification.body, notification.message_id);
        let (online, offline) = self.registry.partition(users);
        tracing::debug!(
            online = online.len(),
            offline = offline.len(),
            "Broadcast partitioned"
        );
        for user_id in offline {
            self.offline.store(user_id, &envelope);
        }
        if !online.is_empty() {
            self.dispatcher.enqueue(online, envelope);
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.registry.is_online(user_id)
    }

    pub fn list_online(&self) -> Vec<UserId> {
        self.registry.list_online()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.registry.len() as u64)
    }

    pub(crate) fn counters(&self) -> &HubStats {
        &self.stats
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Stop the background loops, close every connection, and wait up
    /// to the configured timeout for their writers to drain. A second
    /// call returns immediately.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("Hub shutting down");
        // Join the loops first; once the coordinator exits the registry
        // is frozen and the snapshot below is final.
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        let connections = self.registry.snapshot();
        for conn in &connections {
            conn.close();
        }
        let waits: Vec<_> = connections.iter().map(|conn| conn.wait_done()).collect();
        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            futures_util::future::join_all(waits),
        )
        .await;
        match drained {
            Ok(_) => {
                tracing::info!(connections = connections.len(), "Hub stopped");
            }
            Err(_) => {
                let undrained = connections.iter().filter(|conn| !conn.is_done()).count();
                tracing::warn!(undrained, "Shutdown timed out waiting for writers to drain");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::MemoryBacklog;
    use serde_json::json;

    fn test_config() -> HubConfig {
        HubConfig {
            dispatch_window: Duration::from_millis(20),
            dispatch_threshold: 2,
            sweep_interval: Duration::from_secs(3600),
            ping_interval: Duration::from_secs(3600),
            shutdown_timeout: Duration::from_millis(500),
            ..HubConfig::default()
        }
    }

    fn start_hub(config: HubConfig) -> (Arc<Hub>, Arc<MemoryBacklog>) {
        let backlog = Arc::new(MemoryBacklog::new());
        let hub = Hub::start(config, backlog.clone());
        (hub, backlog)
    }

    async fn recv_soon(rx: &mut mpsc::Receiver<Envelope>) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn unicast_reaches_a_live_connection() {
        let (hub, _backlog) = start_hub(test_config());
        let (_conn, mut rx) = hub.connect(UserId(1)).await.unwrap();
        hub.send_to_user(UserId(1), Notification::new(json!({"post": 7})));
        let env = recv_soon(&mut rx).await;
        assert_eq!(env.data, json!({"post": 7}));
        assert!(env.message_id.is_some());
        assert_eq!(hub.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn unicast_to_offline_user_lands_in_backlog() {
        let (hub, backlog) = start_hub(test_config());
        hub.send_to_user(UserId(5), Notification::new(json!({"post": 1})));
        let stored = backlog.read_all(&OfflineStore::key(UserId(5))).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(hub.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn unicast_falls_back_when_the_queue_is_full() {
        let config = HubConfig {
            outbound_queue: 1,
            ..test_config()
        };
        let (hub, backlog) = start_hub(config);
        let (_conn, _rx) = hub.connect(UserId(1)).await.unwrap();
        hub.send_to_user(UserId(1), Notification::new(json!({"n": 1})));
        hub.send_to_user(UserId(1), Notification::new(json!({"n": 2})));
        let stored = backlog.read_all(&OfflineStore::key(UserId(1))).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].contains("\"n\":2"));
        assert_eq!(hub.stats().messages_sent, 1);
        assert_eq!(hub.stats().connection_errors, 1);
    }

    #[tokio::test]
    async fn broadcast_splits_online_and_offline() {
        let (hub, backlog) = start_hub(test_config());
        let (_conn, mut rx) = hub.connect(UserId(1)).await.unwrap();
        hub.send_to_users(
            &[UserId(1), UserId(2)],
            Notification::with_message_id(json!({"post": 3}), "b1"),
        );
        let env = recv_soon(&mut rx).await;
        assert_eq!(env.message_id.as_deref(), Some("b1"));
        let stored = backlog.read_all(&OfflineStore::key(UserId(2))).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].contains("\"b1\""));
    }

    #[tokio::test]
    async fn stats_counts_registered_connections() {
        let (hub, _backlog) = start_hub(test_config());
        let (_c1, _r1) = hub.connect(UserId(1)).await.unwrap();
        let (_c2, _r2) = hub.connect(UserId(2)).await.unwrap();
        let snapshot = hub.stats();
        assert_eq!(snapshot.active_connections, 2);
        assert_eq!(snapshot.total_connections, 2);
        assert!(hub.is_online(UserId(1)));
        assert_eq!(hub.list_online(), vec![UserId(1), UserId(2)]);
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_returns() {
        let (hub, _backlog) = start_hub(test_config());
        let (conn, rx) = hub.connect(UserId(1)).await.unwrap();
        drop(rx); // writer already drained
        hub.shutdown().await;
        assert!(conn.is_closed());
        // Second call is a no-op.
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_gives_up_on_stuck_writers() {
        let (hub, _backlog) = start_hub(test_config());
        let (conn, rx) = hub.connect(UserId(1)).await.unwrap();
        let started = std::time::Instant::now();
        hub.shutdown().await;
        assert!(conn.is_closed());
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(rx);
    }

    #[tokio::test]
    async fn connect_after_shutdown_is_refused() {
        let (hub, _backlog) = start_hub(test_config());
        hub.shutdown().await;
        assert_eq!(
            hub.connect(UserId(1)).await.err(),
            Some(ConnectError::ShuttingDown)
        );
    }
}
