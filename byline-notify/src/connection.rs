//! A single subscriber connection.
//!
//! Delivery never blocks: frames go through a bounded channel via
//! `try_send`, and a full or closed queue comes back to the caller as a
//! soft [`SendError`]. Closing is idempotent: the first `close()` flips
//! the flag under the connection's lock and wakes the transport loops,
//! which shut the socket down exactly once; every later call returns
//! immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::envelope::Envelope;
use crate::types::UserId;

/// Why a frame could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The outbound queue is full (slow or stalled consumer).
    #[error("outbound queue full")]
    Full,
    /// The connection is closed, or the transport dropped its receiver.
    #[error("connection closed")]
    Closed,
}

/// One live subscriber socket.
pub struct Connection {
    user_id: UserId,
    conn_id: u64,
    outbound: mpsc::Sender<Envelope>,
    closed: Mutex<bool>,
    teardown: Notify,
    last_activity: Mutex<Instant>,
}

impl Connection {
    pub(crate) fn new(user_id: UserId, outbound: mpsc::Sender<Envelope>) -> Self {
        static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
        Connection {
            user_id,
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            closed: Mutex::new(false),
            teardown: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Process-unique generation number. Successive connections of the
    /// same user get distinct ids; unregistration matches on it so a
    /// displaced connection's late unregister cannot evict its successor.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue a frame without blocking.
    pub fn send(&self, frame: Envelope) -> Result<(), SendError> {
        if *self.closed.lock() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// Close the connection. The first caller wins and wakes the
    /// transport loops; later calls return immediately.
    pub fn close(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.teardown.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Resolves once [`Connection::close`] has been called. The transport
    /// loops select on this so an external close (displacement, eviction,
    /// shutdown) reaches the socket.
    pub async fn closed(&self) {
        let notified = self.teardown.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Resolves once the transport dropped the outbound receiver, i.e.
    /// the write loop exited and the socket side is finished.
    pub async fn wait_done(&self) {
        self.outbound.closed().await;
    }

    /// True once the outbound receiver is gone.
    pub fn is_done(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use std::sync::Arc;

    fn conn_pair(user: u64, capacity: usize) -> (Arc<Connection>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Connection::new(UserId(user), tx)), rx)
    }

    #[test]
    fn send_reports_full_queue() {
        let (conn, _rx) = conn_pair(1, 1);
        assert!(conn.send(Envelope::ping()).is_ok());
        assert_eq!(conn.send(Envelope::ping()), Err(SendError::Full));
    }

    #[test]
    fn close_is_idempotent_and_fails_sends() {
        let (conn, _rx) = conn_pair(1, 4);
        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert_eq!(conn.send(Envelope::ping()), Err(SendError::Closed));
    }

    #[test]
    fn distinct_connections_get_distinct_ids() {
        let (a, _ra) = conn_pair(1, 1);
        let (b, _rb) = conn_pair(1, 1);
        assert_ne!(a.conn_id(), b.conn_id());
    }

    #[tokio::test]
    async fn closed_wakes_all_waiters() {
        let (conn, _rx) = conn_pair(1, 1);
        let a = conn.clone();
        let b = conn.clone();
        let wa = tokio::spawn(async move { a.closed().await });
        let wb = tokio::spawn(async move { b.closed().await });
        tokio::task::yield_now().await;
        conn.close();
        tokio::time::timeout(Duration::from_secs(1), async {
            wa.await.unwrap();
            wb.await.unwrap();
        })
        .await
        .expect("waiters should wake after close");
    }

    #[tokio::test]
    async fn closed_resolves_immediately_when_already_closed() {
        let (conn, _rx) = conn_pair(1, 1);
        conn.close();
        tokio::time::timeout(Duration::from_millis(50), conn.closed())
            .await
            .expect("closed() should not wait once the flag is set");
    }

    #[tokio::test]
    async fn wait_done_resolves_when_receiver_drops() {
        let (conn, rx) = conn_pair(1, 1);
        assert!(!conn.is_done());
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), conn.wait_done())
            .await
            .expect("wait_done should resolve after the receiver drops");
        assert!(conn.is_done());
    }

    #[tokio::test]
    async fn many_concurrent_closes_are_safe() {
        let (conn, _rx) = conn_pair(7, 4);
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let c = conn.clone();
            tasks.push(tokio::spawn(async move { c.close() }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert!(conn.is_closed());
    }
}
