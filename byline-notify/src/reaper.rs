//! Periodic eviction of dead weight from the registry: connections
//! that closed without unregistering, and connections with no frame
//! activity for longer than the idle limit. Eviction goes through the
//! registry's serialized command path like any other unregister.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::registry::Registry;

pub fn start(
    sweep_interval: Duration,
    max_idle: Duration,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // skip first tick
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    let evicted = sweep(&registry, max_idle);
                    if evicted > 0 {
                        tracing::debug!(evicted, "Inactivity sweep complete");
                    }
                }
            }
        }
        tracing::debug!("Inactivity reaper stopped");
    })
}

fn sweep(registry: &Registry, max_idle: Duration) -> usize {
    let mut evicted = 0;
    for conn in registry.snapshot() {
        let reason = if conn.is_closed() {
            "closed"
        } else if conn.idle_for() >= max_idle {
            "idle"
        } else {
            continue;
        };
        tracing::info!(
            user = %conn.user_id(),
            conn = conn.conn_id(),
            reason,
            "Reaping connection"
        );
        registry.unregister(conn.user_id(), conn.conn_id());
        evicted += 1;
    }
    evicted
}
