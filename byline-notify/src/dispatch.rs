//! Batched broadcast delivery.
//!
//! A broadcast job carries the full online target list for one
//! notification. Jobs land on a bounded ingress queue and are flushed by
//! a background task, either when the pending batch reaches the job
//! threshold or when the flush window elapses, whichever comes first.
//! Each flush takes the registry read lock exactly once for the whole
//! batch. A send that fails here is dropped rather than written to the
//! backlog: broadcasts are fan-out traffic and a slow consumer should
//! not turn one publish into a hundred store writes. If the ingress
//! queue itself is full, the enqueueing caller delivers that one job
//! inline instead of blocking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::envelope::Envelope;
use crate::registry::Registry;
use crate::stats::HubStats;
use crate::types::UserId;

pub struct DispatchJob {
    pub targets: Vec<UserId>,
    pub envelope: Envelope,
}

pub struct Dispatcher {
    jobs: mpsc::Sender<DispatchJob>,
    registry: Arc<Registry>,
    stats: Arc<HubStats>,
}

impl Dispatcher {
    /// Create the dispatcher and spawn its flush loop.
    pub fn start(
        capacity: usize,
        window: Duration,
        threshold: usize,
        registry: Arc<Registry>,
        stats: Arc<HubStats>,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (dispatcher, rx) = Self::new(capacity, registry, stats);
        let dispatcher = Arc::new(dispatcher);
        let handle = tokio::spawn(flush_loop(
            rx,
            window,
            threshold,
            dispatcher.registry.clone(),
            dispatcher.stats.clone(),
            shutdown,
        ));
        (dispatcher, handle)
    }

    fn new(
        capacity: usize,
        registry: Arc<Registry>,
        stats: Arc<HubStats>,
    ) -> (Self, mpsc::Receiver<DispatchJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        let dispatcher = Dispatcher {
            jobs: tx,
            registry,
            stats,
        };
        (dispatcher, rx)
    }

    /// Queue one broadcast job for the next flush. When the ingress
    /// queue is full the job is delivered inline on the caller instead.
    pub fn enqueue(&self, targets: Vec<UserId>, envelope: Envelope) {
        match self.jobs.try_send(DispatchJob { targets, envelope }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::debug!(
                    targets = job.targets.len(),
                    "Dispatch queue full, flushing inline"
                );
                self.flush_one(job);
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::debug!(
                    targets = job.targets.len(),
                    "Dispatch queue closed, dropping job"
                );
            }
        }
    }

    fn flush_one(&self, job: DispatchJob) {
        let mut delivered = 0u64;
        {
            let map = self.registry.read_map();
            for user_id in &job.targets {
                let Some(conn) = map.get(user_id) else {
                    continue;
                };
                match conn.send(job.envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        self.stats.record_error();
                        tracing::debug!(user = %user_id, "Inline dispatch dropped: {e}");
                    }
                }
            }
        }
        self.stats.add_sent(delivered);
    }
}

async fn flush_loop(
    mut jobs: mpsc::Receiver<DispatchJob>,
    window: Duration,
    threshold: usize,
    registry: Arc<Registry>,
    stats: Arc<HubStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: Vec<DispatchJob> = Vec::with_capacity(threshold);
    let mut window = tokio::time::interval(window);
    window.tick().await; // skip first tick
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            maybe = jobs.recv() => {
                let Some(job) = maybe else { break };
                pending.push(job);
                // Drain whatever else is already queued, up to one batch.
                while pending.len() < threshold {
                    match jobs.try_recv() {
                        Ok(job) => pending.push(job),
                        Err(_) => break,
                    }
                }
                if pending.len() >= threshold {
                    flush(&registry, &stats, &mut pending);
                    window.reset();
                }
            }
            _ = window.tick() => {
                flush(&registry, &stats, &mut pending);
            }
        }
    }
    if !pending.is_empty() {
        tracing::debug!(dropped = pending.len(), "Dispatcher stopped with jobs pending");
    }
    tracing::debug!("Dispatch flush loop stopped");
}

/// Deliver a batch of jobs under a single registry read acquisition.
/// Targets with no connection, and sends refused by a full or closed
/// outbound queue, are dropped here.
fn flush(registry: &Registry, stats: &HubStats, pending: &mut Vec<DispatchJob>) {
    if pending.is_empty() {
        return;
    }
    let jobs = pending.len();
    let mut delivered = 0u64;
    {
        let map = registry.read_map();
        for job in pending.drain(..) {
            for user_id in &job.targets {
                let Some(conn) = map.get(user_id) else {
                    continue;
                };
                match conn.send(job.envelope.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        stats.record_error();
                        tracing::debug!(user = %user_id, "Batched dispatch dropped: {e}");
                    }
                }
            }
        }
    }
    stats.add_sent(delivered);
    tracing::trace!(jobs, delivered, "Flushed dispatch batch");
}
