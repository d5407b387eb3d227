//! The reconciliation loop.
//!
//! One task owns the [`HopCache`]. It multiplexes new-hop notifications from
//! the ring buffer reader, the periodic counter re-read and snapshot requests,
//! handling one event to completion before taking the next.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::{
    sync::{mpsc, oneshot},
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use esdx_monitor_common::Counter;

use crate::{cache::HopCache, counters::CounterSource, hop::Hop};

const REQUEST_QUEUE_DEPTH: usize = 8;

enum Request {
    Snapshot(oneshot::Sender<Vec<(Hop, Counter)>>),
}

/// Read-only access to the cache owned by a running [`Reconciler`].
#[derive(Clone)]
pub struct MonitorHandle {
    requests: mpsc::Sender<Request>,
}

impl MonitorHandle {
    /// Tracked hops with their last reported counters, sorted by hop.
    pub async fn snapshot(&self) -> Result<Vec<(Hop, Counter)>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(Request::Snapshot(reply_tx))
            .await
            .map_err(|_| anyhow!("reconciliation loop has stopped"))?;
        reply_rx
            .await
            .context("reconciliation loop dropped snapshot request")
    }
}

pub struct Reconciler<S> {
    cache: HopCache,
    source: S,
    period: Duration,
    requests: mpsc::Receiver<Request>,
}

impl<S: CounterSource> Reconciler<S> {
    pub fn new(source: S, period: Duration) -> (Self, MonitorHandle) {
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let reconciler = Self {
            cache: HopCache::new(),
            source,
            period,
            requests,
        };
        (reconciler, MonitorHandle { requests: requests_tx })
    }

    /// Runs until `shutdown` fires. The cache is dropped with the loop.
    ///
    /// The first re-read happens one period after start. A due tick is taken
    /// before queued notifications, so a notification backlog cannot postpone
    /// it; at most one tick is due at a time, so ticks cannot starve the queue.
    /// If the notification queue closes the loop keeps ticking without it.
    pub async fn run(self, mut new_hops: mpsc::UnboundedReceiver<Hop>, shutdown: CancellationToken) {
        let Self {
            mut cache,
            source,
            period,
            mut requests,
        } = self;

        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut hops_open = true;
        let mut requests_open = true;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for change in cache.reconcile(&source) {
                        tracing::info!("{change}");
                    }
                }
                hop = new_hops.recv(), if hops_open => match hop {
                    Some(hop) => {
                        let change = cache.discover(hop);
                        tracing::info!("{change}");
                    }
                    None => {
                        tracing::warn!("hop notification queue closed");
                        hops_open = false;
                    }
                },
                request = requests.recv(), if requests_open => match request {
                    Some(Request::Snapshot(reply)) => {
                        let _ = reply.send(cache.snapshot());
                    }
                    None => requests_open = false,
                },
            }
        }

        tracing::debug!(hops = cache.len(), "reconciliation loop stopped");
    }
}
