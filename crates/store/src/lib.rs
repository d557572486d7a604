//! Keelson dispatch: keyed work queue feeding the convergence engine.
//!
//! Guarantees at most one active pass per key, coalesces repeated deliveries of
//! a key, and redelivers with per-key exponential backoff after an error.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use keelson_core::{Error, Outcome};
use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// FIFO of pending keys with per-key coalescing and in-flight tracking.
///
/// A key pushed while it is active is remembered as dirty and re-queued when
/// the active pass finishes, so no delivery is lost and no key runs twice at
/// the same time.
pub struct WorkQueue<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    active: FxHashSet<K>,
    dirty: FxHashSet<K>,
}

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self { order: VecDeque::new(), queued: FxHashSet::default(), active: FxHashSet::default(), dirty: FxHashSet::default() }
    }

    /// Pending (not yet started) keys.
    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn active(&self) -> usize { self.active.len() }

    /// Returns false when the key was coalesced into an existing entry.
    pub fn push(&mut self, key: K) -> bool {
        if self.active.contains(&key) {
            return self.dirty.insert(key);
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        true
    }

    /// Take the next pending key and mark it active.
    pub fn pop(&mut self) -> Option<K> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.active.insert(key.clone());
        Some(key)
    }

    /// Finish an active key; it is queued again if it went dirty or `requeue` is set.
    pub fn done(&mut self, key: &K, requeue: bool) {
        self.active.remove(key);
        let dirty = self.dirty.remove(key);
        if dirty || requeue {
            self.push(key.clone());
        }
    }
}

/// Per-key exponential backoff: `base * 2^(failures-1)`, capped at `max`.
pub struct Backoff<K> {
    base: Duration,
    max: Duration,
    failures: FxHashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> Backoff<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, failures: FxHashMap::default() }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn failed(&mut self, key: &K) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        let exp = (*n - 1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    pub fn reset(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent passes across distinct keys
    pub workers: usize,
    /// Capacity of the intake channel; senders wait when it is full
    pub queue_cap: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4, queue_cap: 1024, backoff_base: Duration::from_millis(200), backoff_max: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub passes: u64,
    pub failures: u64,
}

/// Handle to a running dispatch loop.
pub struct Dispatcher<K> {
    tx: mpsc::Sender<K>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<DispatchStats>,
}

impl<K> Dispatcher<K> {
    pub fn sender(&self) -> mpsc::Sender<K> { self.tx.clone() }

    /// Stop taking new work, wait for active passes and return the counters.
    pub async fn shutdown(mut self) -> DispatchStats {
        if let Some(tx) = self.shutdown.take() { let _ = tx.send(()); }
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "dispatch loop aborted");
                DispatchStats::default()
            }
        }
    }
}

/// Spawn the dispatch loop. Keys sent on the returned sender are handed to
/// `handler`, one active pass per key.
pub fn spawn_dispatch<K, F, Fut>(cfg: DispatchConfig, handler: F) -> Dispatcher<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, Error>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<K>(cfg.queue_cap.max(1));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(K, Result<Outcome, Error>)>();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let retry_tx = tx.clone();
    let handler = Arc::new(handler);
    let workers = cfg.workers.max(1);

    let handle = tokio::spawn(async move {
        let mut queue: WorkQueue<K> = WorkQueue::new();
        let mut backoff: Backoff<K> = Backoff::new(cfg.backoff_base, cfg.backoff_max);
        let mut stats = DispatchStats::default();
        let mut stopping = false;
        info!(workers, queue_cap = cfg.queue_cap, "dispatch loop started");
        loop {
            while !stopping && queue.active() < workers {
                let Some(key) = queue.pop() else { break };
                debug!(key = %key, "starting pass");
                let h = Arc::clone(&handler);
                let done = done_tx.clone();
                tokio::spawn(async move {
                    let res = match tokio::spawn((*h)(key.clone())).await {
                        Ok(r) => r,
                        Err(e) => Err(Error::other(format!("pass panicked: {}", e))),
                    };
                    let _ = done.send((key, res));
                });
            }
            gauge!("dispatch_queue_depth", queue.len() as f64);
            if stopping && queue.active() == 0 {
                break;
            }
            tokio::select! {
                _ = &mut shutdown_rx, if !stopping => {
                    info!(pending = queue.len(), active = queue.active(), "dispatch loop stopping");
                    stopping = true;
                }
                maybe = rx.recv(), if !stopping => {
                    if let Some(key) = maybe {
                        if !queue.push(key) {
                            counter!("dispatch_coalesced_total", 1u64);
                        }
                    }
                }
                Some((key, res)) = done_rx.recv() => {
                    stats.passes += 1;
                    counter!("dispatch_passes_total", 1u64);
                    match res {
                        Ok(outcome) => {
                            backoff.reset(&key);
                            queue.done(&key, outcome.requeue);
                        }
                        Err(e) => {
                            stats.failures += 1;
                            counter!("dispatch_failures_total", 1u64, "kind" => e.kind());
                            let delay = backoff.failed(&key);
                            warn!(key = %key, error = %e, kind = e.kind(), retry_ms = delay.as_millis() as u64, "pass failed; retrying");
                            queue.done(&key, false);
                            if !stopping {
                                let tx = retry_tx.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(delay).await;
                                    let _ = tx.send(key).await;
                                });
                            }
                        }
                    }
                }
            }
        }
        info!(passes = stats.passes, failures = stats.failures, "dispatch loop stopped");
        stats
    });

    Dispatcher { tx, shutdown: Some(shutdown_tx), handle }
}
