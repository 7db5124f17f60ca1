//! Concurrency limiter with a two-level FIFO for the overflow.

use crate::{Error, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    /// Upper bound on time spent waiting for a slot. `None` waits indefinitely.
    pub queue_timeout: Option<Duration>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            queue_timeout: None,
        }
    }
}

impl AdmissionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub executing: usize,
    pub max_concurrent: usize,
    pub queued_high: usize,
    pub queued_normal: usize,
    pub total_queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub avg_wait_ms: f64,
    pub avg_processing_ms: f64,
}

impl AdmissionSnapshot {
    pub fn queue_len(&self) -> usize {
        self.queued_high + self.queued_normal
    }
}

struct Waiter {
    id: Uuid,
    tx: oneshot::Sender<AdmissionSlot>,
}

#[derive(Default)]
struct Stats {
    total_queued: u64,
    completed: u64,
    failed: u64,
    avg_wait_ms: f64,
    avg_processing_ms: f64,
}

struct QueueState {
    executing: usize,
    high: VecDeque<Waiter>,
    normal: VecDeque<Waiter>,
    stats: Stats,
}

impl QueueState {
    fn lane(&mut self, priority: Priority) -> &mut VecDeque<Waiter> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
        }
    }

    fn pop_next(&mut self) -> Option<Waiter> {
        self.high.pop_front().or_else(|| self.normal.pop_front())
    }
}

struct Shared {
    cfg: AdmissionConfig,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One execution slot. Dropping it hands the slot to the next waiter.
struct AdmissionSlot {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = self.shared.lock();
        while let Some(waiter) = st.pop_next() {
            let next = AdmissionSlot {
                shared: self.shared.clone(),
                armed: true,
            };
            match waiter.tx.send(next) {
                Ok(()) => {
                    debug!(request = %waiter.id, "admission slot handed over");
                    return;
                }
                // Receiver gone: the waiter was cancelled.
                Err(mut unclaimed) => unclaimed.armed = false,
            }
        }
        st.executing -= 1;
    }
}

/// Removes a cancelled waiter from its lane.
struct QueuedTicket<'a> {
    shared: &'a Shared,
    id: Uuid,
    priority: Priority,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        let id = self.id;
        self.shared.lock().lane(self.priority).retain(|w| w.id != id);
    }
}

/// Bounds the number of tasks running at once and queues the rest.
///
/// High-priority waiters are always served before normal ones; each lane is
/// FIFO. Cloning is cheap; clones share the same slots.
#[derive(Clone)]
pub struct AdmissionQueue {
    shared: Arc<Shared>,
}

impl AdmissionQueue {
    pub fn new(cfg: AdmissionConfig) -> Result<Self> {
        if cfg.max_concurrent == 0 {
            return Err(Error::configuration("max_concurrent must be at least 1"));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                state: Mutex::new(QueueState {
                    executing: 0,
                    high: VecDeque::new(),
                    normal: VecDeque::new(),
                    stats: Stats::default(),
                }),
            }),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.cfg.max_concurrent
    }

    /// Run `task` once a slot is free and return its result.
    ///
    /// The slot is released when the task completes, fails, panics or is
    /// dropped by the caller.
    pub async fn submit<T, Fut>(&self, priority: Priority, task: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let enqueued_at = Instant::now();
        let slot = self.admit(priority).await?;
        let waited = enqueued_at.elapsed();

        let started = Instant::now();
        let result = task.await;
        let elapsed = started.elapsed();
        {
            let mut st = self.shared.lock();
            let stats = &mut st.stats;
            if result.is_ok() {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
            let n = (stats.completed + stats.failed) as f64;
            stats.avg_wait_ms += (waited.as_secs_f64() * 1000.0 - stats.avg_wait_ms) / n;
            stats.avg_processing_ms += (elapsed.as_secs_f64() * 1000.0 - stats.avg_processing_ms) / n;
        }
        drop(slot);
        result
    }

    async fn admit(&self, priority: Priority) -> Result<AdmissionSlot> {
        let (id, rx) = {
            let mut st = self.shared.lock();
            if st.executing < self.shared.cfg.max_concurrent {
                st.executing += 1;
                return Ok(AdmissionSlot {
                    shared: self.shared.clone(),
                    armed: true,
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = Uuid::new_v4();
            st.lane(priority).push_back(Waiter { id, tx });
            st.stats.total_queued += 1;
            debug!(request = %id, ?priority, queued = st.high.len() + st.normal.len(), "request queued");
            (id, rx)
        };
        let _ticket = QueuedTicket {
            shared: &self.shared,
            id,
            priority,
        };

        let granted = match self.shared.cfg.queue_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(granted) => granted,
                Err(_) => {
                    debug!(request = %id, "queued request timed out");
                    return Err(Error::QueueTimeout { waited: limit });
                }
            },
            None => rx.await,
        };
        granted.map_err(|_| Error::runtime("admission slot sender dropped"))
    }

    pub fn queue_len(&self) -> usize {
        let st = self.shared.lock();
        st.high.len() + st.normal.len()
    }

    pub fn executing(&self) -> usize {
        self.shared.lock().executing
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let st = self.shared.lock();
        AdmissionSnapshot {
            executing: st.executing,
            max_concurrent: self.shared.cfg.max_concurrent,
            queued_high: st.high.len(),
            queued_normal: st.normal.len(),
            total_queued: st.stats.total_queued,
            completed: st.stats.completed,
            failed: st.stats.failed,
            avg_wait_ms: st.stats.avg_wait_ms,
            avg_processing_ms: st.stats.avg_processing_ms,
        }
    }
}
