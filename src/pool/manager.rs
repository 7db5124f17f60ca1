//! Bounded connection pool.

use super::connection::{ConnectionFactory, ConnectionId, ConnectionMeta, PooledConnection, Slot};
use crate::resilience::retry::RetryPolicy;
use crate::{Error, Result};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_size(mut self, min: usize) -> Self {
        self.min_size = min;
        self
    }

    pub fn with_max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::configuration("pool max_size must be at least 1"));
        }
        if self.min_size > self.max_size {
            return Err(Error::configuration(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Options for [`ConnectionPool::with_connection`].
#[derive(Debug, Clone)]
pub struct WithConnectionOptions {
    pub acquire_timeout: Duration,
    pub retry: RetryPolicy,
}

impl WithConnectionOptions {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            acquire_timeout,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    pub opening: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub destroyed: u64,
    pub closed: bool,
}

impl PoolSnapshot {
    /// Fraction of open connections currently checked out.
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.active as f64 / self.total as f64
        }
    }
}

struct PoolState<C> {
    idle: VecDeque<Slot<C>>,
    active: HashMap<ConnectionId, ConnectionMeta>,
    /// Opens in flight; they count against `max_size`.
    opening: usize,
    closed: bool,
    created: u64,
    destroyed: u64,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len()
    }

    fn reserved(&self) -> usize {
        self.total() + self.opening
    }
}

pub(crate) struct Shared<F: ConnectionFactory> {
    cfg: PoolConfig,
    factory: F,
    state: Mutex<PoolState<F::Connection>>,
    released: Notify,
}

impl<F: ConnectionFactory> Shared<F> {
    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_valid(&self, meta: &ConnectionMeta, now: Instant) -> bool {
        meta.is_valid(now, self.cfg.max_lifetime, self.cfg.idle_timeout)
    }

    fn destroy_all(&self, slots: Vec<Slot<F::Connection>>, reason: &str) {
        for slot in slots {
            info!(connection = %slot.meta.id, reason, "connection destroyed");
            self.factory.close(slot.conn);
        }
    }

    /// Return a connection from a dropped guard.
    pub(crate) fn check_in(&self, mut slot: Slot<F::Connection>, discard: bool) {
        let now = Instant::now();
        slot.meta.last_used = now;
        let to_close = {
            let mut st = self.lock();
            st.active.remove(&slot.meta.id);
            if st.closed || discard || !self.is_valid(&slot.meta, now) {
                st.destroyed += 1;
                Some(slot)
            } else {
                st.idle.push_back(slot);
                None
            }
        };
        if let Some(slot) = to_close {
            self.destroy_all(vec![slot], "released while invalid");
        }
        self.released.notify_one();
    }

    /// Open one connection against a reservation already counted in `opening`.
    ///
    /// A checkout placement hands the slot back to the caller; an idle
    /// placement parks it in the idle set and returns `None`.
    async fn open_reserved(self: &Arc<Self>, placement: Placement) -> Result<Option<Slot<F::Connection>>> {
        let mut reservation = OpenReservation {
            shared: self,
            armed: true,
        };
        let conn = match self.factory.open().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to open connection");
                return Err(e);
            }
        };

        let mut meta = ConnectionMeta::new(Instant::now());
        let mut st = self.lock();
        st.opening -= 1;
        reservation.armed = false;
        if st.closed {
            drop(st);
            self.factory.close(conn);
            return Err(Error::PoolClosed);
        }
        st.created += 1;
        info!(connection = %meta.id, total = st.total() + 1, "connection created");
        match placement {
            Placement::Checkout => {
                meta.request_count = 1;
                st.active.insert(meta.id, meta.clone());
                Ok(Some(Slot { meta, conn }))
            }
            Placement::Idle => {
                st.idle.push_back(Slot { meta, conn });
                drop(st);
                self.released.notify_one();
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Placement {
    Checkout,
    Idle,
}

/// Releases an `opening` reservation if the open fails or is cancelled.
struct OpenReservation<'a, F: ConnectionFactory> {
    shared: &'a Shared<F>,
    armed: bool,
}

impl<F: ConnectionFactory> Drop for OpenReservation<'_, F> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().opening -= 1;
            self.shared.released.notify_one();
        }
    }
}

enum Step<C> {
    Ready(Slot<C>),
    Open,
    Wait,
}

/// A bounded pool of connections produced by a [`ConnectionFactory`].
///
/// Cloning is cheap; clones share the same pool.
pub struct ConnectionPool<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(factory: F, cfg: PoolConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                cfg,
                factory,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    active: HashMap::new(),
                    opening: 0,
                    closed: false,
                    created: 0,
                    destroyed: 0,
                }),
                released: Notify::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.cfg
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Default `with_connection` options (pool acquire timeout, default retry).
    pub fn default_options(&self) -> WithConnectionOptions {
        WithConnectionOptions::new(self.shared.cfg.acquire_timeout)
    }

    /// Check out a connection, waiting up to `timeout` for one to free up.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<F>> {
        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(res) => res,
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "connection acquire timed out");
                Err(Error::AcquireTimeout { waited: timeout })
            }
        }
    }

    async fn acquire_inner(&self) -> Result<PooledConnection<F>> {
        let shared = &self.shared;
        loop {
            let notified = shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, evicted) = {
                let mut st = shared.lock();
                if st.closed {
                    return Err(Error::PoolClosed);
                }
                let now = Instant::now();
                let mut evicted = Vec::new();
                let mut found = None;
                while let Some(slot) = st.idle.pop_front() {
                    if shared.is_valid(&slot.meta, now) {
                        found = Some(slot);
                        break;
                    }
                    evicted.push(slot);
                }
                st.destroyed += evicted.len() as u64;

                let step = match found {
                    Some(mut slot) => {
                        slot.meta.last_used = now;
                        slot.meta.request_count += 1;
                        st.active.insert(slot.meta.id, slot.meta.clone());
                        Step::Ready(slot)
                    }
                    None if st.reserved() < shared.cfg.max_size => {
                        st.opening += 1;
                        Step::Open
                    }
                    None => Step::Wait,
                };
                (step, evicted)
            };
            shared.destroy_all(evicted, "expired");

            match step {
                Step::Ready(slot) => return Ok(PooledConnection::new(shared.clone(), slot)),
                Step::Open => {
                    if let Some(slot) = shared.open_reserved(Placement::Checkout).await? {
                        return Ok(PooledConnection::new(shared.clone(), slot));
                    }
                }
                Step::Wait => notified.await,
            }
        }
    }

    /// Run `op` on a pooled connection, retrying the whole acquire+operate
    /// cycle on retryable errors with exponential backoff.
    ///
    /// `options.retry.retries` counts retries, so `op` runs at most
    /// `retries + 1` times. The connection is released on every exit path,
    /// including panics in `op`. After the last attempt the final error is
    /// returned unchanged.
    pub async fn with_connection<T, Op>(&self, options: &WithConnectionOptions, mut op: Op) -> Result<T>
    where
        T: Send,
        Op: for<'c> FnMut(&'c mut F::Connection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut attempt = 0u32;
        loop {
            let result = match self.acquire(options.acquire_timeout).await {
                Ok(mut conn) => op(&mut *conn).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < options.retry.retries => {
                    attempt += 1;
                    let delay = options.retry.backoff(attempt);
                    warn!(
                        attempt,
                        max_retries = options.retry.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "pooled operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Destroy idle connections past `max_lifetime` or `idle_timeout`.
    pub fn evict_invalid(&self) -> usize {
        let shared = &self.shared;
        let now = Instant::now();
        let evicted = {
            let mut st = shared.lock();
            let (keep, evicted): (VecDeque<_>, VecDeque<_>) = st
                .idle
                .drain(..)
                .partition(|slot| shared.is_valid(&slot.meta, now));
            st.idle = keep;
            st.destroyed += evicted.len() as u64;
            evicted
        };
        let count = evicted.len();
        shared.destroy_all(evicted.into(), "expired");
        if count > 0 {
            debug!(count, "evicted invalid idle connections");
        }
        count
    }

    /// Open connections until the pool holds at least `min_size`.
    pub async fn warm_up(&self) -> Result<usize> {
        let missing = {
            let st = self.shared.lock();
            self.shared.cfg.min_size.saturating_sub(st.reserved())
        };
        let mut opened = 0;
        for _ in 0..missing {
            if self.open_idle().await? {
                opened += 1;
            }
        }
        Ok(opened)
    }

    /// Open up to `n` idle connections without exceeding `max_size`.
    ///
    /// Stops at the first factory failure and reports how many were opened.
    pub async fn grow(&self, n: usize) -> usize {
        let mut opened = 0;
        for _ in 0..n {
            match self.open_idle().await {
                Ok(true) => opened += 1,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, opened, "pool growth stopped");
                    break;
                }
            }
        }
        opened
    }

    async fn open_idle(&self) -> Result<bool> {
        {
            let mut st = self.shared.lock();
            if st.closed {
                return Err(Error::PoolClosed);
            }
            if st.reserved() >= self.shared.cfg.max_size {
                return Ok(false);
            }
            st.opening += 1;
        }
        self.shared.open_reserved(Placement::Idle).await?;
        Ok(true)
    }

    /// Destroy up to `n` idle connections without dropping below `min_size`.
    pub fn shrink_idle(&self, n: usize) -> usize {
        let shared = &self.shared;
        let removed: Vec<_> = {
            let mut st = shared.lock();
            let above_min = st.total().saturating_sub(shared.cfg.min_size);
            let count = n.min(above_min).min(st.idle.len());
            let removed: Vec<_> = st.idle.drain(..count).collect();
            st.destroyed += removed.len() as u64;
            removed
        };
        let count = removed.len();
        shared.destroy_all(removed, "scaled down");
        count
    }

    /// Stop handing out connections and destroy the idle ones.
    ///
    /// Checked-out connections are destroyed as they are released.
    pub fn close(&self) {
        let shared = &self.shared;
        let idle: Vec<_> = {
            let mut st = shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            let idle: Vec<_> = st.idle.drain(..).collect();
            st.destroyed += idle.len() as u64;
            idle
        };
        shared.destroy_all(idle, "pool closed");
        shared.released.notify_waiters();
        info!("connection pool closed");
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let st = self.shared.lock();
        PoolSnapshot {
            active: st.active.len(),
            idle: st.idle.len(),
            total: st.total(),
            opening: st.opening,
            min_size: self.shared.cfg.min_size,
            max_size: self.shared.cfg.max_size,
            created: st.created,
            destroyed: st.destroyed,
            closed: st.closed,
        }
    }
}
