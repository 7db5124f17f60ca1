//! Pooled connection handles.

use crate::Result;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::manager::Shared;

/// How to open and close one handle to the external dependency.
///
/// Supplied at pool construction so the pool stays agnostic to the concrete
/// client type.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn open(&self) -> Result<Self::Connection>;

    /// Release any resources held by the handle. Called once per connection.
    fn close(&self, _conn: Self::Connection) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// Bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: ConnectionId,
    pub created_at: Instant,
    pub last_used: Instant,
    pub request_count: u64,
}

impl ConnectionMeta {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            id: ConnectionId::new(),
            created_at: now,
            last_used: now,
            request_count: 0,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_used)
    }

    /// `age <= max_lifetime && idle <= idle_timeout`
    pub fn is_valid(&self, now: Instant, max_lifetime: Duration, idle_timeout: Duration) -> bool {
        self.age(now) <= max_lifetime && self.idle_for(now) <= idle_timeout
    }
}

pub(crate) struct Slot<C> {
    pub(crate) meta: ConnectionMeta,
    pub(crate) conn: C,
}

/// A connection checked out of the pool.
///
/// Dropping the guard returns the connection to the pool (or destroys it when
/// it is no longer valid), so release happens on every exit path.
pub struct PooledConnection<F: ConnectionFactory> {
    shared: Arc<Shared<F>>,
    slot: Option<Slot<F::Connection>>,
    discard: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(shared: Arc<Shared<F>>, slot: Slot<F::Connection>) -> Self {
        Self {
            shared,
            slot: Some(slot),
            discard: false,
        }
    }

    fn slot(&self) -> &Slot<F::Connection> {
        self.slot.as_ref().expect("slot is present until drop")
    }

    pub fn id(&self) -> ConnectionId {
        self.slot().meta.id
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.slot().meta
    }

    /// Return the connection to the pool now.
    pub fn release(self) {}

    /// Destroy the connection instead of returning it (e.g. the handle is broken).
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        &self.slot().conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.slot.as_mut().expect("slot is present until drop").conn
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.shared.check_in(slot, self.discard);
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("meta", &self.slot.as_ref().map(|s| &s.meta))
            .finish()
    }
}
