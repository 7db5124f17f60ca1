//! Cache backend implementations.

use super::key::CacheKey;
use super::policy::Category;
use crate::Result;
use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One cached AI response.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub category: Category,
    pub normalized_message: String,
    pub response: String,
    pub metadata: serde_json::Value,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub expires_at: Instant,
    pub access_count: u64,
    #[serde(skip)]
    pub last_accessed_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.created_at)
    }
}

/// Selects entries for [`ResponseCache::invalidate`](super::ResponseCache::invalidate).
///
/// Criteria combine with AND. Without `force` only expired entries match.
#[derive(Debug, Clone, Default)]
pub struct InvalidationFilter {
    pub category: Option<Category>,
    /// Case-insensitive substring of the normalized message.
    pub pattern: Option<String>,
    /// Only entries created longer ago than this.
    pub older_than: Option<Duration>,
    pub force: bool,
}

impl InvalidationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into().to_lowercase());
        self
    }

    pub fn older_than(mut self, age: Duration) -> Self {
        self.older_than = Some(age);
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn matches(&self, entry: &CacheEntry, now: Instant) -> bool {
        if !self.force && !entry.is_expired(now) {
            return false;
        }
        if self.category.is_some_and(|c| c != entry.category) {
            return false;
        }
        if let Some(ref p) = self.pattern {
            if !entry.normalized_message.contains(p.as_str()) {
                return false;
            }
        }
        if let Some(age) = self.older_than {
            if entry.age(now) <= age {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch an unexpired entry and bump its access statistics.
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    async fn put(&self, entry: CacheEntry) -> Result<()>;
    async fn remove(&self, key: &CacheKey) -> Result<bool>;
    /// Unexpired entries of one category.
    async fn entries_in_category(&self, category: Category) -> Result<Vec<CacheEntry>>;
    /// All stored entries, expired ones included.
    async fn entries(&self) -> Result<Vec<CacheEntry>>;
    /// Remove matching entries and return their keys.
    async fn remove_matching(&self, filter: &InvalidationFilter) -> Result<Vec<CacheKey>>;
    async fn purge_expired(&self) -> Result<usize>;
    async fn clear(&self) -> Result<()>;
    async fn len(&self) -> Result<usize>;
    fn name(&self) -> &'static str;
}

/// In-process store ordered by last access.
///
/// Bounded stores evict the least recently accessed entry when full.
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    capacity: Option<usize>,
}

impl MemoryCache {
    pub fn bounded(max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity: Some(cap.get()),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity: None,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let now = Instant::now();
        let mut entries = self.lock();
        match entries.get_mut(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed_at = now;
                return Ok(Some(entry.clone()));
            }
            Some(_) => {}
        }
        entries.pop(key);
        Ok(None)
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let key = entry.key.clone();
        if let Some((evicted, _)) = self.lock().push(key.clone(), entry) {
            if evicted != key {
                debug!(key = %evicted, "evicted least recently accessed cache entry");
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.lock().pop(key).is_some())
    }

    async fn entries_in_category(&self, category: Category) -> Result<Vec<CacheEntry>> {
        let now = Instant::now();
        Ok(self
            .lock()
            .iter()
            .filter(|(_, e)| e.category == category && !e.is_expired(now))
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(self.lock().iter().map(|(_, e)| e.clone()).collect())
    }

    async fn remove_matching(&self, filter: &InvalidationFilter) -> Result<Vec<CacheKey>> {
        let now = Instant::now();
        let mut entries = self.lock();
        let keys: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, e)| filter.matches(e, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        Ok(keys)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let purged = self.remove_matching(&InvalidationFilter::new()).await?.len();
        if purged > 0 {
            debug!(backend = self.name(), purged, "purged expired cache entries");
        }
        Ok(purged)
    }

    async fn clear(&self) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.lock().len())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Stores nothing; use it to run without a durable tier.
pub struct NullCache;

impl NullCache {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for NullCache {
    async fn get(&self, _: &CacheKey) -> Result<Option<CacheEntry>> {
        Ok(None)
    }
    async fn put(&self, _: CacheEntry) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, _: &CacheKey) -> Result<bool> {
        Ok(false)
    }
    async fn entries_in_category(&self, _: Category) -> Result<Vec<CacheEntry>> {
        Ok(Vec::new())
    }
    async fn entries(&self) -> Result<Vec<CacheEntry>> {
        Ok(Vec::new())
    }
    async fn remove_matching(&self, _: &InvalidationFilter) -> Result<Vec<CacheKey>> {
        Ok(Vec::new())
    }
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
    async fn clear(&self) -> Result<()> {
        Ok(())
    }
    async fn len(&self) -> Result<usize> {
        Ok(0)
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
