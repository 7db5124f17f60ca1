//! Two-tier response cache.

use super::backend::{CacheBackend, CacheEntry, InvalidationFilter, MemoryCache};
use super::key::{jaccard_similarity, CacheContext, CacheKey, CacheKeyGenerator};
use super::policy::{CachePolicy, Category, RejectReason};
use crate::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    /// Capacity of the fast in-process tier.
    pub memory_entries: usize,
    pub similarity_threshold: f64,
    pub policy: CachePolicy,
    pub key_salt: Option<String>,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            memory_entries: 1000,
            similarity_threshold: 0.85,
            policy: CachePolicy::default(),
            key_salt: None,
        }
    }
}

impl ResponseCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory_entries(mut self, n: usize) -> Self {
        self.memory_entries = n;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_key_salt(mut self, salt: impl Into<String>) -> Self {
        self.key_salt = Some(salt.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Memory,
    Durable,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheHit {
    pub response: String,
    pub metadata: serde_json::Value,
    pub category: Category,
    pub source: CacheSource,
    pub age_ms: u64,
    pub access_count: u64,
}

impl CacheHit {
    fn new(entry: CacheEntry, source: CacheSource, now: Instant) -> Self {
        Self {
            age_ms: entry.age(now).as_millis() as u64,
            access_count: entry.access_count,
            category: entry.category,
            metadata: entry.metadata,
            response: entry.response,
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored {
        key: CacheKey,
        category: Category,
        ttl: Duration,
    },
    Rejected(RejectReason),
}

impl StoreOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, StoreOutcome::Stored { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarResponse {
    pub key: CacheKey,
    pub response: String,
    pub category: Category,
    pub similarity: f64,
    pub access_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub memory: usize,
    pub durable: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub durable_hits: u64,
    pub stores: u64,
    pub rejections: u64,
    pub invalidations: u64,
    pub errors: u64,
    pub memory_entries: usize,
    pub memory_capacity: usize,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Share of hits served without touching the durable tier.
    pub fn memory_hit_ratio(&self) -> f64 {
        if self.hits == 0 {
            0.0
        } else {
            self.memory_hits as f64 / self.hits as f64
        }
    }
}

/// Durable-tier census used by health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheHealth {
    pub backend: &'static str,
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub category_distribution: BTreeMap<Category, usize>,
    pub average_access_count: f64,
}

#[derive(Default)]
struct AtomicStats {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    stores: AtomicU64,
    rejections: AtomicU64,
    invalidations: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Response cache with a bounded in-process tier in front of a durable store.
pub struct ResponseCache {
    cfg: ResponseCacheConfig,
    keys: CacheKeyGenerator,
    memory: MemoryCache,
    durable: Box<dyn CacheBackend>,
    stats: AtomicStats,
}

impl ResponseCache {
    pub fn new(cfg: ResponseCacheConfig, durable: Box<dyn CacheBackend>) -> Self {
        let mut keys = CacheKeyGenerator::new();
        if let Some(ref salt) = cfg.key_salt {
            keys = keys.with_salt(salt.clone());
        }
        Self {
            memory: MemoryCache::bounded(cfg.memory_entries),
            keys,
            durable,
            cfg,
            stats: AtomicStats::default(),
        }
    }

    /// Both tiers in process memory.
    pub fn in_memory(cfg: ResponseCacheConfig) -> Self {
        Self::new(cfg, Box::new(MemoryCache::unbounded()))
    }

    pub fn config(&self) -> &ResponseCacheConfig {
        &self.cfg
    }

    pub fn backend_name(&self) -> &'static str {
        self.durable.name()
    }

    pub async fn lookup(&self, message: &str, context: &CacheContext) -> Result<Option<CacheHit>> {
        AtomicStats::bump(&self.stats.requests);
        let fp = self.keys.fingerprint(message, context);
        let now = Instant::now();

        if let Some(entry) = self.memory.get(&fp.key).await? {
            AtomicStats::bump(&self.stats.hits);
            AtomicStats::bump(&self.stats.memory_hits);
            return Ok(Some(CacheHit::new(entry, CacheSource::Memory, now)));
        }

        match self.durable.get(&fp.key).await {
            Ok(Some(entry)) => {
                AtomicStats::bump(&self.stats.hits);
                AtomicStats::bump(&self.stats.durable_hits);
                self.memory.put(entry.clone()).await?;
                Ok(Some(CacheHit::new(entry, CacheSource::Durable, now)))
            }
            Ok(None) => {
                AtomicStats::bump(&self.stats.misses);
                Ok(None)
            }
            Err(e) => {
                AtomicStats::bump(&self.stats.errors);
                AtomicStats::bump(&self.stats.misses);
                Err(e)
            }
        }
    }

    pub async fn store(
        &self,
        message: &str,
        response: &str,
        context: &CacheContext,
        metadata: serde_json::Value,
    ) -> Result<StoreOutcome> {
        let fp = self.keys.fingerprint(message, context);
        let ttl = match self.cfg.policy.admit(response, fp.category) {
            Ok(ttl) => ttl,
            Err(reason) => {
                AtomicStats::bump(&self.stats.rejections);
                debug!(category = %fp.category, %reason, "response not cached");
                return Ok(StoreOutcome::Rejected(reason));
            }
        };

        let now = Instant::now();
        let entry = CacheEntry {
            key: fp.key.clone(),
            category: fp.category,
            normalized_message: fp.normalized,
            response: response.to_string(),
            metadata,
            created_at: now,
            expires_at: now + ttl,
            access_count: 0,
            last_accessed_at: now,
        };
        if let Err(e) = self.durable.put(entry.clone()).await {
            AtomicStats::bump(&self.stats.errors);
            return Err(e);
        }
        self.memory.put(entry).await?;
        AtomicStats::bump(&self.stats.stores);
        debug!(key = %fp.key, category = %fp.category, ttl_secs = ttl.as_secs(), "response cached");
        Ok(StoreOutcome::Stored {
            key: fp.key,
            category: fp.category,
            ttl,
        })
    }

    /// Cached answers to questions worded like `message`, best match first.
    pub async fn find_similar(&self, message: &str, limit: usize) -> Result<Vec<SimilarResponse>> {
        let fp = self.keys.fingerprint(message, &CacheContext::default());
        let mut candidates = self.durable.entries_in_category(fp.category).await?;
        let seen: HashSet<CacheKey> = candidates.iter().map(|e| e.key.clone()).collect();
        candidates.extend(
            self.memory
                .entries_in_category(fp.category)
                .await?
                .into_iter()
                .filter(|e| !seen.contains(&e.key)),
        );
        candidates.sort_by(|a, b| b.access_count.cmp(&a.access_count));
        candidates.truncate(limit.saturating_mul(2));

        let threshold = self.cfg.similarity_threshold;
        let mut similar: Vec<SimilarResponse> = candidates
            .into_iter()
            .filter_map(|e| {
                let similarity = jaccard_similarity(&fp.normalized, &e.normalized_message);
                (similarity >= threshold).then(|| SimilarResponse {
                    key: e.key,
                    response: e.response,
                    category: e.category,
                    similarity,
                    access_count: e.access_count,
                })
            })
            .collect();
        similar.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        similar.truncate(limit);
        Ok(similar)
    }

    /// Remove entries matching `filter` from both tiers.
    pub async fn invalidate(&self, filter: &InvalidationFilter) -> Result<usize> {
        let mut removed: HashSet<CacheKey> = HashSet::new();
        for key in self.durable.remove_matching(filter).await? {
            self.memory.remove(&key).await?;
            removed.insert(key);
        }
        removed.extend(self.memory.remove_matching(filter).await?);
        let count = removed.len();
        self.stats
            .invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            info!(count, category = ?filter.category, forced = filter.force, "cache entries invalidated");
        }
        Ok(count)
    }

    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let memory = self.memory.purge_expired().await?;
        let durable = match self.durable.purge_expired().await {
            Ok(n) => n,
            Err(e) => {
                AtomicStats::bump(&self.stats.errors);
                warn!(error = %e, backend = self.durable.name(), "durable cache sweep failed");
                return Err(e);
            }
        };
        Ok(SweepReport { memory, durable })
    }

    pub async fn clear(&self) -> Result<()> {
        self.memory.clear().await?;
        self.durable.clear().await
    }

    pub async fn stats(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            requests: load(&self.stats.requests),
            hits: load(&self.stats.hits),
            misses: load(&self.stats.misses),
            memory_hits: load(&self.stats.memory_hits),
            durable_hits: load(&self.stats.durable_hits),
            stores: load(&self.stats.stores),
            rejections: load(&self.stats.rejections),
            invalidations: load(&self.stats.invalidations),
            errors: load(&self.stats.errors),
            memory_entries: self.memory.len().await.unwrap_or(0),
            memory_capacity: self.memory.capacity().unwrap_or(0),
        }
    }

    pub async fn health(&self) -> Result<CacheHealth> {
        let now = Instant::now();
        let entries = self.durable.entries().await?;
        let valid: Vec<&CacheEntry> = entries.iter().filter(|e| !e.is_expired(now)).collect();
        let mut category_distribution = BTreeMap::new();
        for e in &valid {
            *category_distribution.entry(e.category).or_insert(0) += 1;
        }
        let average_access_count = if valid.is_empty() {
            0.0
        } else {
            valid.iter().map(|e| e.access_count).sum::<u64>() as f64 / valid.len() as f64
        };
        Ok(CacheHealth {
            backend: self.durable.name(),
            total_entries: entries.len(),
            valid_entries: valid.len(),
            expired_entries: entries.len() - valid.len(),
            category_distribution,
            average_access_count,
        })
    }
}
