//! # Response Caching Module
//!
//! Caches AI answers so repeated patient questions skip the generation call.
//!
//! Entries are keyed by a fingerprint of the normalized message, its content
//! category and the conversation flags, so "O que é catarata?" and
//! "o que é CATARATA" share one entry. The category decides how long an
//! answer stays fresh:
//!
//! | Category | TTL |
//! |----------|-----|
//! | emergency | never cached |
//! | appointment | 1 hour |
//! | medical topics | 7 days |
//! | everything else | 24 hours |
//!
//! Answers carrying personal data (CPF, CNPJ, phone, email), answers outside
//! 50..=5000 characters, and appointment answers naming a concrete date or
//! time are refused with a [`RejectReason`].
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseCache`] | Two-tier lookup/store, similarity search, invalidation |
//! | [`CacheBackend`] | Trait for the durable tier |
//! | [`MemoryCache`] | In-process store with least-recently-accessed eviction |
//! | [`NullCache`] | No-op backend for running without a durable tier |
//! | [`CacheKeyGenerator`] | Fingerprint generation |
//!
//! ## Example
//!
//! ```rust
//! use clinic_chat_runtime::cache::{CacheContext, ResponseCache, ResponseCacheConfig};
//!
//! # tokio_test::block_on(async {
//! let cache = ResponseCache::in_memory(ResponseCacheConfig::default());
//! let ctx = CacheContext::new();
//! let answer = "O glaucoma é uma doença do nervo óptico, geralmente ligada à pressão ocular.";
//! let outcome = cache
//!     .store("O que é glaucoma?", answer, &ctx, serde_json::json!({}))
//!     .await
//!     .unwrap();
//! assert!(outcome.is_stored());
//! assert!(cache.lookup("o que é glaucoma", &ctx).await.unwrap().is_some());
//! # });
//! ```

mod backend;
mod key;
mod manager;
mod policy;

pub use backend::{CacheBackend, CacheEntry, InvalidationFilter, MemoryCache, NullCache};
pub use key::{jaccard_similarity, normalize_message, CacheContext, CacheKey, CacheKeyGenerator, Fingerprint};
pub use manager::{
    CacheHealth, CacheHit, CacheSource, CacheStats, ResponseCache, ResponseCacheConfig, SimilarResponse,
    StoreOutcome, SweepReport,
};
pub use policy::{CachePolicy, Category, PersonalDataKind, RejectReason};
