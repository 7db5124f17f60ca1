//! # Resilience Primitives Module
//!
//! Guards that run before any pool or queue resource is taken, plus the retry
//! policy used around pooled operations.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-dependency CLOSED/OPEN/HALF_OPEN breaker |
//! | [`rate_limiter`] | Sliding-window per-identity request limiter |
//! | [`retry`] | Exponential backoff policy |
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use clinic_chat_runtime::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
//! use std::time::Duration;
//!
//! let breakers = CircuitBreakerRegistry::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_timeout(Duration::from_secs(60)),
//! );
//!
//! if breakers.allow("gemini") {
//!     // Make the AI call...
//!     breakers.on_success("gemini");
//! }
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use clinic_chat_runtime::resilience::rate_limiter::{RateLimitConfig, SlidingWindowLimiter};
//!
//! # tokio_test::block_on(async {
//! let limiter = SlidingWindowLimiter::new(RateLimitConfig::default());
//! let decision = limiter.check_and_consume("ip:3f9a").await;
//! assert!(decision.is_allowed());
//! # });
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
