//! # clinic-chat-runtime
//!
//! Resource control runtime for a clinic chat assistant: everything that sits
//! between an inbound patient message and the AI/database dependencies behind it.
//!
//! ## Overview
//!
//! Each inbound message passes through a fixed set of guards before any
//! expensive work happens, and the answers are cached so repeated questions
//! never reach the model twice. The components are usable on their own; the
//! [`gateway`] module composes them into one request path.
//!
//! ## Key Features
//!
//! - **Connection Pool**: bounded, lifetime-aware pool over any [`pool::ConnectionFactory`]
//! - **Admission Queue**: concurrency cap with a two-level priority backlog
//! - **Auto-Scaling**: periodic pool resizing from combined pool/queue load
//! - **Resilience**: per-dependency circuit breakers, sliding-window rate limits, retry backoff
//! - **Token Budgets**: per-session token ceilings
//! - **Response Cache**: two-tier cache with category TTLs and cacheability rules
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use clinic_chat_runtime::gateway::{ChatGateway, ChatRequest, Generated};
//! use clinic_chat_runtime::pool::ConnectionFactory;
//! use futures::FutureExt;
//! use std::time::Duration;
//!
//! struct ModelClient;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory for ModelClient {
//!     type Connection = ();
//!     async fn open(&self) -> clinic_chat_runtime::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> clinic_chat_runtime::Result<()> {
//!     let gateway = ChatGateway::builder(ModelClient).build()?;
//!     let maintenance = gateway.start().await?;
//!
//!     let request = ChatRequest::new("203.0.113.7", "session-1", "Quais são os sintomas de glaucoma?");
//!     let response = gateway
//!         .respond(request, |_conn| {
//!             async { Ok(Generated::new("O glaucoma costuma ser silencioso...", 120)) }.boxed()
//!         })
//!         .await?;
//!     println!("{}", response.text);
//!
//!     gateway.shutdown(maintenance, Duration::from_secs(30)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`pool`] | Connection pool and auto-scaler |
//! | [`admission`] | Bounded-concurrency priority queue |
//! | [`resilience`] | Circuit breakers, rate limiting and retry policy |
//! | [`tokens`] | Token estimation and per-session budgets |
//! | [`cache`] | Two-tier response cache |
//! | [`config`] | Runtime configuration and environment overlay |
//! | [`maintenance`] | Periodic background tasks |
//! | [`gateway`] | Composed request path, status and recommendations |

pub mod admission;
pub mod cache;
pub mod config;
pub mod gateway;
pub mod maintenance;
pub mod pool;
pub mod resilience;
pub mod tokens;

// Re-export main types for convenience
pub use admission::{AdmissionQueue, Priority};
pub use cache::{CacheContext, ResponseCache};
pub use config::RuntimeConfig;
pub use gateway::{ChatGateway, ChatGatewayBuilder, ChatRequest, ChatResponse, Generated};
pub use pool::{ConnectionFactory, ConnectionPool};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, RateWindowKind};
