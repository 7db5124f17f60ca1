//! # Connection Pool
//!
//! A bounded set of reusable handles to the database-like dependency, plus
//! the auto-scaler that resizes it between `min_size` and `max_size`.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ConnectionFactory`] | Opens and closes the concrete client handle |
//! | [`ConnectionPool`] | Acquire/release with validity checks and eviction |
//! | [`PooledConnection`] | RAII guard; dropping it releases the connection |
//! | [`AutoScaler`] | Grows or shrinks the pool from a load sample |
//!
//! ```rust
//! use clinic_chat_runtime::pool::{ConnectionFactory, ConnectionPool, PoolConfig};
//! use std::time::Duration;
//!
//! struct Db;
//!
//! #[async_trait::async_trait]
//! impl ConnectionFactory for Db {
//!     type Connection = String;
//!     async fn open(&self) -> clinic_chat_runtime::Result<String> {
//!         Ok("db-handle".to_string())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pool = ConnectionPool::new(Db, PoolConfig::default()).unwrap();
//! let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
//! assert_eq!(conn.as_str(), "db-handle");
//! drop(conn);
//! assert_eq!(pool.snapshot().idle, 1);
//! # });
//! ```

mod connection;
mod manager;
mod scaler;

pub use connection::{ConnectionFactory, ConnectionId, ConnectionMeta, PooledConnection};
pub use manager::{ConnectionPool, PoolConfig, PoolSnapshot, WithConnectionOptions};
pub use scaler::{AutoScaler, AutoScalerConfig, LoadSample, ScaleDecision};
