//! # Admission Control
//!
//! Caps how much work runs against the dependencies at once. Requests beyond
//! `max_concurrent` wait in a two-level queue: high priority drains first,
//! each level in arrival order.
//!
//! ```rust
//! use clinic_chat_runtime::admission::{AdmissionConfig, AdmissionQueue, Priority};
//!
//! # tokio_test::block_on(async {
//! let queue = AdmissionQueue::new(AdmissionConfig::new().with_max_concurrent(4)).unwrap();
//! let answer = queue.submit(Priority::High, async { Ok(42) }).await.unwrap();
//! assert_eq!(answer, 42);
//! # });
//! ```

mod queue;

pub use queue::{AdmissionConfig, AdmissionQueue, AdmissionSnapshot, Priority};
