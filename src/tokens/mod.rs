//! # Token Estimation and Session Budgets
//!
//! Generation calls are charged against a per-session token ceiling. Callers
//! check the budget before a call (with an estimate when the real cost is not
//! known yet) and report actual usage afterwards.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TokenCounter`] | Trait for token estimation |
//! | [`CharacterEstimator`] | Character-based approximation (4 chars ≈ 1 token) |
//! | [`TokenBudgetTracker`] | Cumulative per-session ledger with a ceiling |
//!
//! ```rust
//! use clinic_chat_runtime::tokens::{CharacterEstimator, TokenCounter};
//!
//! let counter = CharacterEstimator::new();
//! assert_eq!(counter.count("O que é catarata?"), 5);
//! ```

mod budget;
mod counter;

pub use budget::{BudgetDecision, SessionUsage, TokenBudgetConfig, TokenBudgetTracker};
pub use counter::{CharacterEstimator, TokenCounter};
