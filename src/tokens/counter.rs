//! Token estimators.

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u64;
}

/// Fast character-based approximation.
///
/// Portuguese and English both land near 4 characters per token for the
/// generation backend, which is what the session budgets are calibrated on.
#[derive(Debug, Clone)]
pub struct CharacterEstimator {
    chars_per_token: f64,
}

impl CharacterEstimator {
    pub fn new() -> Self {
        Self::with_ratio(4.0)
    }

    pub fn with_ratio(r: f64) -> Self {
        Self {
            chars_per_token: if r.is_finite() && r > 0.0 { r } else { 4.0 },
        }
    }
}

impl Default for CharacterEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for CharacterEstimator {
    fn count(&self, text: &str) -> u64 {
        (text.chars().count() as f64 / self.chars_per_token).ceil() as u64
    }
}
