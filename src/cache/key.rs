//! Cache key generation.

use super::policy::Category;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest normalized prefix that takes part in the key.
const MAX_NORMALIZED_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Conversation flags that change what a correct answer looks like.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheContext {
    pub appointment_intent: bool,
    pub emergency_context: bool,
    pub medical_advice_context: bool,
}

impl CacheContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_appointment_intent(mut self) -> Self {
        self.appointment_intent = true;
        self
    }

    pub fn with_emergency_context(mut self) -> Self {
        self.emergency_context = true;
        self
    }

    pub fn with_medical_advice_context(mut self) -> Self {
        self.medical_advice_context = true;
        self
    }

    /// First 8 hex chars of the SHA-256 of the flags.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hex = sha256_hex(canonical.as_bytes());
        hex.truncate(8);
        hex
    }
}

/// Lowercase, strip punctuation, collapse whitespace and cap the length.
///
/// Letters with diacritics are kept, so "visão" and "Visão!" normalize alike.
pub fn normalize_message(message: &str) -> String {
    let lowered = message.trim().to_lowercase();
    let kept: String = lowered
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    let collapsed = kept.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_NORMALIZED_CHARS).collect()
}

/// Everything derived from a message when computing its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub key: CacheKey,
    pub category: Category,
    pub normalized: String,
}

#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator {
    salt: Option<String>,
}

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace keys, e.g. per deployment, so two caches never share entries.
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn fingerprint(&self, message: &str, context: &CacheContext) -> Fingerprint {
        let normalized = normalize_message(message);
        let category = Category::classify(&normalized, context);
        let mut canonical = format!("{}:{}:{}", category.as_str(), normalized, context.hash());
        if let Some(ref salt) = self.salt {
            canonical.push(':');
            canonical.push_str(salt);
        }
        Fingerprint {
            key: CacheKey::new(sha256_hex(canonical.as_bytes())),
            category,
            normalized,
        }
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Jaccard similarity of the word sets of two normalized messages.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    use std::collections::HashSet;
    let wa: HashSet<&str> = a.split(' ').filter(|w| !w.is_empty()).collect();
    let wb: HashSet<&str> = b.split(' ').filter(|w| !w.is_empty()).collect();
    let union = wa.union(&wb).count();
    if union == 0 {
        return 0.0;
    }
    wa.intersection(&wb).count() as f64 / union as f64
}
