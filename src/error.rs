use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Component that raised the error (e.g., "connection_pool", "circuit_breaker")
    pub source: Option<String>,
    /// Additional context about the error (e.g., dependency name, config key)
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            source: None,
            details: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Which sliding window rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindowKind {
    Minute,
    Hour,
}

impl std::fmt::Display for RateWindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateWindowKind::Minute => write!(f, "per-minute"),
            RateWindowKind::Hour => write!(f, "per-hour"),
        }
    }
}

/// Unified error type for the runtime.
///
/// Overload conditions (`AcquireTimeout`, `QueueTimeout`) are kept apart from
/// `Dependency` so callers can tell "we are busy" from "the backend failed".
#[derive(Debug, Error)]
pub enum Error {
    #[error("no connection became available within {}ms", .waited.as_millis())]
    AcquireTimeout { waited: Duration },

    #[error("admission queue wait exceeded {}ms", .waited.as_millis())]
    QueueTimeout { waited: Duration },

    #[error("dependency '{dependency}' is unavailable (circuit open)")]
    DependencyOpen { dependency: String },

    #[error("rate limit exceeded ({window}); retry after {}s", .retry_after.as_secs())]
    RateLimited {
        window: RateWindowKind,
        retry_after: Duration,
    },

    #[error("token budget exceeded: used {used} of {limit}, requested {requested}")]
    BudgetExceeded { used: u64, limit: u64, requested: u64 },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("Dependency error: {message}{}", format_context(.context))]
    Dependency {
        message: String,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Failure reported by an external dependency (database call, AI call, factory).
    pub fn dependency(msg: impl Into<String>) -> Self {
        Error::Dependency {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn dependency_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Dependency {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Error::Runtime {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Whether `with_connection` may retry the acquire+operate cycle after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Dependency { .. } | Error::AcquireTimeout { .. })
    }

    /// Rejections that are decided before any pool or queue resource is taken.
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Error::RateLimited { .. } | Error::BudgetExceeded { .. } | Error::DependencyOpen { .. }
        )
    }

    /// Suggested client back-off, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Dependency { context, .. }
            | Error::Configuration { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}
