// ── CharHub Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Provider, Policy…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Every variant classifies into a closed `ErrorKind`; the HTTP adapter maps
//     kinds to status codes and the WS adapter maps them to `error` events.
//   • Domain denials (insufficient credits, rate limit, capacity) are values,
//     never panics.
//   • No variant carries secret material (API keys, bearer tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Bad input: schema mismatch, malformed payload, out-of-range field.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing, expired, or malformed bearer token.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Authenticated but not allowed (role, membership, ownership).
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Referenced entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// State conflict: duplicate invite, already claimed, capacity reached,
    /// owner-leave without transfer.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Balance (minus active reservations) cannot cover the requested amount.
    #[error("Insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: i64, available: i64 },

    /// Per-(user, action) token bucket is empty.
    #[error("Rate limited: {action}")]
    RateLimited { action: String },

    /// Target content's age rating exceeds the user's allowed rating.
    #[error("Age restricted: {0}")]
    AgeRestricted(String),

    /// AI provider HTTP or API-level failure (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider {
        provider: String,
        message: String,
        /// HTTP status from the provider, when one was received.
        status: Option<u16>,
    },

    /// Tool execution failure.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Transient infrastructure failure after the retry budget was spent.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Invariant violation or programming error. Logged with full context;
    /// surfaced to clients as a generic server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ── Kind classification ────────────────────────────────────────────────────

/// Closed classification used by the HTTP and WS adapters. One kind per
/// failure family; the mapping to status codes lives in the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    Forbidden,
    NotFound,
    Conflict,
    InsufficientCredits,
    RateLimited,
    Transient,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::Serialization(_) => ErrorKind::Validation,
            EngineError::Auth(_) => ErrorKind::Auth,
            EngineError::Forbidden(_) | EngineError::AgeRestricted(_) => ErrorKind::Forbidden,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::InsufficientCredits { .. } => ErrorKind::InsufficientCredits,
            EngineError::RateLimited { .. } => ErrorKind::RateLimited,
            EngineError::Network(_) | EngineError::Transient(_) => ErrorKind::Transient,
            EngineError::Provider { status, .. } => match status {
                Some(s) if *s == 429 || *s >= 500 => ErrorKind::Transient,
                _ => ErrorKind::Internal,
            },
            EngineError::Io(_)
            | EngineError::Database(_)
            | EngineError::Tool { .. }
            | EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for the response envelope / WS error event.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "validation_error",
            ErrorKind::Auth => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InsufficientCredits => "insufficient_credits",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "service_unavailable",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// Whether a component-level retry loop may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Create a provider error with name, message, and optional HTTP status.
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status: Option<u16>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status,
        }
    }

    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;
