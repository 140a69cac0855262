use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the client core.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns a user-friendly message (hides internal details).
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(msg) => format!("Configuration issue: {msg}"),
            Self::Storage(_) => "Local storage error. Check disk space and permissions.".into(),
            Self::Network(_) => "Network error. Check your connection.".into(),
            Self::Auth(_) => "Session expired. Please sign in again.".into(),
            Self::Internal(_) => "An unexpected error occurred.".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error classification for anyhow::Error (message-pattern based)
// ---------------------------------------------------------------------------

/// How loudly an error should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Log it and move on.
    Low,
    /// Surface it; the operation can be retried.
    Medium,
    /// The operation failed outright.
    High,
    /// Local state may be inconsistent.
    Critical,
}

/// What went wrong, judged from the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifiedCategory {
    Network,
    Authentication,
    RateLimit,
    Configuration,
    Database,
    Stream,
    Internal,
}

/// Substrings (lowercase) that assign an error to a category. Checked in
/// order, so the more specific categories come first.
const CATEGORY_PATTERNS: &[(ClassifiedCategory, &[&str])] = &[
    (ClassifiedCategory::RateLimit, &["rate limit", "429"]),
    (
        ClassifiedCategory::Authentication,
        &["unauthorized", "401", "login"],
    ),
    (
        ClassifiedCategory::Network,
        &["timeout", "connection", "dns"],
    ),
    (ClassifiedCategory::Stream, &["stream", "socket"]),
    (ClassifiedCategory::Database, &["database", "sqlite"]),
    (ClassifiedCategory::Configuration, &["config"]),
];

impl ClassifiedCategory {
    fn severity(self) -> ErrorSeverity {
        match self {
            Self::Authentication | Self::Database => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }

    fn user_message(self) -> &'static str {
        match self {
            Self::Network => "Network error. Check your connection.",
            Self::Authentication => "Session expired. Please sign in again.",
            Self::RateLimit => "Rate limited. Please retry shortly.",
            Self::Configuration => "Configuration error. Check settings.",
            Self::Database => "Local storage error. Your data is safe.",
            Self::Stream => "Live connection interrupted. Reconnecting.",
            Self::Internal => "An unexpected error occurred.",
        }
    }
}

/// An error judged for routing: how severe, what kind, what to show.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub severity: ErrorSeverity,
    pub category: ClassifiedCategory,
    pub message: String,
    pub user_message: String,
    pub recoverable: bool,
}

/// Judge an `anyhow::Error` by matching its text against the category
/// pattern table; anything unrecognized lands in `Internal`.
pub fn classify_error(error: &anyhow::Error) -> ClassifiedError {
    let message = error.to_string();
    let lowered = message.to_lowercase();

    let category = CATEGORY_PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(category, _)| *category)
        .unwrap_or(ClassifiedCategory::Internal);
    let severity = category.severity();

    ClassifiedError {
        severity,
        category,
        message,
        user_message: category.user_message().to_string(),
        recoverable: severity != ErrorSeverity::Critical,
    }
}
