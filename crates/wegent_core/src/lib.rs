//! Foundation types and services for the Wegent client core.
//!
//! This crate provides runtime configuration, error classification, logging
//! initialization, encrypted token storage, local key-value persistence, and
//! the post-login redirect sanitizer shared by the other Wegent crates.

/// Runtime configuration fetched once from the backend and cached.
pub mod config;
/// Error types, severity levels, and user-friendly error classification.
pub mod error;
/// Local key-value persistence backed by SQLite.
pub mod kv;
/// Logging initialization with daily file rotation and console output.
pub mod logging;
/// Post-login redirect path validation and normalization.
pub mod redirect;
/// AES-256-GCM encrypted storage for the bearer token.
pub mod token;

pub use config::{RuntimeConfig, WegentDirs, fetch_runtime_config, runtime_config};
pub use error::{
    ClassifiedCategory, ClassifiedError, CoreError, ErrorSeverity, classify_error,
};
pub use kv::{KvStore, POST_LOGIN_REDIRECT_KEY};
pub use redirect::sanitize_redirect_path;
pub use token::TokenStore;
