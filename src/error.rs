//! Error types for workshop-dl
//!
//! Only configuration and pre-flight problems are fatal to a run. Everything
//! that goes wrong inside a pass (tool crashes, timeouts, unreadable logs) is
//! folded into per-item [`Outcome`](crate::types::Outcome)s instead and retried
//! by the pass controller.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for workshop-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for workshop-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_instances")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The item list could not be read or contained no identifiers
    #[error("item source {path}: {reason}")]
    ItemSource {
        /// Path of the item list
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// The per-instance command script could not be written
    #[error("failed to create script {path} for slot {slot}: {source}")]
    ScriptCreation {
        /// Worker slot the script belongs to
        slot: usize,
        /// Script path that could not be written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// External tool execution failed (steamcmd)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A required file or binary is missing
    #[error("not found: {0}")]
    NotFound(String),

    /// The run was cancelled before it could finish
    #[error("run cancelled")]
    Cancelled,
}

impl Error {
    /// Build a configuration error for a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
