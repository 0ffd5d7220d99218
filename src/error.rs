//! Custom error types for ralph-loop.
//!
//! This module provides structured error types for the continuation loop.
//! Most of them never escape the stop hook: the hook maps every failure to
//! a recovery action (no-op, delete state, unlocked fallback) instead of
//! surfacing it to the host runtime.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ralph-loop operations
#[derive(Error, Debug)]
pub enum RalphError {
    // =========================================================================
    // Hook Input Errors
    // =========================================================================
    /// Hook payload on stdin could not be parsed
    #[error("Invalid hook input: {message}")]
    HostInput { message: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// State file exists but cannot be trusted
    #[error("Loop state corrupted: {reason}")]
    StateCorruption { reason: String },

    /// Completion promise cannot be encoded in the state file
    #[error("Invalid completion promise: {reason}")]
    InvalidPromise { reason: String },

    /// Default prompt requested but the feature list is missing
    #[error("Feature list not found: {path}")]
    MissingFeatureList { path: PathBuf },

    // =========================================================================
    // Lock Errors
    // =========================================================================
    /// Lock could not be acquired before the deadline
    #[error("Timed out acquiring lock on {path} (held by pid {holder_pid:?})")]
    LockTimeout {
        path: PathBuf,
        holder_pid: Option<u32>,
    },

    /// Lock is held by another process
    #[error("Lock on {path} is owned by pid {holder_pid}")]
    LockOwnership { path: PathBuf, holder_pid: u32 },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RalphError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a hook input error
    pub fn host_input(message: impl Into<String>) -> Self {
        Self::HostInput {
            message: message.into(),
        }
    }

    /// Create a state corruption error
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Self::StateCorruption {
            reason: reason.into(),
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Get error code for exit status of the non-hook commands
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::MissingFeatureList { .. } | Self::InvalidPromise { .. } => 2,
            Self::LockTimeout { .. } | Self::LockOwnership { .. } => 3,
            Self::Config { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for ralph-loop results
pub type Result<T> = std::result::Result<T, RalphError>;
