//! Error types for subprocess execution
//!
//! Splits failures into two families: synchronous precondition errors
//! returned directly from `execute()`, and asynchronous run failures
//! delivered exactly once through the error callback.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Opaque error type produced by caller-supplied line classifiers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

// ============================================================================
// Execution Errors
// ============================================================================

/// Errors surfaced by a process run
///
/// `ExecutableNotFound`, `InvalidState` and the pipe availability variants
/// are returned synchronously from `execute()` before a process exists.
/// Everything else is reported through the error callback.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Executable path missing, not a file, or not executable
    #[error("Executable not found or not executable: {path}")]
    ExecutableNotFound { path: PathBuf },

    /// `execute()` called while a prior run has not returned to idle
    #[error("Invalid execution state: {state}")]
    InvalidState { state: String },

    /// Run was cancelled; always wins over any other failure
    #[error("Process execution cancelled")]
    Cancelled,

    /// Run exceeded the configured timeout
    #[error("Process timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Process exited non-zero with exit-code checking enabled
    #[error("Process failed with exit code {exit_code}")]
    ProcessFailed {
        exit_code: i32,
        stderr: Vec<String>,
    },

    /// A caller-supplied classifier rejected an output line
    #[error("Line classification failed: {0}")]
    Classifier(#[source] BoxError),

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Create an executable-not-found error for a path
    pub fn executable_not_found(path: impl AsRef<Path>) -> Self {
        Self::ExecutableNotFound {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create an invalid-state error from the observed state
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and building errors
#[derive(Debug, thiserror::Error)]
pub enum ExecConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Invalid timeout value
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    /// Invalid working directory
    #[error("Invalid working directory: {path} - {reason}")]
    InvalidWorkingDirectory { path: PathBuf, reason: String },
}

impl ExecConfigError {
    /// Create a missing field error
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    /// Create an invalid timeout error
    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }

    /// Create an invalid working directory error
    pub fn invalid_working_directory(
        path: impl Into<PathBuf>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidWorkingDirectory {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
