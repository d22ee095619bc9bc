//! Configuration for a process controller
//!
//! Provides ExecConfig with builder pattern and validation. The program
//! path is expected to be pre-resolved by the host; the controller only
//! verifies it names an executable file at launch time.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::exec::error::ExecConfigError;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Maximum allowed execution timeout (1 hour)
///
/// Prevents configuration of unreasonably long timeouts that would make the
/// timer indistinguishable from having none at all.
pub const MAX_TIMEOUT_SECS: u64 = 3600;

// ============================================================================
// Core Configuration Type
// ============================================================================

/// Immutable per-controller execution configuration
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Absolute path to the executable to launch
    pub program: PathBuf,

    /// Ordered argument list
    pub args: Vec<String>,

    /// Environment map; `None` inherits the host environment
    pub env: Option<HashMap<String, String>>,

    /// Working directory for the process (optional)
    pub working_directory: Option<PathBuf>,

    /// Optional execution timeout, armed at launch
    pub timeout: Option<Duration>,

    /// Opaque identifier echoed back in the termination callback
    pub correlation_id: Uuid,

    /// Report a non-zero exit code as a failure
    pub check_exit_code: bool,

    /// Report the running line count per completed stdout line
    pub report_line_progress: bool,
}

impl ExecConfig {
    /// Start building a configuration
    pub fn builder() -> ExecConfigBuilder {
        ExecConfigBuilder::new()
    }
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for ExecConfig with validation and defaults
#[derive(Debug, Default)]
pub struct ExecConfigBuilder {
    program: Option<PathBuf>,
    args: Vec<String>,
    env: Option<HashMap<String, String>>,
    working_directory: Option<PathBuf>,
    timeout: Option<Duration>,
    correlation_id: Option<Uuid>,
    check_exit_code: Option<bool>,
    report_line_progress: Option<bool>,
}

impl ExecConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the executable path
    pub fn program(mut self, path: impl Into<PathBuf>) -> Self {
        self.program = Some(path.into());
        self
    }

    /// Add one command-line argument
    pub fn add_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple command-line arguments
    pub fn add_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(|arg| arg.into()));
        self
    }

    /// Replace the inherited environment with an explicit map
    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Set the working directory for the process
    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    /// Set the execution timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the correlation identifier (defaults to a fresh v4 UUID)
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Enable or disable exit-code checking (default: enabled)
    pub fn check_exit_code(mut self, check: bool) -> Self {
        self.check_exit_code = Some(check);
        self
    }

    /// Enable or disable per-line progress reporting (default: disabled)
    pub fn report_line_progress(mut self, report: bool) -> Self {
        self.report_line_progress = Some(report);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<ExecConfig, ExecConfigError> {
        let program = self
            .program
            .ok_or_else(|| ExecConfigError::missing_field("program"))?;

        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(ExecConfigError::invalid_timeout(
                    timeout,
                    "timeout must be positive",
                ));
            }
            if timeout > Duration::from_secs(MAX_TIMEOUT_SECS) {
                return Err(ExecConfigError::invalid_timeout(
                    timeout,
                    format!("timeout exceeds maximum of {MAX_TIMEOUT_SECS}s"),
                ));
            }
        }

        if let Some(dir) = &self.working_directory {
            if !dir.is_dir() {
                return Err(ExecConfigError::invalid_working_directory(
                    dir.clone(),
                    "not an existing directory",
                ));
            }
        }

        Ok(ExecConfig {
            program,
            args: self.args,
            env: self.env,
            working_directory: self.working_directory,
            timeout: self.timeout,
            correlation_id: self.correlation_id.unwrap_or_else(Uuid::new_v4),
            check_exit_code: self.check_exit_code.unwrap_or(true),
            report_line_progress: self.report_line_progress.unwrap_or(false),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
