//! Callback set consumed by the process controller
//!
//! Plain struct of function slots with no-op defaults; hosts wire in only
//! the notifications they care about. All callbacks are invoked from the
//! controller's orchestration task, never from pipe reader threads, and the
//! termination callback is always the last one invoked for a run.

use std::sync::Arc;
use uuid::Uuid;

use crate::exec::error::ExecError;

/// Invoked exactly once per run with the final output snapshot and the
/// caller-supplied correlation identifier
pub type TerminationHandler = Arc<dyn Fn(Vec<String>, Uuid) + Send + Sync>;

/// Invoked per completed stdout line with the running line count
pub type LineProgressHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// Invoked with `Some(pid)` when the process starts and `None` when the
/// handle is released
pub type ProcessUpdateHandler = Arc<dyn Fn(Option<u32>) + Send + Sync>;

/// Invoked at most once per run with the highest-priority failure
pub type ErrorHandler = Arc<dyn Fn(ExecError) + Send + Sync>;

/// Notification hooks for one controller
#[derive(Clone)]
pub struct ExecCallbacks {
    pub on_termination: TerminationHandler,
    pub on_line_progress: LineProgressHandler,
    pub on_process_update: ProcessUpdateHandler,
    pub on_error: ErrorHandler,
}

impl Default for ExecCallbacks {
    fn default() -> Self {
        Self {
            on_termination: Arc::new(|_, _| {}),
            on_line_progress: Arc::new(|_| {}),
            on_process_update: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
        }
    }
}

impl ExecCallbacks {
    /// Create a callback set with every slot a no-op
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the termination handler
    pub fn on_termination<F>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<String>, Uuid) + Send + Sync + 'static,
    {
        self.on_termination = Arc::new(handler);
        self
    }

    /// Set the per-line progress handler
    pub fn on_line_progress<F>(mut self, handler: F) -> Self
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.on_line_progress = Arc::new(handler);
        self
    }

    /// Set the process handle update handler
    pub fn on_process_update<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<u32>) + Send + Sync + 'static,
    {
        self.on_process_update = Arc::new(handler);
        self
    }

    /// Set the error handler
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecError) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }
}

impl std::fmt::Debug for ExecCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecCallbacks")
            .field("on_termination", &"Fn(Vec<String>, Uuid)")
            .field("on_line_progress", &"Fn(u64)")
            .field("on_process_update", &"Fn(Option<u32>)")
            .field("on_error", &"Fn(ExecError)")
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
