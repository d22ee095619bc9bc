//! Streaming subprocess output coordination
//!
//! Launches an external command, attaches to its stdout and stderr byte
//! streams, and delivers complete output lines to the host incrementally
//! and in order, with cooperative cancellation, an optional execution
//! timeout, and deterministic termination reporting even when the OS
//! delivers "process exited" before the last "bytes available".
//!
//! The typical flow: build an [`ExecConfig`], pick a [`LineClassifier`],
//! wire up [`ExecCallbacks`], hand all three to a [`ProcessController`],
//! and call `execute()`. The termination callback fires exactly once per
//! run with the complete output snapshot.

pub mod exec;
pub mod logging;

#[cfg(test)]
mod test_utils;

pub use exec::{
    AcceptAll, BoxError, ExecCallbacks, ExecConfig, ExecConfigBuilder, ExecConfigError, ExecError,
    ExecutionState, LineAccumulator, LineClassifier, LineRejected, PatternClassifier,
    ProcessController, ProcessExitEvent, ProcessExitObserver, StopMode,
};
