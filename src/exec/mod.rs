//! Execution layer - subprocess output coordination
//!
//! This module provides the two halves of the coordinator:
//!
//! - **LineAccumulator**: serialized chunk-to-line segmentation buffer
//! - **ProcessController**: process lifecycle, pipe draining, cancellation,
//!   timeout, and exactly-once termination reporting
//!
//! The accumulator is a leaf with no dependency on the controller.

pub mod accumulator;
pub mod callbacks;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;

// Re-export main types for convenience
pub use accumulator::LineAccumulator;
pub use callbacks::ExecCallbacks;
pub use classifier::{AcceptAll, LineClassifier, LineRejected, PatternClassifier};
pub use config::{ExecConfig, ExecConfigBuilder};
pub use controller::{
    ExecutionState, ProcessController, ProcessExitEvent, ProcessExitObserver, StopMode,
};
pub use error::{BoxError, ExecConfigError, ExecError};
