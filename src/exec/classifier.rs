//! Line classification for subprocess output
//!
//! A classifier inspects each completed stdout line and may reject it,
//! which aborts the run and surfaces the rejection through the error
//! callback. Line content is opaque text; this module ships a no-op
//! classifier and a regex-based one, callers supply their own for
//! anything richer.

use regex::Regex;

use crate::exec::error::BoxError;

/// Caller-supplied per-line inspection hook
///
/// Invoked synchronously for every completed stdout line, in completion
/// order. Returning an error halts further line processing for the run and
/// requests process termination.
pub trait LineClassifier: Send + Sync {
    /// Inspect one output line; an `Err` aborts the run
    fn classify(&self, line: &str) -> Result<(), BoxError>;
}

/// Classifier that accepts every line
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl LineClassifier for AcceptAll {
    fn classify(&self, _line: &str) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Rejection raised by [`PatternClassifier`] when a line matches
#[derive(Debug, thiserror::Error)]
#[error("line matched rejection pattern `{pattern}`: {line}")]
pub struct LineRejected {
    pub pattern: String,
    pub line: String,
}

/// Classifier that rejects any line matching a regex
///
/// Useful for tools that report fatal conditions inline on stdout rather
/// than through their exit code.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    rejection_pattern: Regex,
}

impl PatternClassifier {
    /// Create a classifier from a rejection pattern
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            rejection_pattern: Regex::new(pattern)?,
        })
    }
}

impl LineClassifier for PatternClassifier {
    fn classify(&self, line: &str) -> Result<(), BoxError> {
        if self.rejection_pattern.is_match(line) {
            return Err(Box::new(LineRejected {
                pattern: self.rejection_pattern.as_str().to_string(),
                line: line.to_string(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
