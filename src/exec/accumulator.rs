//! Chunk-to-line segmentation buffer
//!
//! Turns arbitrarily-sized text chunks arriving from pipe readers into
//! complete output lines, retaining at most one partial line between calls.
//! All callers go through one mutex, so concurrent `consume` calls are
//! linearized and a line split across chunk boundaries is reassembled
//! without corruption.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Mutable accumulator state, only touched under the lock
#[derive(Debug, Default)]
struct AccumulatorState {
    /// All completed lines in delivery order, append-only during a run
    completed_lines: Vec<String>,

    /// Undelimited tail of the most recently consumed chunk
    partial_line: String,

    /// Raw stderr-derived lines, trimmed
    error_lines: Vec<String>,
}

/// Serialized line accumulation buffer shared between pipe reader tasks
///
/// Invariant: concatenating every chunk ever passed to `consume`, in arrival
/// order, equals all completed lines joined by terminators plus the retained
/// partial line. Empty lines are dropped, never emitted.
#[derive(Debug, Default)]
pub struct LineAccumulator {
    state: Mutex<AccumulatorState>,

    /// Lines reported to the progress callback so far; reset independently
    line_counter: AtomicU64,
}

impl LineAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk and return the lines it newly completed
    ///
    /// Appends the chunk to any retained partial line, splits on `\n`
    /// (normalizing `\r\n` by stripping one trailing `\r` per line), drops
    /// empty lines, and retains the undelimited remainder. Returns only the
    /// lines completed by this call, in order.
    pub fn consume(&self, chunk: &str) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut state = self.state.lock().unwrap();

        let mut pending = std::mem::take(&mut state.partial_line);
        pending.push_str(chunk);

        let mut emitted = Vec::new();
        while let Some(pos) = pending.find('\n') {
            let mut line: String = pending.drain(..=pos).collect();
            line.pop(); // the '\n'
            if line.ends_with('\r') {
                line.pop();
            }
            if !line.is_empty() {
                state.completed_lines.push(line.clone());
                emitted.push(line);
            }
        }

        trace!(
            "LineAccumulator: consumed {} bytes, completed {} lines, {} bytes pending",
            chunk.len(),
            emitted.len(),
            pending.len()
        );

        state.partial_line = pending;
        emitted
    }

    /// Promote a non-empty trailing partial line to one final completed line
    ///
    /// Returns the flushed line, or `None` when there is nothing pending.
    /// Idempotent after the first call.
    pub fn flush_trailing(&self) -> Option<String> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut state = self.state.lock().unwrap();

        if state.partial_line.is_empty() {
            return None;
        }

        let line = std::mem::take(&mut state.partial_line);
        trace!("LineAccumulator: flushed trailing partial line ({} bytes)", line.len());
        state.completed_lines.push(line.clone());
        Some(line)
    }

    /// Record one stderr-derived line; trims surrounding whitespace
    ///
    /// Whitespace-only input is dropped. Never fails.
    pub fn record_error(&self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut state = self.state.lock().unwrap();
        state.error_lines.push(trimmed.to_string());
    }

    /// Independent copy of all completed lines so far
    pub fn snapshot(&self) -> Vec<String> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().completed_lines.clone()
    }

    /// Independent copy of all recorded stderr lines so far
    pub fn error_snapshot(&self) -> Vec<String> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().error_lines.clone()
    }

    /// Atomically increment the progress line counter and return the new count
    pub fn increment_line_counter(&self) -> u64 {
        self.line_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clear all accumulated state for a fresh run
    pub fn reset(&self) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut state = self.state.lock().unwrap();
        state.completed_lines.clear();
        state.partial_line.clear();
        state.error_lines.clear();
        self.line_counter.store(0, Ordering::SeqCst);
    }
}

// ============================================================================
// Tests
// ============================================================================
