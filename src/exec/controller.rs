//! Process lifecycle controller
//!
//! Owns the external process, coordinates pipe draining and line
//! accumulation, enforces cancellation and timeout, and guarantees the
//! termination callback fires exactly once per run with a complete,
//! consistently-ordered output snapshot.
//!
//! The OS delivers "process exited" independently of the last "bytes
//! available" notification, so finalization must not race ahead of
//! in-flight pipe reads. The wait task therefore joins both reader tasks
//! (which run until pipe EOF, i.e. until every byte written before exit has
//! been consumed) before emitting the exit event to the orchestrator.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::exec::accumulator::LineAccumulator;
use crate::exec::callbacks::ExecCallbacks;
use crate::exec::classifier::LineClassifier;
use crate::exec::config::ExecConfig;
use crate::exec::error::ExecError;

// ============================================================================
// Process State Management
// ============================================================================

/// How to request process termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Cooperative shutdown request (SIGTERM)
    Graceful,
    /// Immediate kill (SIGKILL)
    Force,
}

/// Execution lifecycle states
///
/// Transitions only move forward within a run:
/// `Idle -> Running -> [Cancelling] -> Terminated | Failed -> Idle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    /// No run in progress; `execute()` is only valid here
    Idle,
    /// Process is running
    Running { pid: u32 },
    /// Cancellation requested, waiting for the OS to confirm exit
    Cancelling { pid: u32 },
    /// Process exited and the run completed without failure
    Terminated { exit_code: i32 },
    /// Run ended in cancellation, a fault, or a checked non-zero exit
    Failed { reason: String },
}

impl ExecutionState {
    /// Get the process ID if a process is alive
    pub fn pid(&self) -> Option<u32> {
        match self {
            ExecutionState::Running { pid } | ExecutionState::Cancelling { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check whether a process is currently alive
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ExecutionState::Running { .. } | ExecutionState::Cancelling { .. }
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Idle => write!(f, "Idle"),
            ExecutionState::Running { pid } => write!(f, "Running (pid {pid})"),
            ExecutionState::Cancelling { pid } => write!(f, "Cancelling (pid {pid})"),
            ExecutionState::Terminated { exit_code } => {
                write!(f, "Terminated (exit code {exit_code})")
            }
            ExecutionState::Failed { reason } => write!(f, "Failed ({reason})"),
        }
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits, before finalization
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    /// Exit code; -1 when the process was signal-terminated
    pub exit_code: i32,
}

/// Trait for observing process exit events
#[async_trait]
pub trait ProcessExitObserver: Send + Sync {
    /// Called from the wait task once the process has exited and both pipes
    /// have been drained, before the termination callback is delivered
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Run Events
// ============================================================================

/// Events flowing from worker tasks into the orchestration task
enum ExecEvent {
    /// One completed stdout line, in completion order
    Line(String),
    /// An asynchronous failure (currently only timeout)
    Fault(ExecError),
    /// Process exited and both pipes reached EOF; always the last event
    Exited(i32),
}

// ============================================================================
// Process Controller
// ============================================================================

/// Coordinates one external process at a time
///
/// Constructed once with immutable configuration and handlers, reusable
/// across sequential runs; each `execute()` resets per-run state. All
/// methods take `&self` so a controller can be shared behind an `Arc` and
/// cancelled from any task.
pub struct ProcessController {
    config: ExecConfig,

    /// Per-line inspection hook
    classifier: Arc<dyn LineClassifier>,

    /// Notification hooks, invoked from the orchestration task
    callbacks: ExecCallbacks,

    /// Shared line accumulation buffer
    accumulator: Arc<LineAccumulator>,

    /// Thread-safe lifecycle state, single-writer per transition
    state: Arc<Mutex<ExecutionState>>,

    /// Set at most once per run; gates all further line processing
    cancelled: Arc<AtomicBool>,

    /// Set at most once per run by a classifier rejection or a fault
    error_occurred: Arc<AtomicBool>,

    /// Human-readable cause recorded alongside `error_occurred`
    fault_reason: Arc<Mutex<Option<String>>>,

    /// Exit code of the most recently completed run
    last_exit: Arc<Mutex<Option<i32>>>,

    /// Timeout timer, aborted on cancel or any terminal transition
    timeout_task: Arc<Mutex<Option<JoinHandle<()>>>>,

    /// Optional exit observer
    exit_observer: Option<Arc<dyn ProcessExitObserver>>,
}

impl ProcessController {
    /// Create a new controller
    pub fn new(
        config: ExecConfig,
        classifier: Arc<dyn LineClassifier>,
        callbacks: ExecCallbacks,
    ) -> Self {
        Self {
            config,
            classifier,
            callbacks,
            accumulator: Arc::new(LineAccumulator::new()),
            state: Arc::new(Mutex::new(ExecutionState::Idle)),
            cancelled: Arc::new(AtomicBool::new(false)),
            error_occurred: Arc::new(AtomicBool::new(false)),
            fault_reason: Arc::new(Mutex::new(None)),
            last_exit: Arc::new(Mutex::new(None)),
            timeout_task: Arc::new(Mutex::new(None)),
            exit_observer: None,
        }
    }

    /// Install an exit observer, replacing any previous one
    pub fn set_exit_observer(&mut self, observer: Arc<dyn ProcessExitObserver>) {
        self.exit_observer = Some(observer);
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Get the current lifecycle state (thread-safe)
    pub fn current_state(&self) -> ExecutionState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    /// Check whether a process is currently alive
    pub fn is_running(&self) -> bool {
        self.current_state().is_running()
    }

    /// Check whether the current run has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Get the process ID of the running process, if any
    pub fn process_id(&self) -> Option<u32> {
        self.current_state().pid()
    }

    /// Exit code of the most recently completed run, if any
    pub fn termination_status(&self) -> Option<i32> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.last_exit.lock().unwrap()
    }

    /// Copy of the stdout lines accumulated so far
    pub fn output_snapshot(&self) -> Vec<String> {
        self.accumulator.snapshot()
    }

    /// Copy of the stderr lines accumulated so far
    pub fn error_snapshot(&self) -> Vec<String> {
        self.accumulator.error_snapshot()
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Launch the configured process and wire up output coordination
    ///
    /// Fails synchronously only for precondition violations: the program
    /// must name an existing executable file and the controller must be
    /// idle. Every failure after the process has started is delivered
    /// through the error callback instead. Must be called from within a
    /// Tokio runtime.
    pub fn execute(&self) -> Result<(), ExecError> {
        self.validate_executable()?;

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut state_guard = self.state.lock().unwrap();
        if !matches!(*state_guard, ExecutionState::Idle) {
            return Err(ExecError::invalid_state(state_guard.to_string()));
        }

        // Fresh run: clear flags, counters and accumulated output
        self.accumulator.reset();
        self.cancelled.store(false, Ordering::SeqCst);
        self.error_occurred.store(false, Ordering::SeqCst);
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.fault_reason.lock().unwrap() = None;
        *self.last_exit.lock().unwrap() = None;

        info!(
            "Starting process: {} {:?}",
            self.config.program.display(),
            self.config.args
        );

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Backstop against leaking a child on the early-return paths
            // below; the wait task reaps it on every normal path
            .kill_on_drop(true);

        // An explicit environment map replaces the inherited one entirely
        if let Some(env) = &self.config.env {
            command.env_clear().envs(env);
        }
        if let Some(working_dir) = &self.config.working_directory {
            command.current_dir(working_dir);
        }

        let mut child = command.spawn()?;

        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return Err(ExecError::Io(std::io::Error::other(
                "Failed to get process ID",
            )));
        };
        info!("Process started with PID: {}", pid);

        let Some(stdout) = child.stdout.take() else {
            let _ = child.start_kill();
            return Err(ExecError::StdoutNotAvailable);
        };
        let Some(stderr) = child.stderr.take() else {
            let _ = child.start_kill();
            return Err(ExecError::StderrNotAvailable);
        };

        *state_guard = ExecutionState::Running { pid };
        drop(state_guard);

        (self.callbacks.on_process_update)(Some(pid));

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let stdout_task = self.spawn_stdout_reader(stdout, event_tx.clone());
        let stderr_task = self.spawn_stderr_reader(stderr);
        self.spawn_wait_task(child, pid, stdout_task, stderr_task, event_tx.clone());
        self.arm_timeout(event_tx);

        let orchestrator = RunOrchestrator {
            accumulator: Arc::clone(&self.accumulator),
            classifier: Arc::clone(&self.classifier),
            callbacks: self.callbacks.clone(),
            cancelled: Arc::clone(&self.cancelled),
            error_occurred: Arc::clone(&self.error_occurred),
            fault_reason: Arc::clone(&self.fault_reason),
            state: Arc::clone(&self.state),
            last_exit: Arc::clone(&self.last_exit),
            timeout_task: Arc::clone(&self.timeout_task),
            pid,
            check_exit_code: self.config.check_exit_code,
            report_line_progress: self.config.report_line_progress,
            correlation_id: self.config.correlation_id,
        };
        tokio::spawn(orchestrator.run(event_rx));

        Ok(())
    }

    /// Request cancellation of the current run
    ///
    /// Idempotent. Sends a graceful termination request and transitions to
    /// `Cancelling`; the termination callback fires later, once the OS
    /// confirms exit and the pipes have been drained.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Cancelling process execution");

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        if let Some(task) = self.timeout_task.lock().unwrap().take() {
            task.abort();
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut state = self.state.lock().unwrap();
        if let Some(pid) = state.pid() {
            *state = ExecutionState::Cancelling { pid };
            drop(state);
            Self::signal(pid, StopMode::Graceful);
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Verify the configured program names an existing executable file
    fn validate_executable(&self) -> Result<(), ExecError> {
        let path = &self.config.program;
        let Ok(metadata) = std::fs::metadata(path) else {
            return Err(ExecError::executable_not_found(path));
        };
        if !metadata.is_file() {
            return Err(ExecError::executable_not_found(path));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(ExecError::executable_not_found(path));
            }
        }

        Ok(())
    }

    /// Spawn the raw stdout reader task
    ///
    /// Reads byte chunks until EOF and forwards completed lines, in order,
    /// to the orchestrator. Keeps draining after a flag is set so the child
    /// never blocks on a full pipe, but stops forwarding.
    fn spawn_stdout_reader(
        &self,
        mut stdout: tokio::process::ChildStdout,
        event_tx: mpsc::UnboundedSender<ExecEvent>,
    ) -> JoinHandle<()> {
        let accumulator = Arc::clone(&self.accumulator);
        let cancelled = Arc::clone(&self.cancelled);
        let error_occurred = Arc::clone(&self.error_occurred);

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 8192];

            trace!("ProcessController: starting stdout reader");

            loop {
                match stdout.read(&mut buffer).await {
                    Ok(0) => {
                        trace!("ProcessController: stdout EOF reached");
                        break;
                    }
                    Ok(n) => {
                        if cancelled.load(Ordering::SeqCst)
                            || error_occurred.load(Ordering::SeqCst)
                        {
                            // Draining only
                            continue;
                        }
                        let Ok(text) = std::str::from_utf8(&buffer[..n]) else {
                            trace!("ProcessController: dropping undecodable stdout chunk ({n} bytes)");
                            continue;
                        };
                        for line in accumulator.consume(text) {
                            if event_tx.send(ExecEvent::Line(line)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stdout: {}", e);
                        break;
                    }
                }
            }

            trace!("ProcessController: stdout reader finished");
        })
    }

    /// Spawn the stderr reader task
    ///
    /// Stderr lines are recorded verbatim, with no classification.
    fn spawn_stderr_reader(&self, stderr: tokio::process::ChildStderr) -> JoinHandle<()> {
        let accumulator = Arc::clone(&self.accumulator);
        let cancelled = Arc::clone(&self.cancelled);
        let error_occurred = Arc::clone(&self.error_occurred);

        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();

            trace!("ProcessController: starting stderr reader");

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ProcessController: stderr EOF reached");
                        break;
                    }
                    Ok(_) => {
                        if cancelled.load(Ordering::SeqCst)
                            || error_occurred.load(Ordering::SeqCst)
                        {
                            // Draining only
                            continue;
                        }
                        accumulator.record_error(&line);
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }

            trace!("ProcessController: stderr reader finished");
        })
    }

    /// Spawn the wait task that detects process exit and drains the pipes
    ///
    /// Joining the reader tasks is the synchronization point that closes the
    /// exit-vs-data race: each reader runs until pipe EOF, so by the time
    /// both joins return, every byte the process wrote before exiting has
    /// passed through the accumulation pipeline. Only then is the exit event
    /// emitted, keeping it strictly last.
    fn spawn_wait_task(
        &self,
        mut child: tokio::process::Child,
        pid: u32,
        stdout_task: JoinHandle<()>,
        stderr_task: JoinHandle<()>,
        event_tx: mpsc::UnboundedSender<ExecEvent>,
    ) {
        let exit_observer = self.exit_observer.clone();

        tokio::spawn(async move {
            trace!("ProcessController: starting wait task for PID {}", pid);

            let exit_code = match child.wait().await {
                Ok(status) => {
                    info!("Process PID {} exited with status: {}", pid, status);
                    status.code().unwrap_or(-1)
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    -1
                }
            };

            // Drain to EOF before finalizing; trailing output written just
            // before exit is still in flight here
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            if let Some(observer) = &exit_observer {
                observer
                    .on_process_exit(ProcessExitEvent { exit_code })
                    .await;
            }

            let _ = event_tx.send(ExecEvent::Exited(exit_code));

            trace!("ProcessController: wait task finished for PID {}", pid);
        });
    }

    /// Arm the timeout timer, if one is configured
    fn arm_timeout(&self, event_tx: mpsc::UnboundedSender<ExecEvent>) {
        let Some(duration) = self.config.timeout else {
            return;
        };

        debug!("Arming execution timeout: {:?}", duration);

        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            warn!("Execution timeout fired after {:?}", duration);
            let _ = event_tx.send(ExecEvent::Fault(ExecError::Timeout { duration }));
        });

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.timeout_task.lock().unwrap() = Some(task);
    }

    /// Send a termination signal to a process
    fn signal(pid: u32, mode: StopMode) {
        #[cfg(unix)]
        {
            unsafe {
                match mode {
                    StopMode::Graceful => {
                        if libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 {
                            info!("Sent SIGTERM to process {}", pid);
                        }
                    }
                    StopMode::Force => {
                        libc::kill(pid as libc::pid_t, libc::SIGKILL);
                        info!("Sent SIGKILL to process {}", pid);
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
            warn!("Process termination signalling not implemented on this platform");
        }
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        if let Some(pid) = self.current_state().pid() {
            info!("Controller dropped with live process, force killing PID {}", pid);
            Self::signal(pid, StopMode::Force);
        }
    }
}

// ============================================================================
// Run Orchestration
// ============================================================================

/// Single consumer of run events; the one context where state transitions
/// and callback deliveries happen
struct RunOrchestrator {
    accumulator: Arc<LineAccumulator>,
    classifier: Arc<dyn LineClassifier>,
    callbacks: ExecCallbacks,
    cancelled: Arc<AtomicBool>,
    error_occurred: Arc<AtomicBool>,
    fault_reason: Arc<Mutex<Option<String>>>,
    state: Arc<Mutex<ExecutionState>>,
    last_exit: Arc<Mutex<Option<i32>>>,
    timeout_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    pid: u32,
    check_exit_code: bool,
    report_line_progress: bool,
    correlation_id: Uuid,
}

impl RunOrchestrator {
    /// Consume events until the exit event finalizes the run
    async fn run(self, mut event_rx: mpsc::UnboundedReceiver<ExecEvent>) {
        while let Some(event) = event_rx.recv().await {
            match event {
                ExecEvent::Line(line) => self.handle_line(&line),
                ExecEvent::Fault(error) => self.handle_fault(error),
                ExecEvent::Exited(exit_code) => {
                    self.finalize(exit_code);
                    break;
                }
            }
        }
    }

    fn flags_set(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.error_occurred.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ExecutionState) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = next;
    }

    /// Process one completed stdout line: progress first, then the classifier
    fn handle_line(&self, line: &str) {
        if self.flags_set() {
            return;
        }

        if self.report_line_progress {
            let count = self.accumulator.increment_line_counter();
            (self.callbacks.on_line_progress)(count);
        }

        if let Err(cause) = self.classifier.classify(line) {
            warn!("Classifier rejected line, terminating process: {}", cause);
            self.error_occurred.store(true, Ordering::SeqCst);
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            *self.fault_reason.lock().unwrap() = Some(cause.to_string());
            ProcessController::signal(self.pid, StopMode::Force);
            (self.callbacks.on_error)(ExecError::Classifier(cause));
        }
    }

    /// Handle an asynchronous fault; first one wins, cancellation overrides
    fn handle_fault(&self, error: ExecError) {
        if self.cancelled.load(Ordering::SeqCst) || self.error_occurred.swap(true, Ordering::SeqCst)
        {
            return;
        }

        warn!("Run fault, terminating process: {}", error);
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.fault_reason.lock().unwrap() = Some(error.to_string());
        ProcessController::signal(self.pid, StopMode::Force);
        (self.callbacks.on_error)(error);
    }

    /// Finalize the run: flush, compute the disposition, deliver the
    /// termination callback exactly once, return to idle
    fn finalize(&self, exit_code: i32) {
        // The last line of output may have had no terminator; it still
        // belongs in the snapshot and goes through the same pipeline
        if let Some(line) = self.accumulator.flush_trailing() {
            self.handle_line(&line);
        }

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        if let Some(task) = self.timeout_task.lock().unwrap().take() {
            task.abort();
        }
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.last_exit.lock().unwrap() = Some(exit_code);

        // Disposition priority: cancellation wins; an already-reported fault
        // suppresses further error reporting; then the checked exit code
        if self.cancelled.load(Ordering::SeqCst) {
            self.set_state(ExecutionState::Failed {
                reason: "cancelled".to_string(),
            });
            (self.callbacks.on_error)(ExecError::Cancelled);
        } else if self.error_occurred.load(Ordering::SeqCst) {
            // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
            let reason = self
                .fault_reason
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| "run fault".to_string());
            self.set_state(ExecutionState::Failed { reason });
        } else if self.check_exit_code && exit_code != 0 {
            self.set_state(ExecutionState::Failed {
                reason: format!("exit code {exit_code}"),
            });
            (self.callbacks.on_error)(ExecError::ProcessFailed {
                exit_code,
                stderr: self.accumulator.error_snapshot(),
            });
        } else {
            self.set_state(ExecutionState::Terminated { exit_code });
        }

        debug!(
            "Run finalized (exit code {}), delivering termination callback",
            exit_code
        );
        // Handle release is announced first; the termination callback is
        // always the last callback of a run
        (self.callbacks.on_process_update)(None);
        (self.callbacks.on_termination)(self.accumulator.snapshot(), self.correlation_id);

        // Controller is reusable from here; per-run flags are cleared so
        // observers no longer see a finished run as cancelled or faulted
        self.cancelled.store(false, Ordering::SeqCst);
        self.error_occurred.store(false, Ordering::SeqCst);
        self.set_state(ExecutionState::Idle);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::classifier::{AcceptAll, PatternClassifier};
    use std::time::Duration;

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    /// Everything a test wants to observe about one run
    struct RunProbe {
        controller: ProcessController,
        termination_rx: mpsc::UnboundedReceiver<(Vec<String>, Uuid)>,
        error_rx: mpsc::UnboundedReceiver<ExecError>,
        progress_rx: mpsc::UnboundedReceiver<u64>,
        update_rx: mpsc::UnboundedReceiver<Option<u32>>,
    }

    impl RunProbe {
        fn new(config: ExecConfig, classifier: Arc<dyn LineClassifier>) -> Self {
            let (termination_tx, termination_rx) = mpsc::unbounded_channel();
            let (error_tx, error_rx) = mpsc::unbounded_channel();
            let (progress_tx, progress_rx) = mpsc::unbounded_channel();
            let (update_tx, update_rx) = mpsc::unbounded_channel();

            let callbacks = ExecCallbacks::new()
                .on_termination(move |lines, id| {
                    let _ = termination_tx.send((lines, id));
                })
                .on_error(move |error| {
                    let _ = error_tx.send(error);
                })
                .on_line_progress(move |count| {
                    let _ = progress_tx.send(count);
                })
                .on_process_update(move |pid| {
                    let _ = update_tx.send(pid);
                });

            Self {
                controller: ProcessController::new(config, classifier, callbacks),
                termination_rx,
                error_rx,
                progress_rx,
                update_rx,
            }
        }

        async fn await_termination(&mut self) -> (Vec<String>, Uuid) {
            tokio::time::timeout(Duration::from_secs(10), self.termination_rx.recv())
                .await
                .expect("termination callback not delivered in time")
                .expect("termination channel closed")
        }
    }

    fn shell_config(script: &str) -> ExecConfig {
        ExecConfig::builder()
            .program("/bin/sh")
            .add_arg("-c")
            .add_arg(script)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_run_delivers_lines_in_order() {
        let mut probe = RunProbe::new(
            shell_config("printf 'one\\ntwo\\nthree\\n'"),
            Arc::new(AcceptAll),
        );

        probe.controller.execute().unwrap();
        let (lines, _) = probe.await_termination().await;

        assert_eq!(lines, vec!["one", "two", "three"]);
        assert_eq!(probe.controller.termination_status(), Some(0));
        assert_eq!(probe.controller.current_state(), ExecutionState::Idle);
        assert!(probe.error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_trailing_partial_line_is_flushed() {
        let mut probe = RunProbe::new(
            shell_config("printf 'complete\\nno newline at end'"),
            Arc::new(AcceptAll),
        );

        probe.controller.execute().unwrap();
        let (lines, _) = probe.await_termination().await;

        assert_eq!(lines, vec!["complete", "no newline at end"]);
    }

    #[tokio::test]
    async fn test_correlation_id_is_echoed_back() {
        let id = Uuid::new_v4();
        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "true"])
            .correlation_id(id)
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        let (_, echoed) = probe.await_termination().await;

        assert_eq!(echoed, id);
    }

    #[tokio::test]
    async fn test_executable_not_found_fails_synchronously() {
        let config = ExecConfig::builder()
            .program("/no/such/executable")
            .build()
            .unwrap();
        let probe = RunProbe::new(config, Arc::new(AcceptAll));

        let result = probe.controller.execute();
        assert!(matches!(
            result,
            Err(ExecError::ExecutableNotFound { .. })
        ));
        assert_eq!(probe.controller.current_state(), ExecutionState::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_executable_file_fails_synchronously() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("not-executable.sh");
        std::fs::write(&path, "#!/bin/sh\ntrue\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let config = ExecConfig::builder().program(&path).build().unwrap();
        let probe = RunProbe::new(config, Arc::new(AcceptAll));

        assert!(matches!(
            probe.controller.execute(),
            Err(ExecError::ExecutableNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_while_running_is_invalid_state() {
        let mut probe = RunProbe::new(shell_config("exec sleep 5"), Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        assert!(probe.controller.is_running());

        let result = probe.controller.execute();
        assert!(matches!(result, Err(ExecError::InvalidState { .. })));

        probe.controller.cancel();
        probe.await_termination().await;
    }

    #[tokio::test]
    async fn test_exit_code_failure_reported_when_checking_enabled() {
        let mut probe = RunProbe::new(
            shell_config("echo boom >&2; exit 7"),
            Arc::new(AcceptAll),
        );

        probe.controller.execute().unwrap();
        probe.await_termination().await;

        match probe.error_rx.try_recv().unwrap() {
            ExecError::ProcessFailed { exit_code, stderr } => {
                assert_eq!(exit_code, 7);
                assert_eq!(stderr, vec!["boom"]);
            }
            other => panic!("Expected ProcessFailed, got {other:?}"),
        }
        assert_eq!(probe.controller.termination_status(), Some(7));
        assert!(matches!(
            probe.controller.current_state(),
            ExecutionState::Idle
        ));
    }

    #[tokio::test]
    async fn test_exit_code_ignored_when_checking_disabled() {
        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "exit 7"])
            .check_exit_code(false)
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        probe.await_termination().await;

        assert!(probe.error_rx.try_recv().is_err());
        assert_eq!(probe.controller.termination_status(), Some(7));
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_everything() {
        // The classifier would reject every line, but cancellation is set
        // before any line can be processed, so only Cancelled is reported.
        let mut probe = RunProbe::new(
            shell_config("echo ERROR buffered; exec sleep 5"),
            Arc::new(PatternClassifier::new("ERROR").unwrap()),
        );

        probe.controller.execute().unwrap();
        probe.controller.cancel();
        assert!(probe.controller.is_cancelled());

        probe.await_termination().await;

        assert!(matches!(
            probe.error_rx.try_recv().unwrap(),
            ExecError::Cancelled
        ));
        assert!(probe.error_rx.try_recv().is_err());

        // The cancelled observation is scoped to the run; once finalized
        // the idle controller no longer reads as cancelled
        assert!(!probe.controller.is_cancelled());
        assert_eq!(probe.controller.current_state(), ExecutionState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let mut probe = RunProbe::new(shell_config("exec sleep 5"), Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        probe.controller.cancel();
        probe.controller.cancel();
        probe.controller.cancel();

        probe.await_termination().await;

        // Exactly one Cancelled report despite repeated cancels
        assert!(matches!(
            probe.error_rx.try_recv().unwrap(),
            ExecError::Cancelled
        ));
        assert!(probe.error_rx.try_recv().is_err());
        assert!(probe.termination_rx.try_recv().is_err());
        assert!(!probe.controller.is_cancelled());
    }

    #[tokio::test]
    async fn test_classifier_rejection_kills_process() {
        let mut probe = RunProbe::new(
            shell_config("echo fine; echo ERROR bad; exec sleep 5"),
            Arc::new(PatternClassifier::new("^ERROR").unwrap()),
        );

        probe.controller.execute().unwrap();
        let (lines, _) = probe.await_termination().await;

        // Both lines were accumulated before the rejection took effect
        assert!(lines.contains(&"fine".to_string()));
        assert!(matches!(
            probe.error_rx.try_recv().unwrap(),
            ExecError::Classifier(_)
        ));
        // The rejection suppresses any exit-code report for the kill
        assert!(probe.error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_reported_and_suppresses_exit_code_error() {
        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "exec sleep 5"])
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        probe.await_termination().await;

        match probe.error_rx.try_recv().unwrap() {
            ExecError::Timeout { duration } => {
                assert_eq!(duration, Duration::from_millis(200));
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert!(probe.error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_timeout_does_not_fire_on_fast_process() {
        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "echo quick"])
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        let (lines, _) = probe.await_termination().await;

        assert_eq!(lines, vec!["quick"]);
        assert!(probe.error_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_line_progress_reporting() {
        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "printf 'a\\nb\\nc\\n'"])
            .report_line_progress(true)
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        probe.await_termination().await;

        let mut counts = Vec::new();
        while let Ok(count) = probe.progress_rx.try_recv() {
            counts.push(count);
        }
        assert_eq!(counts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_process_update_callback_start_and_release() {
        let mut probe = RunProbe::new(shell_config("true"), Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        probe.await_termination().await;

        let started = probe.update_rx.try_recv().unwrap();
        assert!(started.is_some());
        let released = probe.update_rx.try_recv().unwrap();
        assert!(released.is_none());
    }

    #[tokio::test]
    async fn test_termination_callback_is_last() {
        // Record every callback delivery in one log; the termination
        // callback must be the final entry, after the handle release
        let log = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let callbacks = ExecCallbacks::new()
            .on_process_update({
                let log = Arc::clone(&log);
                move |pid| {
                    log.lock()
                        .unwrap()
                        .push(format!("update({})", pid.is_some()));
                }
            })
            .on_line_progress({
                let log = Arc::clone(&log);
                move |count| {
                    log.lock().unwrap().push(format!("progress({count})"));
                }
            })
            .on_termination({
                let log = Arc::clone(&log);
                move |_, _| {
                    log.lock().unwrap().push("termination".to_string());
                    let _ = done_tx.send(());
                }
            });

        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "printf 'x\\ny\\n'"])
            .report_line_progress(true)
            .build()
            .unwrap();
        let controller = ProcessController::new(config, Arc::new(AcceptAll), callbacks);

        controller.execute().unwrap();
        tokio::time::timeout(Duration::from_secs(10), done_rx.recv())
            .await
            .expect("termination callback not delivered in time");

        // Nothing may arrive after the termination callback
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = log.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "update(true)",
                "progress(1)",
                "progress(2)",
                "update(false)",
                "termination"
            ]
        );
    }

    #[tokio::test]
    async fn test_controller_is_reusable_after_a_run() {
        let mut probe = RunProbe::new(shell_config("echo run"), Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        let (first, _) = probe.await_termination().await;
        assert_eq!(first, vec!["run"]);

        probe.controller.execute().unwrap();
        let (second, _) = probe.await_termination().await;
        assert_eq!(second, vec!["run"]);
    }

    #[tokio::test]
    async fn test_environment_map_replaces_inherited_environment() {
        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "echo \"$PROCSTREAM_TEST_VAR\""])
            .env(std::collections::HashMap::from([(
                "PROCSTREAM_TEST_VAR".to_string(),
                "injected".to_string(),
            )]))
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        let (lines, _) = probe.await_termination().await;

        assert_eq!(lines, vec!["injected"]);
    }

    #[tokio::test]
    async fn test_working_directory_is_applied() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let expected = temp_dir.path().canonicalize().unwrap();

        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "pwd"])
            .working_directory(temp_dir.path())
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        probe.controller.execute().unwrap();
        let (lines, _) = probe.await_termination().await;

        assert_eq!(lines.len(), 1);
        assert_eq!(
            std::path::Path::new(&lines[0]).canonicalize().unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_exit_observer_sees_exit_code() {
        struct Recorder {
            tx: mpsc::UnboundedSender<i32>,
        }

        #[async_trait]
        impl ProcessExitObserver for Recorder {
            async fn on_process_exit(&self, event: ProcessExitEvent) {
                let _ = self.tx.send(event.exit_code);
            }
        }

        let config = ExecConfig::builder()
            .program("/bin/sh")
            .add_args(["-c", "exit 3"])
            .check_exit_code(false)
            .build()
            .unwrap();
        let mut probe = RunProbe::new(config, Arc::new(AcceptAll));

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        probe
            .controller
            .set_exit_observer(Arc::new(Recorder { tx: exit_tx }));

        probe.controller.execute().unwrap();
        probe.await_termination().await;

        assert_eq!(exit_rx.try_recv().unwrap(), 3);
    }

    #[test]
    fn test_execution_state_methods() {
        assert!(!ExecutionState::Idle.is_running());
        assert!(ExecutionState::Idle.pid().is_none());

        let running = ExecutionState::Running { pid: 12345 };
        assert!(running.is_running());
        assert_eq!(running.pid(), Some(12345));

        let cancelling = ExecutionState::Cancelling { pid: 12345 };
        assert!(cancelling.is_running());
        assert_eq!(cancelling.pid(), Some(12345));

        let terminated = ExecutionState::Terminated { exit_code: 0 };
        assert!(!terminated.is_running());
        assert!(terminated.pid().is_none());
    }
}
