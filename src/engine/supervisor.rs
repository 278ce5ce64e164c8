//! Long-lived agent process supervisor.
//!
//! One `ProcessTurnSupervisor` owns one child process for its whole life:
//! it launches it, writes one stream-json line per turn, decodes stdout into
//! `EngineEvent`s for the active turn, and tears the process down on hang,
//! idle timeout, crash or explicit kill.
//!
//! All mutable state sits in `Core` behind a single `parking_lot::Mutex` that
//! is never held across an `.await`. Every producer (stdout/stderr readers,
//! timers, the exit observer, the stdin writer) emits while holding it, so a
//! turn's events are delivered in exactly the order they were produced.
//!
//! Every way the process can die goes through [`Inner::terminate_locked`]:
//! the first call flips the state to `Dead` and fails the active turn, later
//! calls see `Dead` and do nothing.

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::SupervisorConfig;

use super::decoder::{ClaudeStreamDecoder, RecordPart, WireDecoder};
use super::framing::LineBuffer;
use super::launch::build_command;
use super::protocol::{record_type, OutgoingUserMessage, RESULT_RECORD};
use super::timer::TimerSlot;
use super::turn::{Turn, TurnStream};
use super::types::{EngineError, EngineEvent, ImageData, LogStream, ProcessState};

const READ_CHUNK: usize = 8 * 1024;

/// How long the exit observer waits for stdout to drain after the process exits.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type CleanupHook = Box<dyn FnOnce() + Send + 'static>;

/// Supervises one external agent process across many turns.
pub struct ProcessTurnSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    decoder: Arc<dyn WireDecoder>,
    core: Mutex<Core>,
    exited: watch::Sender<bool>,
    cleanup: Mutex<Option<CleanupHook>>,
}

struct Core {
    state: ProcessState,
    pid: Option<u32>,
    /// Taken by the writer task for the duration of a write.
    stdin: Option<ChildStdin>,
    turn: Option<Turn>,
    lines: LineBuffer,
    hang_timer: TimerSlot,
    idle_timer: TimerSlot,
    kill_tx: Option<mpsc::UnboundedSender<KillRequest>>,
}

#[derive(Debug, Clone, Copy)]
enum KillRequest {
    Interrupt,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// Interrupt, then kill after the grace period.
    Graceful,
    Force,
}

#[derive(Debug, Clone)]
enum Termination {
    Hang,
    IdleTimeout,
    WriteFailed(String),
    Killed,
    Dropped,
}

impl Termination {
    /// Message delivered to an active turn.
    fn turn_error(&self) -> String {
        match self {
            Termination::Hang => "hang detected".to_string(),
            Termination::IdleTimeout => "idle timeout".to_string(),
            Termination::WriteFailed(err) => format!("failed to write turn input: {}", err),
            Termination::Killed | Termination::Dropped => "terminated".to_string(),
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Hang => write!(f, "hang"),
            Termination::IdleTimeout => write!(f, "idle timeout"),
            Termination::WriteFailed(_) => write!(f, "stdin write failure"),
            Termination::Killed => write!(f, "kill requested"),
            Termination::Dropped => write!(f, "supervisor dropped"),
        }
    }
}

fn format_exit_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

impl ProcessTurnSupervisor {
    /// Supervisor using the Claude stream-json decoder.
    pub fn new(config: SupervisorConfig) -> Self {
        let decoder = Arc::new(ClaudeStreamDecoder::new(config.include_partial_messages));
        Self::with_decoder(config, decoder)
    }

    pub fn with_decoder(config: SupervisorConfig, decoder: Arc<dyn WireDecoder>) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                decoder,
                core: Mutex::new(Core {
                    state: ProcessState::Starting,
                    pid: None,
                    stdin: None,
                    turn: None,
                    lines: LineBuffer::new(),
                    hang_timer: TimerSlot::new(),
                    idle_timer: TimerSlot::new(),
                    kill_tx: None,
                }),
                exited,
                cleanup: Mutex::new(None),
            }),
        }
    }

    /// Hook run once, when the child process has been reaped.
    pub fn with_cleanup_hook<F>(self, hook: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.cleanup.lock() = Some(Box::new(hook));
        self
    }

    /// Launch the agent. Must be called from within a Tokio runtime, once.
    ///
    /// Returns `false` if the launch failed (the supervisor is then `Dead`) or
    /// if `spawn` was already called.
    pub fn spawn(&self) -> bool {
        let mut core = self.inner.core.lock();
        if core.state != ProcessState::Starting {
            log::warn!("spawn called twice: state={}", core.state);
            return false;
        }
        match self.inner.launch(&mut core) {
            Ok(()) => {
                log::info!(
                    "Agent process spawned: pid={:?}, model={}, cwd={}",
                    core.pid,
                    self.inner.config.model,
                    self.inner.config.working_dir.display()
                );
                true
            }
            Err(err) => {
                log::warn!("Agent launch failed: {}", err);
                core.state = ProcessState::Dead;
                drop(core);
                self.inner.exited.send_replace(true);
                false
            }
        }
    }

    /// Start a turn and return its event stream.
    ///
    /// Outside `Idle` the stream is just `error` + `done` and the process is
    /// not touched. Otherwise the supervisor becomes `Busy` immediately and the
    /// input line is written in the background.
    pub fn send_turn(&self, prompt: &str, images: Vec<ImageData>) -> TurnStream {
        let mut core = self.inner.core.lock();
        match core.state {
            ProcessState::Idle => {}
            ProcessState::Busy => return TurnStream::rejected("engine is busy"),
            ProcessState::Starting | ProcessState::Dead => {
                return TurnStream::rejected("engine is not running")
            }
        }

        let line = match OutgoingUserMessage::new(prompt, &images).to_line() {
            Ok(line) => line,
            Err(err) => return TurnStream::rejected(err.to_string()),
        };
        let Some(stdin) = core.stdin.take() else {
            return TurnStream::rejected(EngineError::StdinClosed.to_string());
        };

        let (turn, stream) = Turn::new(self.inner.config.max_images_per_turn);
        let turn_id = turn.id.clone();
        log::debug!(
            "Starting turn: id={}, pid={:?}, images={}",
            turn_id,
            core.pid,
            images.len()
        );

        // The idle timer must be gone before the process counts as busy.
        core.idle_timer.cancel();
        core.state = ProcessState::Busy;
        core.turn = Some(turn);
        self.inner.arm_hang_timer(&mut core);
        drop(core);

        tokio::spawn(Arc::clone(&self.inner).write_turn(stdin, line, turn_id));
        stream
    }

    /// Interrupt the process, killing it after the grace period. An active
    /// turn ends with `error("terminated")` + `done`.
    ///
    /// Returns `false` if the process was already dead.
    pub fn kill(&self) -> bool {
        self.inner.terminate(Termination::Killed, Signal::Graceful)
    }

    /// Kill the process immediately. Same turn guarantee as [`kill`](Self::kill).
    pub fn force_kill(&self) -> bool {
        self.inner.terminate(Termination::Killed, Signal::Force)
    }

    pub fn state(&self) -> ProcessState {
        self.inner.core.lock().state
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state(), ProcessState::Idle | ProcessState::Busy)
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.core.lock().pid
    }

    /// Resolve once the child has been reaped. Returns immediately if no
    /// process was ever started.
    pub async fn wait_for_exit(&self) {
        let mut exited = self.inner.exited.subscribe();
        if self.inner.core.lock().pid.is_none() {
            return;
        }
        let _ = exited.wait_for(|exited| *exited).await;
    }
}

impl Drop for ProcessTurnSupervisor {
    fn drop(&mut self) {
        self.inner.terminate(Termination::Dropped, Signal::Force);
    }
}

impl Inner {
    fn launch(self: &Arc<Self>, core: &mut Core) -> Result<(), EngineError> {
        let mut child = build_command(&self.config)
            .spawn()
            .map_err(EngineError::Spawn)?;

        let stdin = child.stdin.take().ok_or(EngineError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(EngineError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(EngineError::MissingPipe("stderr"))?;

        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (stdout_closed_tx, stdout_closed_rx) = oneshot::channel();

        core.pid = child.id();
        core.stdin = Some(stdin);
        core.kill_tx = Some(kill_tx);
        core.state = ProcessState::Idle;
        self.arm_idle_timer(core);

        tokio::spawn(Arc::clone(self).read_stdout(stdout, stdout_closed_tx));
        tokio::spawn(Arc::clone(self).read_stderr(stderr));
        tokio::spawn(Arc::clone(self).watch_exit(child, kill_rx, stdout_closed_rx));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn arm_hang_timer(self: &Arc<Self>, core: &mut Core) {
        let inner = Arc::downgrade(self);
        core.hang_timer.arm(self.config.hang_timeout(), move |generation| {
            if let Some(inner) = inner.upgrade() {
                inner.on_hang_timeout(generation);
            }
        });
    }

    fn arm_idle_timer(self: &Arc<Self>, core: &mut Core) {
        let inner = Arc::downgrade(self);
        core.idle_timer.arm(self.config.idle_timeout(), move |generation| {
            if let Some(inner) = inner.upgrade() {
                inner.on_idle_timeout(generation);
            }
        });
    }

    fn on_hang_timeout(&self, generation: u64) {
        let mut core = self.core.lock();
        if !core.hang_timer.take_fired(generation) || core.state != ProcessState::Busy {
            return;
        }
        log::warn!(
            "No agent output for {:?}, assuming hang: pid={:?}, turn={:?}",
            self.config.hang_timeout(),
            core.pid,
            core.turn.as_ref().map(|t| t.id.as_str())
        );
        self.terminate_locked(core, Termination::Hang, Signal::Force);
    }

    fn on_idle_timeout(&self, generation: u64) {
        let mut core = self.core.lock();
        if !core.idle_timer.take_fired(generation) || core.state != ProcessState::Idle {
            return;
        }
        log::info!(
            "Agent idle for {:?}, shutting down: pid={:?}",
            self.config.idle_timeout(),
            core.pid
        );
        self.terminate_locked(core, Termination::IdleTimeout, Signal::Graceful);
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    fn terminate(&self, reason: Termination, signal: Signal) -> bool {
        let core = self.core.lock();
        self.terminate_locked(core, reason, signal)
    }

    fn terminate_locked(
        &self,
        mut core: MutexGuard<'_, Core>,
        reason: Termination,
        signal: Signal,
    ) -> bool {
        if core.state == ProcessState::Dead {
            return false;
        }
        log::info!(
            "Terminating agent: reason={}, signal={:?}, pid={:?}, state={}",
            reason,
            signal,
            core.pid,
            core.state
        );

        core.state = ProcessState::Dead;
        core.hang_timer.cancel();
        core.idle_timer.cancel();
        core.stdin = None;
        if let Some(mut turn) = core.turn.take() {
            turn.fail(reason.turn_error());
        }
        let kill_tx = core.kill_tx.clone();
        drop(core);

        let Some(kill_tx) = kill_tx else {
            // Never launched: nothing to reap.
            self.exited.send_replace(true);
            return true;
        };
        match signal {
            Signal::Force => {
                let _ = kill_tx.send(KillRequest::Force);
            }
            Signal::Graceful => {
                let _ = kill_tx.send(KillRequest::Interrupt);
                let grace = self.config.kill_grace();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    // No-op if the process already exited.
                    let _ = kill_tx.send(KillRequest::Force);
                });
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Input
    // -----------------------------------------------------------------------

    async fn write_turn(self: Arc<Self>, mut stdin: ChildStdin, line: String, turn_id: String) {
        let result = write_stdin_line(&mut stdin, &line).await;

        let mut core = self.core.lock();
        match result {
            Ok(()) => {
                if core.state != ProcessState::Dead {
                    core.stdin = Some(stdin);
                }
            }
            Err(err) => {
                drop(stdin);
                let reason = Termination::WriteFailed(err.to_string());
                log::warn!("Turn {} aborted: {}", turn_id, EngineError::Write(err));
                self.terminate_locked(core, reason, Signal::Force);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Output
    // -----------------------------------------------------------------------

    async fn read_stdout(self: Arc<Self>, mut stdout: ChildStdout, closed: oneshot::Sender<()>) {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => self.on_stdout(&buf[..n]),
                Err(err) => {
                    log::warn!("Error reading agent stdout: {}", err);
                    break;
                }
            }
        }
        self.on_stdout_closed();
        let _ = closed.send(());
    }

    async fn read_stderr(self: Arc<Self>, mut stderr: ChildStderr) {
        let mut lines = LineBuffer::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stderr.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let complete = lines.push(&buf[..n]);
                    self.on_stderr(complete);
                }
                Err(err) => {
                    log::debug!("Error reading agent stderr: {}", err);
                    break;
                }
            }
        }
        self.on_stderr(lines.take_remainder().into_iter().collect());
    }

    fn on_stdout(self: &Arc<Self>, chunk: &[u8]) {
        let mut core = self.core.lock();
        if core.state == ProcessState::Busy {
            self.arm_hang_timer(&mut core);
        }
        for line in core.lines.push(chunk) {
            self.handle_line(&mut core, &line);
        }
    }

    fn on_stdout_closed(self: &Arc<Self>) {
        let mut core = self.core.lock();
        if let Some(rest) = core.lines.take_remainder() {
            self.handle_line(&mut core, &rest);
        }
    }

    fn on_stderr(self: &Arc<Self>, lines: Vec<String>) {
        let mut core = self.core.lock();
        if core.state == ProcessState::Busy {
            self.arm_hang_timer(&mut core);
        }
        for line in lines {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            log::debug!("[agent stderr] {}", line);
            if let Some(turn) = core.turn.as_ref() {
                turn.emit(EngineEvent::LogLine {
                    stream: LogStream::Stderr,
                    line: line.to_string(),
                });
            }
        }
    }

    fn handle_line(self: &Arc<Self>, core: &mut Core, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some(record) = self.decoder.parse_line(line) else {
            return;
        };
        if core.turn.is_none() {
            log::debug!(
                "Dropping agent record outside a turn: type={:?}",
                record_type(&record)
            );
            return;
        }
        if record_type(&record) == Some(RESULT_RECORD) {
            self.complete_turn(core, &record);
            return;
        }

        let Some(turn) = core.turn.as_mut() else {
            return;
        };

        for part in self.decoder.decode_record(&record) {
            match part {
                RecordPart::Text(text) => turn.push_text(&text),
                RecordPart::ToolUse(tool) => turn.start_tool(tool),
                RecordPart::ToolResult(id) => turn.end_tool(&id),
                RecordPart::Image(image) => turn.push_image(image),
            }
        }
    }

    fn complete_turn(self: &Arc<Self>, core: &mut Core, record: &Value) {
        let Some(mut turn) = core.turn.take() else {
            return;
        };
        turn.flush_text();

        let mut result_text = self.decoder.extract_result_text(record);
        if let Some(content) = self.decoder.extract_result_content_blocks(record) {
            for image in content.images {
                turn.push_image(image);
            }
            if result_text.is_none() {
                result_text = content.text;
            }
        }

        let text = result_text
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| turn.merged().trim().to_string());
        let text = self.decoder.strip_tool_markup(&text).trim().to_string();

        match self.decoder.extract_result_error(record) {
            Some(message) => {
                log::info!("Agent reported a failed turn: turn={}, {}", turn.id, message);
                turn.emit(EngineEvent::Error { message });
            }
            None if !text.is_empty() => turn.emit(EngineEvent::TextFinal { text }),
            None => {}
        }
        turn.finish();
        log::debug!("Turn completed: id={}", turn.id);

        core.hang_timer.cancel();
        if core.state == ProcessState::Busy {
            core.state = ProcessState::Idle;
            self.arm_idle_timer(core);
        }
    }

    // -----------------------------------------------------------------------
    // Exit
    // -----------------------------------------------------------------------

    async fn watch_exit(
        self: Arc<Self>,
        mut child: Child,
        mut kill_rx: mpsc::UnboundedReceiver<KillRequest>,
        stdout_closed: oneshot::Receiver<()>,
    ) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(request) = kill_rx.recv() => match request {
                    KillRequest::Interrupt => send_interrupt(&mut child),
                    KillRequest::Force => {
                        if let Err(err) = child.start_kill() {
                            log::debug!("Kill request failed: {}", err);
                        }
                    }
                },
            }
        };

        // Let a trailing result record end its turn normally before the exit
        // is treated as a crash.
        let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_closed).await;
        self.on_exit(status);
    }

    fn on_exit(&self, status: std::io::Result<ExitStatus>) {
        let mut core = self.core.lock();
        match &status {
            Ok(status) => log::info!(
                "Agent process exited ({}): pid={:?}",
                format_exit_status(status),
                core.pid
            ),
            Err(err) => log::warn!("Failed to wait for agent process: pid={:?}, {}", core.pid, err),
        }

        core.state = ProcessState::Dead;
        core.hang_timer.cancel();
        core.idle_timer.cancel();
        core.stdin = None;
        if let Some(mut turn) = core.turn.take() {
            log::warn!("Agent exited mid-turn: turn={}", turn.id);
            turn.fail("process exited unexpectedly");
        }
        drop(core);

        self.exited.send_replace(true);
        let hook = self.cleanup.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

/// Write one line to the agent's stdin and flush it.
async fn write_stdin_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

#[cfg(unix)]
fn send_interrupt(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: `pid` is our own child and has not been reaped, so it cannot
    // refer to a recycled process.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc != 0 {
        log::debug!(
            "Failed to interrupt agent: pid={}, {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn send_interrupt(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        log::debug!("Kill request failed: {}", err);
    }
}
