use super::buffer::{ChunkDecoder, OutputBuffer};
use super::hot::HotStreamDetector;
use super::interrupt;
use super::process_tree::ProcessTreeTerminator;
use super::registry::TerminalRef;
use super::{ExitDetails, ProcessPhase, Terminal, TerminalId, TerminalProcess};
use crate::config::Config;
use crate::error::TerminalError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

const READ_CHUNK_SIZE: usize = 8192;

type LineListener = Arc<dyn Fn(&str, &CliTerminalProcess) + Send + Sync>;
type StartedListener = Box<dyn FnOnce(Option<u32>, &CliTerminalProcess) + Send>;
type ExecutionCompleteListener = Box<dyn FnOnce(&ExitDetails, &CliTerminalProcess) + Send>;
type CompletedListener = Box<dyn FnOnce(&str, &CliTerminalProcess) + Send>;
type ContinueListener = Box<dyn FnOnce() + Send>;
type ErrorListener = Box<dyn FnOnce(&TerminalError) + Send>;

#[derive(Default)]
struct Listeners {
    line: Vec<LineListener>,
    started: Vec<StartedListener>,
    execution_complete: Vec<ExecutionCompleteListener>,
    completed: Vec<CompletedListener>,
    continued: Vec<ContinueListener>,
    error: Vec<ErrorListener>,
}

struct ProcessState {
    command: String,
    pid: Option<u32>,
    phase: ProcessPhase,
    buffer: OutputBuffer,
    listening: bool,
    aborted: bool,
    last_emit: Option<Instant>,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    exit: Option<ExitDetails>,
    interrupt_id: Option<u64>,
}

/// One command invocation in a standalone terminal, from spawn to exit.
pub struct CliTerminalProcess {
    me: Weak<CliTerminalProcess>,
    terminal: TerminalRef,
    config: Arc<Config>,
    terminator: ProcessTreeTerminator,
    hot: HotStreamDetector,
    state: Mutex<ProcessState>,
    listeners: Mutex<Listeners>,
}

impl fmt::Debug for CliTerminalProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("CliTerminalProcess")
            .field("terminal_id", &self.terminal.id())
            .field("command", &state.command)
            .field("pid", &state.pid)
            .field("phase", &state.phase)
            .finish_non_exhaustive()
    }
}

impl CliTerminalProcess {
    pub(crate) fn new(
        terminal: TerminalRef,
        config: Arc<Config>,
        terminator: ProcessTreeTerminator,
    ) -> Arc<Self> {
        let hot = HotStreamDetector::new(config.hot_timeout, config.hot_timeout_compiling);
        Arc::new_cyclic(|me| CliTerminalProcess {
            me: me.clone(),
            terminal,
            config,
            terminator,
            hot,
            state: Mutex::new(ProcessState {
                command: String::new(),
                pid: None,
                phase: ProcessPhase::Created,
                buffer: OutputBuffer::new(),
                listening: true,
                aborted: false,
                last_emit: None,
                started: None,
                started_at: None,
                exit: None,
                interrupt_id: None,
            }),
            listeners: Mutex::new(Listeners::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn terminal_id(&self) -> TerminalId {
        self.terminal.id()
    }

    pub fn pid(&self) -> Option<u32> {
        self.state().pid
    }

    pub fn phase(&self) -> ProcessPhase {
        self.state().phase
    }

    pub fn full_output(&self) -> String {
        self.state().buffer.full_output().to_string()
    }

    pub fn exit_details(&self) -> Option<ExitDetails> {
        self.state().exit.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.state().listening
    }

    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state().started_at
    }

    /// Time since spawn, if the OS process was ever started.
    pub fn runtime(&self) -> Option<Duration> {
        self.state().started.map(|started| started.elapsed())
    }

    pub fn subscribe_hot(&self) -> watch::Receiver<bool> {
        self.hot.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn interrupt_handler_id(&self) -> Option<u64> {
        self.state().interrupt_id
    }

    /// Everything not yet retrieved, trailing partial line included. Meant for
    /// finished processes, whose last line can no longer grow.
    pub fn get_remaining_output(&self) -> String {
        self.state().buffer.take_remaining()
    }

    pub fn on_line<F>(&self, listener: F)
    where
        F: Fn(&str, &CliTerminalProcess) + Send + Sync + 'static,
    {
        self.listeners().line.push(Arc::new(listener));
    }

    pub fn once_shell_execution_started<F>(&self, listener: F)
    where
        F: FnOnce(Option<u32>, &CliTerminalProcess) + Send + 'static,
    {
        self.listeners().started.push(Box::new(listener));
    }

    pub fn once_shell_execution_complete<F>(&self, listener: F)
    where
        F: FnOnce(&ExitDetails, &CliTerminalProcess) + Send + 'static,
    {
        self.listeners().execution_complete.push(Box::new(listener));
    }

    pub fn once_completed<F>(&self, listener: F)
    where
        F: FnOnce(&str, &CliTerminalProcess) + Send + 'static,
    {
        self.listeners().completed.push(Box::new(listener));
    }

    pub fn once_continue<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.listeners().continued.push(Box::new(listener));
    }

    pub fn once_error<F>(&self, listener: F)
    where
        F: FnOnce(&TerminalError) + Send + 'static,
    {
        self.listeners().error.push(Box::new(listener));
    }

    // Listeners run without any lock held so they may call back into the process.

    fn emit_line(&self, line: &str) {
        let listeners: Vec<LineListener> = self.listeners().line.clone();
        for listener in listeners {
            listener(line, self);
        }
    }

    fn emit_started(&self, pid: Option<u32>) {
        let listeners = std::mem::take(&mut self.listeners().started);
        for listener in listeners {
            listener(pid, self);
        }
    }

    fn emit_execution_complete(&self, details: &ExitDetails) {
        let listeners = std::mem::take(&mut self.listeners().execution_complete);
        for listener in listeners {
            listener(details, self);
        }
    }

    fn emit_completed(&self, output: &str) {
        let listeners = std::mem::take(&mut self.listeners().completed);
        for listener in listeners {
            listener(output, self);
        }
    }

    fn emit_continue(&self) {
        let listeners = std::mem::take(&mut self.listeners().continued);
        for listener in listeners {
            listener();
        }
    }

    fn emit_error(&self, err: &TerminalError) {
        let listeners = std::mem::take(&mut self.listeners().error);
        for listener in listeners {
            listener(err);
        }
    }

    fn handle_chunk(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let flush = {
            let mut state = self.state();
            if state.aborted {
                return;
            }
            state.buffer.push(text);
            let now = Instant::now();
            let due = state
                .last_emit
                .map_or(true, |at| now.duration_since(at) >= self.config.line_flush_interval);
            if state.listening && due {
                state.last_emit = Some(now);
                Some(state.buffer.take_complete_lines())
            } else {
                None
            }
        };

        if self.config.mirror_output {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes()).and_then(|_| stdout.flush());
        }
        self.hot.touch(text);

        if let Some(lines) = flush.filter(|lines| !lines.is_empty()) {
            self.emit_line(&lines);
        }
    }

    /// Reads both pipes until each reaches end of stream.
    async fn pump_output<O, E>(&self, stdout: Option<O>, stderr: Option<E>)
    where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut stdout_open = stdout.is_some();
        let mut stderr_open = stderr.is_some();
        let mut stdout = stdout;
        let mut stderr = stderr;
        let mut out_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut err_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut out_decoder = ChunkDecoder::default();
        let mut err_decoder = ChunkDecoder::default();

        loop {
            tokio::select! {
                read = read_some(&mut stdout, &mut out_buf), if stdout_open => match read {
                    Ok(0) => {
                        stdout_open = false;
                        self.handle_chunk(&out_decoder.finish());
                    }
                    Ok(n) => self.handle_chunk(&out_decoder.decode(&out_buf[..n])),
                    Err(e) => {
                        warn!(error = %e, "Failed reading stdout");
                        stdout_open = false;
                    }
                },
                read = read_some(&mut stderr, &mut err_buf), if stderr_open => match read {
                    Ok(0) => {
                        stderr_open = false;
                        self.handle_chunk(&err_decoder.finish());
                    }
                    Ok(n) => self.handle_chunk(&err_decoder.decode(&err_buf[..n])),
                    Err(e) => {
                        warn!(error = %e, "Failed reading stderr");
                        stderr_open = false;
                    }
                },
                else => break,
            }
        }
    }

    fn signal_tree(&self, pid: u32) {
        info!(pid, terminal_id = self.terminal.id(), "Aborting command");
        if let Err(e) = self.terminator.interrupt(pid) {
            debug!(pid, error = %e, "Interrupt not delivered to root process");
        }
        let terminator = self.terminator.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || terminator.terminate_descendants(pid));
            }
            Err(_) => {
                terminator.terminate_descendants(pid);
            }
        }
    }

    fn fail(&self, err: TerminalError) -> Result<(), TerminalError> {
        self.hot.stop();
        self.state().phase = ProcessPhase::Errored;
        match self.terminal.get() {
            Ok(terminal) => terminal.shell_execution_failed(self),
            Err(detached) => warn!(error = %detached, "Cannot reset terminal after failed run"),
        }
        self.emit_error(&err);
        Err(err)
    }

    fn finish(&self, details: ExitDetails) {
        let terminal = self.terminal.get();
        match &terminal {
            Ok(terminal) => terminal.set_running(false),
            Err(detached) => warn!(error = %detached, "Process exited after its terminal was removed"),
        }

        let (tail, full_output) = {
            let mut state = self.state();
            let tail = if state.listening {
                state.buffer.take_remaining()
            } else {
                String::new()
            };
            state.phase = if state.aborted {
                ProcessPhase::Aborted
            } else {
                ProcessPhase::Completed
            };
            state.exit = Some(details.clone());
            (tail, state.buffer.full_output().to_string())
        };
        if !tail.is_empty() {
            self.emit_line(&tail);
        }
        self.hot.stop();

        info!(
            terminal_id = self.terminal.id(),
            exit_code = ?details.exit_code,
            signal = ?details.signal_name,
            "Shell execution complete"
        );
        self.emit_execution_complete(&details);
        if let (Ok(terminal), Some(me)) = (&terminal, self.me.upgrade()) {
            terminal.shell_execution_complete(&me);
        }
        self.emit_completed(&full_output);
        self.emit_continue();
    }
}

async fn read_some<R>(reader: &mut Option<R>, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => Ok(0),
    }
}

/// Builds the shell invocation for `command`.
fn shell_command(shell: Option<&str>, command: &str) -> TokioCommand {
    match shell {
        Some(shell_path) => {
            let mut cmd = TokioCommand::new(shell_path);
            let lower = shell_path.to_lowercase();
            if lower.contains("powershell") || lower.contains("pwsh") {
                cmd.arg("-Command");
            } else if lower.ends_with("cmd.exe") || lower == "cmd" {
                cmd.arg("/C");
            } else {
                cmd.arg("-c");
            }
            cmd.arg(command);
            cmd
        }
        None => {
            #[cfg(windows)]
            let mut cmd = {
                let mut cmd = TokioCommand::new("cmd");
                cmd.arg("/C");
                cmd
            };
            #[cfg(not(windows))]
            let mut cmd = {
                let mut cmd = TokioCommand::new("sh");
                cmd.arg("-c");
                cmd
            };
            cmd.arg(command);
            cmd
        }
    }
}

#[async_trait]
impl TerminalProcess for CliTerminalProcess {
    fn command(&self) -> String {
        self.state().command.clone()
    }

    #[instrument(skip(self))]
    async fn run(&self, command: &str) -> Result<(), TerminalError> {
        {
            let mut state = self.state();
            if state.phase != ProcessPhase::Created {
                return Err(TerminalError::ProcessError(format!(
                    "process for '{}' was already started",
                    state.command
                )));
            }
            state.command = command.to_string();
        }

        let cwd = match self.terminal.get() {
            Ok(terminal) => terminal.cwd().to_path_buf(),
            Err(detached) => return self.fail(detached),
        };

        let mut cmd = shell_command(self.config.default_shell.as_deref(), command);
        cmd.current_dir(&cwd)
            .env("LANG", &self.config.locale)
            .env("LC_ALL", &self.config.locale)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so the whole tree can be swept on abort.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(command, cwd = %cwd.display(), "Spawning command");
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(error = %source, command, "Failed to spawn command");
                return self.fail(TerminalError::Spawn {
                    command: command.to_string(),
                    source,
                });
            }
        };

        let pid = child.id();
        let abort_requested = {
            let mut state = self.state();
            state.pid = pid;
            state.phase = ProcessPhase::Running;
            state.started = Some(Instant::now());
            state.started_at = Some(Utc::now());
            state.aborted
        };
        match self.terminal.get() {
            Ok(terminal) => terminal.set_running(true),
            Err(detached) => warn!(error = %detached, "Command started for a removed terminal"),
        }
        self.hot.touch("");
        info!(pid = ?pid, command, "Shell execution started");
        self.emit_started(pid);

        let me = self.me.clone();
        let interrupt_guard = interrupt::install(move || {
            if let Some(process) = me.upgrade() {
                process.abort();
            }
        });
        self.state().interrupt_id = Some(interrupt_guard.id());

        if abort_requested {
            if let Some(pid) = pid {
                self.signal_tree(pid);
            }
        }

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.pump_output(stdout, stderr).await;
        let status = child.wait().await;
        drop(interrupt_guard);
        debug!(handler_id = ?self.state().interrupt_id, "Interrupt handler released");

        match status {
            Ok(status) => {
                self.finish(ExitDetails::from_status(status));
                Ok(())
            }
            Err(e) => {
                error!(error = %e, pid = ?pid, "Failed to wait for command");
                self.fail(TerminalError::Io(e))
            }
        }
    }

    fn continue_in_background(&self) {
        self.state().listening = false;
        self.listeners().line.clear();
        debug!(terminal_id = self.terminal.id(), "Line delivery detached");
        self.emit_continue();
    }

    fn abort(&self) {
        let pid = {
            let mut state = self.state();
            if state.aborted {
                return;
            }
            state.aborted = true;
            if state.phase != ProcessPhase::Running {
                debug!(phase = ?state.phase, "Abort recorded before the process is running");
                return;
            }
            state.pid
        };
        if let Some(pid) = pid {
            self.signal_tree(pid);
        }
    }

    fn is_hot(&self) -> bool {
        self.hot.is_hot()
    }

    fn has_unretrieved_output(&self) -> bool {
        self.state().buffer.has_unretrieved()
    }

    fn get_unretrieved_output(&self) -> String {
        self.state().buffer.take_complete_lines()
    }
}
