use super::process::CliTerminalProcess;
use super::process_tree::ProcessTreeTerminator;
use super::registry::{RegistryInner, TerminalInfo, TerminalRef};
use super::{ProcessHandle, Terminal, TerminalCallbacks, TerminalId, TerminalKind, TerminalProcess};
use crate::config::Config;
use crate::error::TerminalError;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

type OutcomeSender = Arc<Mutex<Option<oneshot::Sender<Result<(), TerminalError>>>>>;

/// Standalone terminal: runs commands as child processes of this program.
///
/// Never closes on its own. Runs at most one command at a time; a second
/// `run_command` while busy is rejected with [`TerminalError::SessionBusy`].
pub struct CliTerminal {
    id: TerminalId,
    cwd: PathBuf,
    config: Arc<Config>,
    terminator: ProcessTreeTerminator,
    registry: Weak<RegistryInner>,
    busy: AtomicBool,
    running: AtomicBool,
    process: Mutex<Option<Arc<CliTerminalProcess>>>,
    completed: Mutex<VecDeque<Arc<CliTerminalProcess>>>,
}

impl std::fmt::Debug for CliTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliTerminal")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("busy", &self.is_busy())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CliTerminal {
    pub(crate) fn new(
        id: TerminalId,
        cwd: PathBuf,
        config: Arc<Config>,
        terminator: ProcessTreeTerminator,
        registry: Weak<RegistryInner>,
    ) -> Self {
        Self {
            id,
            cwd,
            config,
            terminator,
            registry,
            busy: AtomicBool::new(false),
            running: AtomicBool::new(false),
            process: Mutex::new(None),
            completed: Mutex::new(VecDeque::new()),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<CliTerminalProcess>>> {
        self.process.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn completed_queue(&self) -> MutexGuard<'_, VecDeque<Arc<CliTerminalProcess>>> {
        self.completed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The process of the command in flight, if any.
    pub fn process(&self) -> Option<Arc<CliTerminalProcess>> {
        self.current().clone()
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub(crate) fn shell_execution_failed(&self, process: &CliTerminalProcess) {
        self.release_current(process);
        self.set_running(false);
        self.set_busy(false);
    }

    fn release_current(&self, process: &CliTerminalProcess) {
        let mut current = self.current();
        if current
            .as_ref()
            .map_or(false, |running| std::ptr::eq(Arc::as_ptr(running), process))
        {
            *current = None;
        }
    }

    /// Called by the process once it exited, before its `completed` listeners run.
    pub(crate) fn shell_execution_complete(&self, process: &Arc<CliTerminalProcess>) {
        if process.has_unretrieved_output() {
            self.completed_queue().push_back(process.clone());
        }
        self.release_current(process);
        self.set_busy(false);
        debug!(terminal_id = self.id, "Terminal is idle");
    }

    /// Aborts the command in flight. No-op when idle.
    pub fn abort(&self) {
        if let Some(process) = self.process() {
            process.abort();
        }
    }

    /// Output not yet pulled: finished processes first, oldest first, including their
    /// last partial line, then the complete lines of the running process.
    pub fn get_unretrieved_output(&self) -> String {
        let finished: Vec<Arc<CliTerminalProcess>> = self.completed_queue().drain(..).collect();
        let mut output: String = finished.iter().map(|p| p.get_remaining_output()).collect();
        if let Some(process) = self.process() {
            output.push_str(&process.get_unretrieved_output());
        }
        output
    }

    pub fn has_unretrieved_output(&self) -> bool {
        let finished = self
            .completed_queue()
            .iter()
            .any(|p| p.has_unretrieved_output());
        finished
            || self
                .process()
                .map_or(false, |process| process.has_unretrieved_output())
    }

    pub fn info(&self) -> TerminalInfo {
        let process = self.process();
        TerminalInfo {
            id: self.id,
            kind: self.kind(),
            cwd: self.cwd.clone(),
            busy: self.is_busy(),
            running: self.is_running(),
            command: process.as_ref().map(|p| p.command()),
            pid: process.as_ref().and_then(|p| p.pid()),
            start_time_iso: process
                .as_ref()
                .and_then(|p| p.started_at())
                .map(|at| at.to_rfc3339()),
            runtime_ms: process
                .as_ref()
                .and_then(|p| p.runtime())
                .map(|runtime| runtime.as_millis()),
        }
    }
}

fn send_outcome(sender: &OutcomeSender, outcome: Result<(), TerminalError>) {
    let sender = sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(sender) = sender {
        // The caller may have dropped the handle; the run goes on regardless.
        let _ = sender.send(outcome);
    }
}

impl Terminal for CliTerminal {
    type Process = CliTerminalProcess;

    fn id(&self) -> TerminalId {
        self.id
    }

    fn kind(&self) -> TerminalKind {
        TerminalKind::Cli
    }

    fn cwd(&self) -> &Path {
        &self.cwd
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        false
    }

    /// Starts `command` on the current tokio runtime and returns at once.
    #[instrument(skip(self, callbacks), fields(terminal_id = self.id))]
    fn run_command(
        &self,
        command: &str,
        callbacks: Arc<dyn TerminalCallbacks>,
    ) -> Result<ProcessHandle<CliTerminalProcess>, TerminalError> {
        if self.config.is_command_blocked(command) {
            warn!(command, "Command blocked");
            return Err(TerminalError::CommandBlocked(command.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TerminalError::ProcessError(format!("no async runtime: {}", e)))?;
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(command, "Rejected command, terminal busy");
            return Err(TerminalError::SessionBusy(self.id));
        }
        // A removed terminal could never be marked idle again.
        let terminal_ref = TerminalRef::new(self.id, self.registry.clone());
        if let Err(detached) = terminal_ref.get() {
            self.set_busy(false);
            return Err(detached);
        }

        let process = CliTerminalProcess::new(
            terminal_ref,
            self.config.clone(),
            self.terminator.clone(),
        );
        *self.current() = Some(process.clone());

        let cb = callbacks.clone();
        process.on_line(move |line, p| cb.on_line(line, p));
        let cb = callbacks.clone();
        process.once_completed(move |output, p| cb.on_completed(output, p));
        let cb = callbacks.clone();
        process.once_shell_execution_started(move |pid, p| cb.on_shell_execution_started(pid, p));
        let cb = callbacks;
        process.once_shell_execution_complete(move |details, p| {
            cb.on_shell_execution_complete(details, p)
        });

        let (tx, rx) = oneshot::channel();
        let sender: OutcomeSender = Arc::new(Mutex::new(Some(tx)));
        let on_continue = sender.clone();
        process.once_continue(move || send_outcome(&on_continue, Ok(())));

        let runner = process.clone();
        let command = command.to_string();
        runtime.spawn(async move {
            if let Err(e) = runner.run(&command).await {
                debug!(error = %e, "Command run failed");
                send_outcome(&sender, Err(e));
            }
        });

        Ok(ProcessHandle::new(process, rx))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::terminal::{interrupt, ExitDetails, ProcessPhase, TerminalRegistry};
    use std::time::Duration;

    fn quiet_config() -> Arc<Config> {
        Arc::new(Config {
            mirror_output: false,
            line_flush_interval: Duration::from_millis(20),
            ..Config::default()
        })
    }

    struct Silent;
    impl TerminalCallbacks for Silent {}

    /// Records whether the terminal was still busy when `completed` fired.
    struct BusyProbe {
        terminal: Arc<CliTerminal>,
        busy_at_completion: Mutex<Option<bool>>,
        exit: Mutex<Option<ExitDetails>>,
    }

    impl TerminalCallbacks for BusyProbe {
        fn on_completed(&self, _output: &str, _process: &CliTerminalProcess) {
            *self.busy_at_completion.lock().unwrap() = Some(self.terminal.is_busy());
        }

        fn on_shell_execution_complete(&self, details: &ExitDetails, _process: &CliTerminalProcess) {
            *self.exit.lock().unwrap() = Some(details.clone());
        }
    }

    #[tokio::test]
    async fn busy_is_cleared_before_completed_callbacks() {
        let registry = TerminalRegistry::new(quiet_config());
        let terminal = registry.create_terminal(std::env::temp_dir());
        let probe = Arc::new(BusyProbe {
            terminal: terminal.clone(),
            busy_at_completion: Mutex::new(None),
            exit: Mutex::new(None),
        });

        let handle = terminal.run_command("exit 3", probe.clone()).unwrap();
        assert!(terminal.is_busy());
        handle.await.unwrap();

        assert_eq!(*probe.busy_at_completion.lock().unwrap(), Some(false));
        assert_eq!(probe.exit.lock().unwrap().as_ref().unwrap().exit_code, Some(3));
        assert!(!terminal.is_running());
        assert!(terminal.process().is_none());
    }

    #[tokio::test]
    async fn failed_spawn_releases_current_process() {
        let registry = TerminalRegistry::new(quiet_config());
        let terminal = registry.create_terminal("/definitely/not/here");

        let handle = terminal.run_command("echo hi", Arc::new(Silent)).unwrap();
        assert!(terminal.process().is_some());
        assert!(handle.await.unwrap_err().is_spawn_failure());

        assert!(terminal.process().is_none());
        let info = terminal.info();
        assert!(info.command.is_none());
        assert!(info.pid.is_none());
        assert!(!info.busy);
    }

    #[tokio::test]
    async fn removed_terminal_refuses_commands_and_stays_idle() {
        let registry = TerminalRegistry::new(quiet_config());
        let terminal = registry.create_terminal(std::env::temp_dir());
        registry.remove(terminal.id()).unwrap();

        let err = terminal.run_command("echo hi", Arc::new(Silent)).unwrap_err();
        assert!(matches!(err, TerminalError::DetachedProcess(id) if id == terminal.id()));
        assert!(!terminal.is_busy());
        assert!(terminal.process().is_none());
    }

    #[tokio::test]
    async fn interrupt_handler_is_released_after_each_run() {
        let registry = TerminalRegistry::new(quiet_config());
        let terminal = registry.create_terminal(std::env::temp_dir());

        let mut ids = Vec::new();
        for _ in 0..2 {
            let handle = terminal.run_command("echo hi", Arc::new(Silent)).unwrap();
            let process = handle.process().clone();
            handle.await.unwrap();
            let id = process.interrupt_handler_id().unwrap();
            assert!(!interrupt::is_installed(id));
            ids.push(id);
        }
        assert_ne!(ids[0], ids[1]);
    }

    #[tokio::test]
    async fn aborted_run_releases_interrupt_handler() {
        let registry = TerminalRegistry::new(quiet_config());
        let terminal = registry.create_terminal(std::env::temp_dir());

        let handle = terminal.run_command("sleep 30", Arc::new(Silent)).unwrap();
        let process = handle.process().clone();
        while process.phase() != ProcessPhase::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let id = process.interrupt_handler_id().unwrap();
        assert!(interrupt::is_installed(id));

        terminal.abort();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!interrupt::is_installed(id));
        assert_eq!(process.phase(), ProcessPhase::Aborted);
    }

    #[tokio::test]
    async fn completed_output_is_pulled_before_current() {
        let registry = TerminalRegistry::new(quiet_config());
        let terminal = registry.create_terminal(std::env::temp_dir());

        let handle = terminal
            .run_command("printf 'first\\npartial'", Arc::new(Silent))
            .unwrap();
        handle.continue_in_background();
        handle.await.unwrap();
        while terminal.is_busy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(terminal.has_unretrieved_output());
        assert_eq!(terminal.get_unretrieved_output(), "first\npartial");
        assert!(!terminal.has_unretrieved_output());
        assert_eq!(terminal.get_unretrieved_output(), "");
    }

    #[tokio::test]
    async fn info_reports_running_command() {
        let registry = TerminalRegistry::new(quiet_config());
        let terminal = registry.create_terminal(std::env::temp_dir());

        let handle = terminal.run_command("sleep 30", Arc::new(Silent)).unwrap();
        while handle.phase() != ProcessPhase::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let info = terminal.info();
        assert!(info.busy);
        assert!(info.running);
        assert_eq!(info.command.as_deref(), Some("sleep 30"));
        assert!(info.pid.is_some());
        assert!(info.start_time_iso.is_some());

        handle.abort();
        handle.await.unwrap();
    }
}
