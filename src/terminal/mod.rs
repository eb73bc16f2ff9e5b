//! Command execution engine.
//!
//! A [`CliTerminal`] is a long-lived session bound to one working directory. Each
//! command it runs gets a fresh [`CliTerminalProcess`], which owns the OS process,
//! accumulates its output and reports lifecycle events to the registered callbacks.

pub mod buffer;
pub mod hot;
pub mod interrupt;
pub mod process;
pub mod process_tree;
pub mod registry;
pub mod session;

pub use buffer::{ChunkDecoder, OutputBuffer};
pub use hot::HotStreamDetector;
pub use process::CliTerminalProcess;
pub use process_tree::{KillReport, OsSignaller, ProcessSignaller, ProcessTree, ProcessTreeTerminator};
pub use registry::{TerminalInfo, TerminalRegistry};
pub use session::CliTerminal;

use crate::error::TerminalError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub type TerminalId = u32;

/// Execution backend a terminal belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalKind {
    /// Standalone child-process execution.
    Cli,
    /// IDE-integrated terminal, implemented outside this crate.
    Ide,
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalKind::Cli => write!(f, "cli"),
            TerminalKind::Ide => write!(f, "ide"),
        }
    }
}

/// How a process ended. `exit_code` is absent when a signal terminated it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub core_dumped: bool,
}

impl ExitDetails {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            let signal = status.signal();
            ExitDetails {
                exit_code: status.code(),
                signal,
                signal_name: signal.map(signal_name),
                core_dumped: status.core_dumped(),
            }
        }
        #[cfg(not(unix))]
        {
            ExitDetails {
                exit_code: status.code(),
                ..Default::default()
            }
        }
    }

    /// Shell-style status: the exit code, or 128 plus the signal number.
    pub fn shell_status(&self) -> i32 {
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signal))
}

/// Lifecycle of a single process. `Aborted` is only reached from `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessPhase {
    Created,
    Running,
    Completed,
    Errored,
    Aborted,
}

/// Consumer hooks wired by [`Terminal::run_command`]. Every method defaults to a no-op.
pub trait TerminalCallbacks: Send + Sync + 'static {
    fn on_line(&self, _line: &str, _process: &CliTerminalProcess) {}
    fn on_completed(&self, _output: &str, _process: &CliTerminalProcess) {}
    fn on_shell_execution_started(&self, _pid: Option<u32>, _process: &CliTerminalProcess) {}
    fn on_shell_execution_complete(&self, _details: &ExitDetails, _process: &CliTerminalProcess) {}
}

/// Operations every execution backend's process offers.
#[async_trait]
pub trait TerminalProcess: Send + Sync {
    fn command(&self) -> String;

    /// Spawns `command` and drives it until the OS process closes.
    async fn run(&self, command: &str) -> Result<(), TerminalError>;

    /// Stops push delivery of lines; the OS process keeps running.
    fn continue_in_background(&self);

    /// Interrupts the process and force-kills its descendants. Idempotent.
    fn abort(&self);

    fn is_hot(&self) -> bool;

    fn has_unretrieved_output(&self) -> bool;

    /// Complete lines not yet retrieved; empty when no newline is pending.
    fn get_unretrieved_output(&self) -> String;
}

/// A session that runs one command at a time.
pub trait Terminal: Send + Sync {
    type Process: TerminalProcess;

    fn id(&self) -> TerminalId;
    fn kind(&self) -> TerminalKind;
    fn cwd(&self) -> &Path;
    fn is_busy(&self) -> bool;
    fn is_running(&self) -> bool;
    fn is_closed(&self) -> bool;

    fn run_command(
        &self,
        command: &str,
        callbacks: Arc<dyn TerminalCallbacks>,
    ) -> Result<ProcessHandle<Self::Process>, TerminalError>;
}

/// The running process together with its completion.
///
/// Dereferences to the process and resolves once it signals `continue` (completion or
/// an explicit switch to background mode), or fails when the run errors.
pub struct ProcessHandle<P> {
    process: Arc<P>,
    outcome: oneshot::Receiver<Result<(), TerminalError>>,
}

impl<P> ProcessHandle<P> {
    pub(crate) fn new(
        process: Arc<P>,
        outcome: oneshot::Receiver<Result<(), TerminalError>>,
    ) -> Self {
        Self { process, outcome }
    }

    pub fn process(&self) -> &Arc<P> {
        &self.process
    }
}

impl<P: fmt::Debug> fmt::Debug for ProcessHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

impl<P> Deref for ProcessHandle<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.process
    }
}

impl<P> Future for ProcessHandle<P> {
    type Output = Result<(), TerminalError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.outcome).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(TerminalError::ProcessError(
                    "process finished without reporting an outcome".to_string(),
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_details_serialize_without_absent_fields() {
        let normal = ExitDetails {
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&normal).unwrap(), r#"{"exitCode":0}"#);

        let killed = ExitDetails {
            exit_code: None,
            signal: Some(2),
            signal_name: Some("SIGINT".to_string()),
            core_dumped: false,
        };
        assert_eq!(
            serde_json::to_string(&killed).unwrap(),
            r#"{"signal":2,"signalName":"SIGINT"}"#
        );
        assert_eq!(killed.shell_status(), 130);
        assert_eq!(normal.shell_status(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn signal_names_follow_convention() {
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(2), "SIGINT");
    }
}
