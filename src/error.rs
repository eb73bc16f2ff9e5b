use crate::terminal::TerminalId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Terminal {0} no longer exists; its process is detached")]
    DetachedProcess(TerminalId),

    #[error("Terminal {0} is busy with another command")]
    SessionBusy(TerminalId),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Terminal not found for ID: {0}")]
    TerminalNotFound(TerminalId),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),
}

impl TerminalError {
    /// Whether the error ended a run before the OS process existed.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, TerminalError::Spawn { .. })
    }
}
