//! Runs shell commands as child processes, streams their output to push and pull
//! consumers, tracks whether output is actively flowing, and tears down whole
//! process trees on abort.

pub mod config;
pub mod error;
pub mod terminal;

pub use config::Config;
pub use error::TerminalError;
pub use terminal::{
    CliTerminal, CliTerminalProcess, ExitDetails, ProcessHandle, ProcessPhase, Terminal,
    TerminalCallbacks, TerminalId, TerminalKind, TerminalProcess, TerminalRegistry,
};
