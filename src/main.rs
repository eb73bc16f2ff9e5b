use anyhow::{Context, Result};
use std::sync::Arc;
use terminal_exec::{
    CliTerminalProcess, Config, ExitDetails, Terminal, TerminalCallbacks, TerminalRegistry,
};
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("terminal_exec={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// Logs lifecycle events; the output itself is mirrored to stdout by the process.
struct LoggingCallbacks;

impl TerminalCallbacks for LoggingCallbacks {
    fn on_line(&self, line: &str, process: &CliTerminalProcess) {
        tracing::trace!(terminal_id = process.terminal_id(), bytes = line.len(), "Line batch");
    }

    fn on_shell_execution_started(&self, pid: Option<u32>, process: &CliTerminalProcess) {
        tracing::debug!(terminal_id = process.terminal_id(), pid = ?pid, "Started");
    }

    fn on_shell_execution_complete(&self, details: &ExitDetails, process: &CliTerminalProcess) {
        tracing::debug!(
            terminal_id = process.terminal_id(),
            exit_code = ?details.exit_code,
            signal = ?details.signal_name,
            "Exited"
        );
    }

    fn on_completed(&self, output: &str, process: &CliTerminalProcess) {
        tracing::debug!(terminal_id = process.terminal_id(), bytes = output.len(), "Completed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;
    setup_logging(&config.log_level);

    let command = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if command.trim().is_empty() {
        anyhow::bail!("usage: terminal-exec <command...>");
    }

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting terminal-exec");
    tracing::debug!("Loaded configuration: {:?}", config);

    let config = Arc::new(config);
    let registry = TerminalRegistry::new(config.clone());
    let terminal = registry.get_or_create_terminal(&config.default_cwd);

    let handle = terminal.run_command(&command, Arc::new(LoggingCallbacks))?;
    let process = handle.process().clone();
    handle.await?;

    let details = process.exit_details().unwrap_or_default();
    tracing::info!(
        terminal_id = terminal.id(),
        details = %serde_json::to_string(&details)?,
        "Command finished"
    );
    std::process::exit(details.shell_status());
}
