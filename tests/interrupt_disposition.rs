#![cfg(unix)]

//! The interrupt hookup must only matter while a command runs. The scenario runs in a
//! re-executed copy of this test binary, since its expected outcome is being killed
//! by SIGINT.

use nix::sys::signal::{raise, Signal};
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use terminal_exec::{Config, ProcessPhase, Terminal, TerminalCallbacks, TerminalRegistry};

const SCENARIO_ENV: &str = "TERMINAL_EXEC_INTERRUPT_SCENARIO";
const TEST_NAME: &str = "interrupt_aborts_running_command_and_is_default_when_idle";
const ABORTED_MARKER: &str = "running command aborted by interrupt";

struct Silent;
impl TerminalCallbacks for Silent {}

#[test]
fn interrupt_aborts_running_command_and_is_default_when_idle() {
    if std::env::var_os(SCENARIO_ENV).is_some() {
        run_scenario();
        return;
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([TEST_NAME, "--exact", "--nocapture", "--test-threads=1"])
        .env(SCENARIO_ENV, "1")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains(ABORTED_MARKER), "stdout: {}", stdout);
    assert_eq!(
        output.status.signal(),
        Some(Signal::SIGINT as i32),
        "idle interrupt did not terminate the host: {:?}",
        output.status
    );
}

fn run_scenario() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async {
        let config = Arc::new(Config {
            mirror_output: false,
            ..Config::default()
        });
        let registry = TerminalRegistry::new(config);
        let terminal = registry.create_terminal(std::env::temp_dir());

        let handle = terminal.run_command("sleep 30", Arc::new(Silent)).unwrap();
        let process = handle.process().clone();
        while process.phase() != ProcessPhase::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // give the listener task a turn to register with the OS
        tokio::time::sleep(Duration::from_millis(100)).await;

        raise(Signal::SIGINT).unwrap();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(process.phase(), ProcessPhase::Aborted);
        assert!(!terminal.is_busy());
        println!("{}", ABORTED_MARKER);

        raise(Signal::SIGINT).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    });
    // Still alive: the idle interrupt was swallowed and the parent sees a clean exit.
}
