use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BLOCKED_COMMANDS: &str =
    "sudo,su,mkfs,fdisk,dd,reboot,shutdown,poweroff,halt,format,mount,umount,passwd,adduser,useradd,usermod,groupadd";

#[derive(Debug, Clone)]
pub struct Config {
    pub default_cwd: PathBuf,
    pub blocked_commands: Vec<Regex>,
    pub default_shell: Option<String>,
    pub log_level: String,
    /// Minimum spacing between two `line` events while listening.
    pub line_flush_interval: Duration,
    pub hot_timeout: Duration,
    pub hot_timeout_compiling: Duration,
    /// Copy every chunk of child output to our own stdout.
    pub mirror_output: bool,
    pub locale: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            blocked_commands: compile_blocked_commands(DEFAULT_BLOCKED_COMMANDS)
                .unwrap_or_default(),
            default_shell: None,
            log_level: "info".to_string(),
            line_flush_interval: Duration::from_millis(500),
            hot_timeout: Duration::from_millis(2000),
            hot_timeout_compiling: Duration::from_millis(15000),
            mirror_output: true,
            locale: "en_US.UTF-8".to_string(),
        }
    }
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

// Match command if it's the first word, possibly preceded by env vars
fn compile_blocked_commands(list: &str) -> Result<Vec<Regex>> {
    list.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            Regex::new(&format!(
                r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)",
                regex::escape(s)
            ))
            .context(format!("Invalid regex for blocked command: {}", s))
        })
        .collect()
}

fn parse_millis(raw: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match raw {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .context(format!("Invalid {}", key)),
        None => Ok(default),
    }
}

fn parse_bool(raw: Option<String>, key: &str, default: bool) -> Result<bool> {
    match raw {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(anyhow::anyhow!("Invalid {}: {}", key, other)),
        },
        None => Ok(default),
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Config::default();

        let default_cwd = match get("TERMINAL_CWD") {
            Some(cwd_str) => {
                let expanded = expand_tilde(&cwd_str);
                let cwd = dunce::canonicalize(&expanded)
                    .context(format!("Failed to canonicalize TERMINAL_CWD: {}", cwd_str))?;
                if !cwd.is_dir() {
                    anyhow::bail!("TERMINAL_CWD is not a valid directory: {:?}", cwd);
                }
                cwd
            }
            None => defaults.default_cwd,
        };

        let blocked_commands = match lookup("BLOCKED_COMMANDS") {
            Some(list) => compile_blocked_commands(&list)?,
            None => compile_blocked_commands(DEFAULT_BLOCKED_COMMANDS)?,
        };

        let default_shell = get("DEFAULT_SHELL");
        if let Some(shell) = &default_shell {
            if which::which(shell).is_err() {
                warn!(shell = %shell, "DEFAULT_SHELL is not on PATH. Spawning commands will fail if it cannot be found at runtime.");
            }
        }

        let log_level = get("LOG_LEVEL").unwrap_or(defaults.log_level);

        let line_flush_interval = parse_millis(
            get("TERMINAL_FLUSH_INTERVAL_MS"),
            "TERMINAL_FLUSH_INTERVAL_MS",
            defaults.line_flush_interval,
        )?;
        let hot_timeout = parse_millis(
            get("TERMINAL_HOT_TIMEOUT_MS"),
            "TERMINAL_HOT_TIMEOUT_MS",
            defaults.hot_timeout,
        )?;
        let hot_timeout_compiling = parse_millis(
            get("TERMINAL_HOT_TIMEOUT_COMPILING_MS"),
            "TERMINAL_HOT_TIMEOUT_COMPILING_MS",
            defaults.hot_timeout_compiling,
        )?;

        let mirror_output = parse_bool(
            get("TERMINAL_MIRROR_OUTPUT"),
            "TERMINAL_MIRROR_OUTPUT",
            defaults.mirror_output,
        )?;

        let locale = get("TERMINAL_LOCALE").unwrap_or(defaults.locale);

        Ok(Config {
            default_cwd,
            blocked_commands,
            default_shell,
            log_level,
            line_flush_interval,
            hot_timeout,
            hot_timeout_compiling,
            mirror_output,
            locale,
        })
    }

    pub fn is_command_blocked(&self, command_str: &str) -> bool {
        let effective_command = command_str.trim_start();
        if effective_command.is_empty() {
            return false;
        }
        self.blocked_commands
            .iter()
            .any(|regex| regex.is_match(effective_command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.line_flush_interval, Duration::from_millis(500));
        assert_eq!(config.hot_timeout, Duration::from_millis(2000));
        assert_eq!(config.hot_timeout_compiling, Duration::from_millis(15000));
        assert!(config.mirror_output);
        assert_eq!(config.locale, "en_US.UTF-8");
        assert!(config.default_shell.is_none());
        assert!(!config.blocked_commands.is_empty());
    }

    #[test]
    fn overrides_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_lookup(lookup_from(&[
            ("TERMINAL_CWD", dir.path().to_str().unwrap()),
            ("TERMINAL_FLUSH_INTERVAL_MS", "50"),
            ("TERMINAL_HOT_TIMEOUT_MS", "100"),
            ("TERMINAL_MIRROR_OUTPUT", "false"),
            ("TERMINAL_LOCALE", "C.UTF-8"),
            ("BLOCKED_COMMANDS", "shutdown"),
        ]))
        .unwrap();
        assert_eq!(config.default_cwd, dunce::canonicalize(dir.path()).unwrap());
        assert_eq!(config.line_flush_interval, Duration::from_millis(50));
        assert_eq!(config.hot_timeout, Duration::from_millis(100));
        assert!(!config.mirror_output);
        assert_eq!(config.locale, "C.UTF-8");
        assert_eq!(config.blocked_commands.len(), 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("TERMINAL_FLUSH_INTERVAL_MS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("TERMINAL_MIRROR_OUTPUT", "maybe")])).is_err());
        assert!(Config::from_lookup(lookup_from(&[("TERMINAL_CWD", "/definitely/not/here")])).is_err());
    }

    #[test]
    fn blocked_commands_match_first_word_after_assignments() {
        let config = Config::from_lookup(lookup_from(&[("BLOCKED_COMMANDS", "sudo, reboot")])).unwrap();
        assert!(config.is_command_blocked("sudo ls"));
        assert!(config.is_command_blocked("  FOO=bar sudo ls"));
        assert!(config.is_command_blocked("reboot"));
        assert!(!config.is_command_blocked("echo sudo"));
        assert!(!config.is_command_blocked("sudoku"));
        assert!(!config.is_command_blocked(""));
    }

    #[test]
    fn empty_blocked_list_disables_blocking() {
        let config = Config::from_lookup(lookup_from(&[("BLOCKED_COMMANDS", "")])).unwrap();
        assert!(config.blocked_commands.is_empty());
        assert!(!config.is_command_blocked("sudo ls"));
    }
}
