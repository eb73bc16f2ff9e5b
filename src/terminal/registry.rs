use super::process_tree::ProcessTreeTerminator;
use super::session::CliTerminal;
use super::{Terminal, TerminalId, TerminalKind};
use crate::config::Config;
use crate::error::TerminalError;

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info};

pub(crate) struct RegistryInner {
    config: Arc<Config>,
    terminator: ProcessTreeTerminator,
    next_id: AtomicU32,
    terminals: Mutex<HashMap<TerminalId, Arc<CliTerminal>>>,
}

impl RegistryInner {
    fn terminals(&self) -> MutexGuard<'_, HashMap<TerminalId, Arc<CliTerminal>>> {
        self.terminals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Non-owning link from a process back to its terminal.
#[derive(Debug, Clone)]
pub(crate) struct TerminalRef {
    id: TerminalId,
    registry: Weak<RegistryInner>,
}

impl TerminalRef {
    pub(crate) fn new(id: TerminalId, registry: Weak<RegistryInner>) -> Self {
        Self { id, registry }
    }

    pub(crate) fn id(&self) -> TerminalId {
        self.id
    }

    /// Fails with `DetachedProcess` once the terminal or the whole registry is gone.
    pub(crate) fn get(&self) -> Result<Arc<CliTerminal>, TerminalError> {
        let registry = self
            .registry
            .upgrade()
            .ok_or(TerminalError::DetachedProcess(self.id))?;
        let terminal = registry.terminals().get(&self.id).cloned();
        terminal.ok_or(TerminalError::DetachedProcess(self.id))
    }
}

/// Serializable snapshot of one terminal.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalInfo {
    pub id: TerminalId,
    pub kind: TerminalKind,
    pub cwd: PathBuf,
    pub busy: bool,
    pub running: bool,
    pub command: Option<String>,
    pub pid: Option<u32>,
    pub start_time_iso: Option<String>,
    pub runtime_ms: Option<u128>,
}

/// Owns every terminal and hands out ids.
#[derive(Clone)]
pub struct TerminalRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for TerminalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalRegistry")
            .field("terminals", &self.inner.terminals().len())
            .finish()
    }
}

impl TerminalRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_terminator(config, ProcessTreeTerminator::default())
    }

    pub fn with_terminator(config: Arc<Config>, terminator: ProcessTreeTerminator) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                terminator,
                next_id: AtomicU32::new(1),
                terminals: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn create_terminal(&self, cwd: impl Into<PathBuf>) -> Arc<CliTerminal> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let terminal = Arc::new(CliTerminal::new(
            id,
            cwd.into(),
            self.inner.config.clone(),
            self.inner.terminator.clone(),
            Arc::downgrade(&self.inner),
        ));
        self.inner.terminals().insert(id, terminal.clone());
        info!(terminal_id = id, cwd = %terminal.cwd().display(), "Created terminal");
        terminal
    }

    pub fn get(&self, id: TerminalId) -> Result<Arc<CliTerminal>, TerminalError> {
        self.inner
            .terminals()
            .get(&id)
            .cloned()
            .ok_or(TerminalError::TerminalNotFound(id))
    }

    /// Reuses an idle terminal bound to `cwd`, or creates one.
    pub fn get_or_create_terminal(&self, cwd: impl AsRef<Path>) -> Arc<CliTerminal> {
        let cwd = cwd.as_ref();
        let idle = self
            .inner
            .terminals()
            .values()
            .filter(|t| !t.is_busy() && t.cwd() == cwd)
            .min_by_key(|t| t.id())
            .cloned();
        match idle {
            Some(terminal) => {
                debug!(terminal_id = terminal.id(), "Reusing idle terminal");
                terminal
            }
            None => self.create_terminal(cwd),
        }
    }

    /// Drops the registry's handle to an idle terminal. Busy terminals are refused
    /// with `SessionBusy`: a process that loses its terminal mid-run can no longer
    /// mark it idle. Commands dispatched to a removed terminal fail with
    /// `DetachedProcess`.
    pub fn remove(&self, id: TerminalId) -> Result<Option<Arc<CliTerminal>>, TerminalError> {
        let mut terminals = self.inner.terminals();
        if terminals.get(&id).map_or(false, |t| t.is_busy()) {
            debug!(terminal_id = id, "Refusing to remove busy terminal");
            return Err(TerminalError::SessionBusy(id));
        }
        let removed = terminals.remove(&id);
        if removed.is_some() {
            info!(terminal_id = id, "Removed terminal");
        }
        Ok(removed)
    }

    pub fn list(&self) -> Vec<TerminalInfo> {
        let terminals: Vec<Arc<CliTerminal>> = self.inner.terminals().values().cloned().collect();
        let mut infos: Vec<TerminalInfo> = terminals.iter().map(|t| t.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.terminals().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
