//! Process-wide interrupt (Ctrl-C) hookup.
//!
//! A running command installs a handler and holds the returned [`InterruptGuard`];
//! dropping the guard uninstalls it, so every exit path releases the slot. One
//! signal listener task serves all installed handlers. Once the OS hook exists it
//! cannot be removed, so an interrupt arriving while no handler is installed gets
//! the default disposition back and is raised again: the host terminates as if the
//! hook had never been installed.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Handler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct InterruptSlot {
    next_id: u64,
    handlers: HashMap<u64, Handler>,
    listener: Option<JoinHandle<()>>,
}

static SLOT: Lazy<Mutex<InterruptSlot>> = Lazy::new(|| Mutex::new(InterruptSlot::default()));

fn slot() -> MutexGuard<'static, InterruptSlot> {
    SLOT.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps a handler installed for as long as it lives.
#[derive(Debug)]
pub struct InterruptGuard {
    id: u64,
}

impl InterruptGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let mut slot = slot();
        if slot.handlers.remove(&self.id).is_some() {
            debug!(handler_id = self.id, remaining = slot.handlers.len(), "Interrupt handler removed");
        }
    }
}

/// Installs `handler` to run on the next interrupt signals. Requires a tokio runtime.
pub fn install<F>(handler: F) -> InterruptGuard
where
    F: Fn() + Send + Sync + 'static,
{
    let mut slot = slot();
    slot.next_id += 1;
    let id = slot.next_id;
    slot.handlers.insert(id, Arc::new(handler));

    let listening = slot
        .listener
        .as_ref()
        .map_or(false, |listener| !listener.is_finished());
    if !listening {
        slot.listener = Some(tokio::spawn(listen()));
    }
    debug!(handler_id = id, installed = slot.handlers.len(), "Interrupt handler installed");
    InterruptGuard { id }
}

pub fn is_installed(id: u64) -> bool {
    slot().handlers.contains_key(&id)
}

async fn listen() {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Unable to listen for interrupt signals");
            return;
        }
        if !dispatch() {
            info!("Interrupt received with no running command");
            raise_default();
        }
    }
}

/// Runs every installed handler, outside the slot lock. Returns whether any ran.
fn dispatch() -> bool {
    let handlers: Vec<Handler> = slot().handlers.values().cloned().collect();
    if handlers.is_empty() {
        return false;
    }
    info!(handlers = handlers.len(), "Interrupt received, aborting running commands");
    for handler in handlers {
        handler();
    }
    true
}

#[cfg(unix)]
fn raise_default() {
    use nix::sys::signal::{raise, signal, SigHandler, Signal};
    // SAFETY: SIG_DFL runs no code in signal context.
    if let Err(e) = unsafe { signal(Signal::SIGINT, SigHandler::SigDfl) } {
        warn!(error = %e, "Unable to restore default interrupt handling");
        return;
    }
    if let Err(e) = raise(Signal::SIGINT) {
        warn!(error = %e, "Unable to re-raise interrupt");
    }
}

#[cfg(not(unix))]
fn raise_default() {
    // STATUS_CONTROL_C_EXIT, what the default console handler exits with.
    std::process::exit(0xC000013Au32 as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Only fires the handler under test; other tests may have handlers installed.
    fn trigger(id: u64) {
        let handler = slot().handlers.get(&id).cloned();
        if let Some(handler) = handler {
            handler();
        }
    }

    #[tokio::test]
    async fn guard_uninstalls_on_drop() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let guard = install(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = guard.id();
        assert!(is_installed(id));

        trigger(id);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(guard);
        assert!(!is_installed(id));
        trigger(id);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_installs_get_distinct_slots() {
        let first = install(|| {});
        let first_id = first.id();
        drop(first);
        let second = install(|| {});
        assert_ne!(first_id, second.id());
        assert!(!is_installed(first_id));
        assert!(is_installed(second.id()));
    }

    #[tokio::test]
    async fn guard_released_when_scope_unwinds_early() {
        fn bail_out(id: &mut u64) -> Result<(), ()> {
            let guard = install(|| {});
            *id = guard.id();
            Err(())
        }
        let mut id = 0;
        assert!(bail_out(&mut id).is_err());
        assert!(!is_installed(id));
    }
}
