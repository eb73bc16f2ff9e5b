use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

const COMPILE_MARKERS: [&str; 6] = [
    "compiling",
    "building",
    "bundling",
    "transpiling",
    "generating",
    "starting",
];

const COMPILE_MARKER_NULLIFIERS: [&str; 12] = [
    "compiled", "success", "finish", "complete", "succeed", "done", "end", "stop", "exit",
    "terminate", "error", "fail",
];

/// Debounced "is the process actively producing output" flag.
///
/// Every chunk restarts the timer; when it elapses without another chunk the
/// process drops back to idle. Must run inside a tokio runtime.
#[derive(Debug)]
pub struct HotStreamDetector {
    state: watch::Sender<bool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    normal_timeout: Duration,
    compiling_timeout: Duration,
}

impl HotStreamDetector {
    pub fn new(normal_timeout: Duration, compiling_timeout: Duration) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state,
            timer: Mutex::new(None),
            normal_timeout,
            compiling_timeout,
        }
    }

    pub fn is_hot(&self) -> bool {
        *self.state.borrow()
    }

    /// Receives a notification on every hot/idle transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Marks the stream hot and restarts the idle timer for `chunk`.
    pub fn touch(&self, chunk: &str) {
        let timeout = if is_compiling(chunk) {
            self.compiling_timeout
        } else {
            self.normal_timeout
        };

        self.state.send_if_modified(|hot| !std::mem::replace(hot, true));

        let state = self.state.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if state.send_if_modified(|hot| std::mem::replace(hot, false)) {
                trace!(timeout_ms = timeout.as_millis() as u64, "Output stream went idle");
            }
        });

        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Cancels any pending timer and settles on idle.
    pub fn stop(&self) {
        let pending = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            pending.abort();
        }
        self.state.send_if_modified(|hot| std::mem::replace(hot, false));
    }
}

impl Drop for HotStreamDetector {
    fn drop(&mut self) {
        if let Some(pending) = self
            .timer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pending.abort();
        }
    }
}

fn is_compiling(chunk: &str) -> bool {
    let lower = chunk.to_lowercase();
    COMPILE_MARKERS.iter().any(|m| lower.contains(m))
        && !COMPILE_MARKER_NULLIFIERS.iter().any(|n| lower.contains(n))
}
