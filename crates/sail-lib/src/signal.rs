//! Run-wide cancellation.
//!
//! The caller owns signal sources (ctrl-c handlers, test harnesses) and
//! forwards them here; the run subscribes and winds down: no new tasks are
//! dispatched, in-flight subprocesses are terminated, and outstanding tasks
//! drain to `Skipped`.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Clone)]
pub struct SignalHandler {
    interrupted: Arc<watch::Sender<bool>>,
}

impl SignalHandler {
    pub fn new() -> Self {
        let (interrupted, _) = watch::channel(false);
        Self {
            interrupted: Arc::new(interrupted),
        }
    }

    pub fn interrupt(&self) {
        self.interrupted.send_replace(true);
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupted.borrow()
    }

    /// A receiver that resolves `wait_for(|i| *i)` once interrupted.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.interrupted.subscribe()
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
