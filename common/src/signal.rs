//! One-shot broadcast completion signal.
//!
//! Fires at most once; any number of waiters, past or future, unblock
//! exactly once. Waiters arriving after the fire return immediately.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Later calls are no-ops.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal has fired.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives at least as long as &self, so this cannot fail
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
