//! Cancellation scope with a recorded cause
//!
//! Every concurrent unit in a sync session (syncer tasks, the command loop,
//! watchdogs, retry timers) races its work against a [`CancelScope`]. The
//! first caller to cancel records the cause; later cancellations keep the
//! original cause so shutdown reporting stays stable.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::error::SyncError;

/// Cancellation signal shared by the tasks of one session or connection.
///
/// Cloning is cheap; all clones observe the same cancellation.
#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    tx: broadcast::Sender<()>,
    cause: Mutex<Option<SyncError>>,
}

impl CancelScope {
    /// Create a fresh, un-cancelled scope.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                tx,
                cause: Mutex::new(None),
            }),
        }
    }

    /// Cancel the scope. The first cause wins; repeat calls are no-ops.
    pub fn cancel(&self, cause: SyncError) {
        {
            let mut slot = self.inner.cause.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return;
            }
            *slot = Some(cause);
        }
        // No receivers is fine: is_cancelled() still observes the cause.
        let _ = self.inner.tx.send(());
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The recorded cause, if cancelled.
    pub fn cause(&self) -> Option<SyncError> {
        self.inner
            .cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wait until the scope is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.inner.tx.subscribe();
        // Re-check after subscribing: cancel() may have run in between.
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}
