//! Sync protocol state.

use tokio::sync::watch;

/// Progress of the presence SYNC protocol for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No sync has ever started; the channel has not attached yet.
    Initial,
    /// A multi-message sync is underway.
    InProgress,
    /// The presence set matches the server view.
    Complete,
}

/// Completion gate for sync-waiters.
///
/// Constructed held, so callers waiting for the presence set block until
/// the first sync settles rather than returning an empty list before the
/// channel ever attached. Released on each sync completion and re-held on
/// each fresh sync start.
pub(crate) struct SyncGate {
    complete_tx: watch::Sender<bool>,
}

impl SyncGate {
    pub(crate) fn new() -> Self {
        let (complete_tx, _) = watch::channel(false);
        Self { complete_tx }
    }

    /// Block new waiters until the next release.
    pub(crate) fn hold(&self) {
        self.complete_tx.send_replace(false);
    }

    /// Release all current and future waiters.
    pub(crate) fn release(&self) {
        self.complete_tx.send_replace(true);
    }

    /// Wait until the gate is released. Cancel-safe.
    pub(crate) async fn wait(&self) {
        let mut complete_rx = self.complete_tx.subscribe();
        // The sender lives alongside this gate, so the channel cannot close
        // while a waiter is alive.
        let _ = complete_rx.wait_for(|complete| *complete).await;
    }
}
