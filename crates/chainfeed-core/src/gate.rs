//! Wake-all broadcast primitive.
//!
//! A [`BroadcastGate`] releases every task currently waiting on it each time
//! [`BroadcastGate::broadcast`] is called. Waiters register through
//! [`BroadcastGate::listen`]; a broadcast issued after a listener was taken
//! is never missed, even if the listener starts awaiting later.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Releases all current waiters on every broadcast.
#[derive(Debug)]
pub struct BroadcastGate {
    generation: watch::Sender<u64>,
}

impl Default for BroadcastGate {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastGate {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation }
    }

    /// Register interest in the next broadcast.
    pub fn listen(&self) -> GateListener {
        GateListener {
            rx: self.generation.subscribe(),
        }
    }

    /// Block until the next broadcast or until `cancel` fires.
    ///
    /// Returns `true` when woken by a broadcast, `false` when cancelled.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        self.listen().wait(cancel).await
    }

    /// Wake every listener taken before this call.
    pub fn broadcast(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

/// A pending wait on a [`BroadcastGate`].
#[derive(Debug)]
pub struct GateListener {
    rx: watch::Receiver<u64>,
}

impl GateListener {
    /// Wait for a broadcast issued after this listener was created.
    ///
    /// Returns `false` if `cancel` fires first.
    pub async fn wait(mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            changed = self.rx.changed() => changed.is_ok(),
        }
    }
}
