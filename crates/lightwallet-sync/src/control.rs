//! Cancellation and pause primitives shared between the engine and the host.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{watch, Notify};

/// Stop signal for one engine run.
///
/// Clones share the signal. Network calls and backoff sleeps race against [`cancelled`],
/// the scan loop polls [`is_cancelled`] between blocks.
///
/// [`cancelled`]: CancelToken::cancelled
/// [`is_cancelled`]: CancelToken::is_cancelled
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    signal: Arc<Signal>,
}

#[derive(Debug, Default)]
struct Signal {
    raised: AtomicBool,
    wake: Notify,
}

impl CancelToken {
    /// Token with the signal lowered
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the signal is raised
    pub fn is_cancelled(&self) -> bool {
        self.signal.raised.load(Ordering::Acquire)
    }

    /// Raise the signal. Every pending [`CancelToken::cancelled`] resolves.
    pub fn cancel(&self) {
        self.signal.raised.store(true, Ordering::Release);
        self.signal.wake.notify_waiters();
    }

    /// Lower the signal at the start of a run, once the previous run has returned.
    pub fn reset(&self) {
        self.signal.raised.store(false, Ordering::Release);
    }

    /// Resolves once the signal is raised.
    pub async fn cancelled(&self) {
        // Subscribe first so a `cancel` racing with the flag check still wakes us
        let woken = self.signal.wake.notified();
        if self.is_cancelled() {
            return;
        }
        woken.await;
    }
}

/// Pause gate honored by the engine between batches.
#[derive(Clone, Debug)]
pub struct PauseGate {
    paused: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    /// Create an open (not paused) gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            paused: Arc::new(tx),
        }
    }

    /// Close the gate; the engine parks at its next phase boundary.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Reopen the gate.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Whether the gate is closed.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open. Returns `false` if cancelled while waiting.
    pub async fn wait_open(&self, cancel: &CancelToken) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if !*rx.borrow_and_update() {
                return true;
            }
            tracing::debug!("Sync paused, waiting for resume");
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = cancel.cancelled() => return false,
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}
