//! Completion op: a cloneable handle that is signalled once some
//! asynchronous work has finished.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

/// Completion handle passed to [`Bulk::run`](crate::bulk::Bulk::run).
///
/// Clones share the same underlying state. Signalling is sticky: once
/// signalled, every current and future `wait` returns immediately.
#[derive(Clone)]
pub struct Op {
    inner: Arc<OpInner>,
}

struct OpInner {
    signalled: watch::Sender<bool>,
    signal_nr: AtomicU32,
}

impl Op {
    pub fn new() -> Self {
        let (signalled, _) = watch::channel(false);
        Self {
            inner: Arc::new(OpInner {
                signalled,
                signal_nr: AtomicU32::new(0),
            }),
        }
    }

    /// Mark the op as done and wake every waiter.
    pub fn signal(&self) {
        self.inner.signal_nr.fetch_add(1, Ordering::AcqRel);
        self.inner.signalled.send_replace(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.inner.signalled.borrow()
    }

    /// How many times [`signal`](Self::signal) has been called.
    pub fn signal_count(&self) -> u32 {
        self.inner.signal_nr.load(Ordering::Acquire)
    }

    /// Wait until the op is signalled.
    pub async fn wait(&self) {
        let mut rx = self.inner.signalled.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|signalled| *signalled).await;
    }
}

impl Default for Op {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Op")
            .field("signalled", &self.is_signalled())
            .field("signal_nr", &self.signal_count())
            .finish()
    }
}
