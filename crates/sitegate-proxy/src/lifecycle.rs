//! Shutdown signalling and connection tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Notify};

/// Shutdown phase broadcast to every connection and tunnel task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Running,
    /// Finish in-flight work, accept nothing new.
    Draining,
    /// Drop everything now.
    Abort,
}

pub(crate) type ShutdownRx = watch::Receiver<Phase>;

/// Waits on `rx` until the phase reaches `Abort` or the sender goes away.
pub(crate) async fn aborted(rx: &mut ShutdownRx) {
    loop {
        if *rx.borrow_and_update() == Phase::Abort {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Counts live connection and tunnel tasks.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTracker {
    active: AtomicUsize,
    idle: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a task; it counts as active until the guard drops.
    pub fn enter(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves once no tasks are active.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub(crate) struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}
