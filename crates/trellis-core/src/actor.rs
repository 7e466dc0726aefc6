//! Actor primitives: cancellation with a cause, supervised spawning.
//!
//! Every long-lived task in trellis (the cipher router, each server
//! session) owns a [`CancelToken`]. Cancelling it is idempotent, records a
//! single cause, and wakes every waiter; a supervisor task converts panics
//! into cancellations so one poisoned actor cannot take its neighbours
//! down.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Bound for actor inbox channels.
pub const MAILBOX_CAPACITY: usize = 8;

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    cause: Mutex<Option<String>>,
    notify: Notify,
}

/// Clonable cancellation token with a set-once cause slot.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    /// Create a fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token, recording `cause` if this is the first cancel.
    ///
    /// Later calls are no-ops; the first cause wins.
    pub fn cancel(&self, cause: impl Into<String>) {
        {
            let mut slot = self
                .inner
                .cause
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(cause.into());
            }
        }
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Has the token been cancelled?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The cause recorded by the first cancel, if any.
    #[must_use]
    pub fn cause(&self) -> Option<String> {
        self.inner
            .cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }

            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Registration above closes the gap with a concurrent cancel.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Spawn `task` with a supervisor that converts a panic into a logged
/// cancellation of `cancel`.
///
/// Returns the supervisor's join handle; awaiting it observes actor exit
/// (normal or panicked).
pub fn spawn_supervised<F>(
    name: &'static str,
    cancel: CancelToken,
    task: F,
) -> tokio::task::JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(task);

    tokio::spawn(async move {
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                tracing::error!(actor = name, panic = %e, "actor panicked, cancelling");
                cancel.cancel(format!("{name} panicked"));
            }
            Err(_) => {
                // Runtime shutdown aborted the task; nothing to record.
            }
        }
    })
}
