//! Completion channel for event-driven CQ notification.
//!
//! An armed CQ fires its channel when the next matching completion lands;
//! waiters block (or, with the `tokio` feature, await) on the channel
//! instead of spinning on `poll`.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::lock;

/// A one-shot wakeup channel shared between a CQ and its waiters.
pub struct CompletionChannel {
    signaled: Mutex<bool>,
    cv: Condvar,
    #[cfg(feature = "tokio")]
    notify: tokio::sync::Notify,
}

impl CompletionChannel {
    /// Create a new, unsignaled channel.
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
            #[cfg(feature = "tokio")]
            notify: tokio::sync::Notify::new(),
        }
    }

    /// Block until the channel fires or `timeout` elapses.
    ///
    /// Returns `true` if a notification was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.signaled);
        let (mut guard, result) = self
            .cv
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(|e| e.into_inner());
        if result.timed_out() && !*guard {
            return false;
        }
        *guard = false;
        true
    }

    /// Await the next notification (consumes a pending one immediately).
    #[cfg(feature = "tokio")]
    pub async fn notified(&self) {
        self.notify.notified().await;
        *lock(&self.signaled) = false;
    }

    pub(crate) fn fire(&self) {
        *lock(&self.signaled) = true;
        self.cv.notify_all();
        #[cfg(feature = "tokio")]
        self.notify.notify_one();
    }
}

impl Default for CompletionChannel {
    fn default() -> Self {
        Self::new()
    }
}
