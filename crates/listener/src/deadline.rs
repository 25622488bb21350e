//! Composes a caller's cancellation token with an operation timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ListenerError;

/// A cancellation token that fires when the parent fires or the timeout elapses.
pub(crate) struct Deadline {
    token: CancellationToken,
    expired: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

impl Deadline {
    pub(crate) fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        let token = parent.child_token();
        let expired = Arc::new(AtomicBool::new(false));
        let timer = {
            let token = token.clone();
            let expired = expired.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        expired.store(true, Ordering::Release);
                        token.cancel();
                    }
                }
            })
        };
        Self {
            token,
            expired,
            timer,
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Reports a cancellation caused by the timer as [`ListenerError::Timeout`].
    pub(crate) fn map_err(&self, e: ListenerError) -> ListenerError {
        match e {
            ListenerError::Cancelled if self.expired.load(Ordering::Acquire) => {
                ListenerError::Timeout
            }
            other => other,
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
