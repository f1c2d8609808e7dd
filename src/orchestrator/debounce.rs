//! Single-slot pending timer
//!
//! Scheduling replaces (and aborts) whatever was pending, so a burst of
//! triggers inside the quiet period yields one action after the last one.
//! Only the wait is cancellable: once the delay elapses the action runs on
//! its own task and is never aborted mid-flight.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct PendingTimer {
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl PendingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, cancelling any previously pending action.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(action);
        });

        let previous = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Drop the pending action, if any. Returns true if one was waiting.
    pub fn cancel(&self) -> bool {
        let pending = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PendingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
