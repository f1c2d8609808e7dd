//! Utility functions and helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Poll interval used while waiting for a busy guard to be released.
const GUARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// "Skip if already running" guard.
///
/// Each owner (collector, processor, coordinator) holds one of these. A
/// second caller arriving while a run is in flight gets `None` from
/// [`RunGuard::try_acquire`] and is expected to return a no-op instead of
/// racing the first run.
#[derive(Debug, Default)]
pub struct RunGuard {
    running: AtomicBool,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the guard, or `None` if a run is already in flight.
    pub fn try_acquire(&self) -> Option<RunToken<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunToken { guard: self })
    }

    /// Wait for the in-flight run (if any) to finish, then claim the guard.
    pub async fn acquire(&self) -> RunToken<'_> {
        loop {
            if let Some(token) = self.try_acquire() {
                return token;
            }
            tokio::time::sleep(GUARD_POLL_INTERVAL).await;
        }
    }

    /// Blocking variant of [`RunGuard::acquire`] for use off the async runtime.
    pub fn acquire_blocking(&self) -> RunToken<'_> {
        loop {
            if let Some(token) = self.try_acquire() {
                return token;
            }
            std::thread::sleep(GUARD_POLL_INTERVAL);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the owning [`RunGuard`] on drop.
#[derive(Debug)]
pub struct RunToken<'a> {
    guard: &'a RunGuard,
}

impl Drop for RunToken<'_> {
    fn drop(&mut self) {
        self.guard.running.store(false, Ordering::Release);
    }
}

/// Send a value through an unbounded channel, logging if the receiver is gone.
pub fn send_or_log<T>(tx: &mpsc::UnboundedSender<T>, value: T, context: &str) {
    if tx.send(value).is_err() {
        tracing::debug!("Receiver dropped, discarding {}", context);
    }
}

/// Run blocking store I/O on tokio's blocking pool.
pub async fn run_blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("Blocking task failed: {}", e))?
}
