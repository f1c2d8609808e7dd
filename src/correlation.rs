//! Matching a local session to the log file its agent process writes
//!
//! The agent adapter decides whether a candidate belongs to the session.
//! Not finding a match is an ordinary outcome: the result carries
//! `CorrelationStatus::Failed` and periodic discovery may still adopt the
//! file later.

use crate::adapters::AgentAdapter;
use crate::config::MonitoringConfig;
use crate::data::{Correlation, FileEntry};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tolerance for filesystems with coarse timestamp granularity
const TIMESTAMP_SKEW_SECS: i64 = 2;

/// Identity of the session being correlated
#[derive(Debug, Clone)]
pub struct CorrelationParams {
    pub session_id: String,
    pub agent_name: String,
    pub working_directory: PathBuf,
    /// Candidates born before this instant cannot belong to the session
    pub started_after: DateTime<Utc>,
    /// Paths that must never match (e.g. the log of a previous session)
    pub exclude: Vec<PathBuf>,
}

impl CorrelationParams {
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.iter().any(|p| p == path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total adapter consultation rounds, including the first
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &MonitoringConfig) -> Self {
        Self {
            max_attempts: config.correlation_attempts.max(1),
            delay: Duration::from_millis(config.correlation_retry_delay_ms),
            backoff: config.correlation_backoff,
        }
    }

    /// Delay before round `attempt` (1-based, so round 2 is the first retry).
    fn delay_before(&self, attempt: u32) -> Duration {
        if !self.backoff {
            return self.delay;
        }
        let exponent = attempt.saturating_sub(2).min(16);
        self.delay.saturating_mul(1 << exponent)
    }
}

/// Ask the adapter to pick this session's log among `candidates`.
///
/// Newest candidates are consulted first. Excluded paths and candidates
/// born before `started_after` are never offered to the adapter.
pub fn correlate(
    params: &CorrelationParams,
    adapter: &dyn AgentAdapter,
    candidates: &[FileEntry],
) -> Option<(String, PathBuf)> {
    let cutoff = params.started_after - chrono::Duration::seconds(TIMESTAMP_SKEW_SECS);
    let mut ordered: Vec<&FileEntry> = candidates
        .iter()
        .filter(|c| !params.is_excluded(&c.path))
        .filter(|c| adapter.matches_session_pattern(&c.path))
        .filter(|c| c.born_at() >= cutoff)
        .collect();
    ordered.sort_by(|a, b| b.born_at().cmp(&a.born_at()));

    ordered.into_iter().find_map(|candidate| {
        adapter
            .match_session(candidate, params)
            .map(|agent_session_id| (agent_session_id, candidate.path.clone()))
    })
}

/// Correlate with bounded retries.
///
/// Round 1 uses `initial`; each later round waits per `policy` and calls
/// `retry_snapshot` for a fresh candidate list. Always terminates after at
/// most `policy.max_attempts` rounds.
pub async fn correlate_with_retry<F, Fut>(
    params: &CorrelationParams,
    adapter: &dyn AgentAdapter,
    initial: Vec<FileEntry>,
    policy: RetryPolicy,
    mut retry_snapshot: F,
) -> Correlation
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Vec<FileEntry>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut candidates = initial;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            tokio::time::sleep(policy.delay_before(attempt)).await;
            candidates = retry_snapshot().await;
        }

        if let Some((agent_session_id, path)) = correlate(params, adapter, &candidates) {
            tracing::info!(
                session_id = %params.session_id,
                agent_session_id = %agent_session_id,
                path = %path.display(),
                attempt,
                "Correlated agent session log"
            );
            return Correlation::matched(agent_session_id, path, attempt);
        }

        tracing::debug!(
            session_id = %params.session_id,
            attempt,
            candidates = candidates.len(),
            "No matching agent log yet"
        );
    }

    tracing::warn!(
        session_id = %params.session_id,
        agent = %params.agent_name,
        attempts = max_attempts,
        "Correlation failed; will retry on discovery"
    );
    Correlation::failed(max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff: false,
        };
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            delay: Duration::from_millis(100),
            backoff: true,
        };
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
    }

    #[test]
    fn test_zero_attempts_clamped_by_config() {
        let config = MonitoringConfig {
            correlation_attempts: 0,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
