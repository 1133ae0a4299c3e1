//! Reconnection schedule for the push channel.

use std::time::Duration;

/// Delay before each reconnection attempt.
///
/// Attempt `n` (0-based) waits `delays[n]`; once the schedule is exhausted
/// the last entry repeats. Retries never stop on their own; instead the
/// channel reports itself as persistently disconnected once the schedule
/// is exhausted or `persistent_after` has elapsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    delays: Vec<Duration>,
    persistent_after: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(
            [0, 2_000, 5_000, 10_000, 30_000]
                .into_iter()
                .map(Duration::from_millis)
                .collect(),
        )
        .with_persistent_after(Duration::from_secs(120))
    }
}

impl BackoffPolicy {
    /// Policy with an explicit schedule. An empty schedule retries
    /// immediately.
    pub fn new(delays: Vec<Duration>) -> Self {
        let delays = if delays.is_empty() {
            vec![Duration::ZERO]
        } else {
            delays
        };
        Self {
            delays,
            persistent_after: None,
        }
    }

    /// Also report a persistent disconnection after `after` of reconnecting.
    #[must_use]
    pub fn with_persistent_after(mut self, after: Duration) -> Self {
        self.persistent_after = Some(after);
        self
    }

    /// Delay before attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt).unwrap_or(usize::MAX);
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }

    /// Whether reconnecting has gone on long enough to tell the user.
    pub fn is_persistent(&self, attempt: u32, elapsed: Duration) -> bool {
        let exhausted = usize::try_from(attempt).map_or(true, |a| a >= self.delays.len());
        exhausted || self.persistent_after.is_some_and(|limit| elapsed >= limit)
    }
}
