//! Per-situation exponential backoff.
//!
//! Each named situation (for example "connection-lost" or "reconnect")
//! tracks its own last sleep. Calls that arrive soon after the previous
//! sleep ended are *continual* and double the sleep up to a cap. Calls that
//! arrive more than `reset_after` after the previous sleep expired start
//! again from the initial period.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Situation {
    last_period: Duration,
    last_called: Instant,
}

#[derive(Debug, Default)]
pub struct Backoff {
    situations: Mutex<HashMap<String, Situation>>,
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the period to sleep and whether this call continues a run of
    /// recent failures. With `skip_first`, a fresh situation sleeps zero.
    pub fn next(
        &self,
        situation: &str,
        initial: Duration,
        max: Duration,
        reset_after: Duration,
        skip_first: bool,
    ) -> (Duration, bool) {
        let now = Instant::now();
        let mut situations = self.situations.lock();

        let continual = situations.get(situation).copied().filter(|s| {
            now.saturating_duration_since(s.last_called) <= s.last_period + reset_after
        });

        let (period, reported) = match continual {
            Some(previous) => {
                let period = previous.last_period.saturating_mul(2).min(max);
                (period, period)
            }
            None if skip_first => (initial, Duration::ZERO),
            None => (initial, initial),
        };

        situations.insert(
            situation.to_string(),
            Situation {
                last_period: period,
                last_called: now,
            },
        );
        (reported, continual.is_some())
    }

    /// Sleeps for the period [`next`](Self::next) picks. Returns whether the
    /// sleep was continual.
    pub async fn sleep(
        &self,
        situation: &str,
        initial: Duration,
        max: Duration,
        reset_after: Duration,
        skip_first: bool,
    ) -> bool {
        let (period, continual) = self.next(situation, initial, max, reset_after, skip_first);
        if !period.is_zero() {
            tracing::debug!(situation, ?period, "Backing off");
            tokio::time::sleep(period).await;
        }
        continual
    }

    pub fn reset(&self, situation: &str) {
        self.situations.lock().remove(situation);
    }
}
