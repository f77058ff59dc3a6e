use std::time::Duration;

use rand::Rng;

/// How many reconnect attempts a channel may make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retries {
    /// Keep retrying forever.
    Unlimited,
    /// Give up (and shut the channel down) after this many attempts.
    Upto(u32),
}

/// Exponential backoff configuration for reconnection.
///
/// Each attempt's delay is the previous unjittered delay times
/// `multiplier`, capped at `maximum_backoff`, then multiplied by a jitter
/// factor drawn uniformly from `[1 - jitter, 1 + jitter]`. The per-attempt
/// connect timeout is the delay raised to at least
/// `minimum_connection_timeout`.
#[derive(Debug, Clone)]
pub struct ConnectionBackoff {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub maximum_backoff: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Jitter factor in `[0, 1]`.
    pub jitter: f64,
    /// Floor for the per-attempt connect timeout.
    pub minimum_connection_timeout: Duration,
    /// Attempt budget.
    pub retries: Retries,
}

impl Default for ConnectionBackoff {
    fn default() -> Self {
        ConnectionBackoff {
            initial_backoff: Duration::from_secs(1),
            maximum_backoff: Duration::from_secs(120),
            multiplier: 1.6,
            jitter: 0.2,
            minimum_connection_timeout: Duration::from_secs(20),
            retries: Retries::Unlimited,
        }
    }
}

impl ConnectionBackoff {
    /// Start a fresh sequence of backoff steps.
    pub fn iter(&self) -> BackoffIterator {
        BackoffIterator {
            config: self.clone(),
            unjittered: self.initial_backoff.as_secs_f64(),
            remaining: match self.retries {
                Retries::Unlimited => None,
                Retries::Upto(n) => Some(n),
            },
        }
    }
}

/// One reconnect attempt's timing.
#[derive(Debug, Clone, Copy)]
pub struct BackoffStep {
    /// How long the connect attempt itself may take.
    pub connect_timeout: Duration,
    /// How long to wait before the next attempt if this one fails.
    pub delay: Duration,
}

/// Iterator over [`BackoffStep`]s; exhaustion means the retry budget is
/// spent.
#[derive(Debug)]
pub struct BackoffIterator {
    config: ConnectionBackoff,
    unjittered: f64,
    remaining: Option<u32>,
}

impl Iterator for BackoffIterator {
    type Item = BackoffStep;

    fn next(&mut self) -> Option<BackoffStep> {
        match &mut self.remaining {
            Some(0) => return None,
            Some(n) => *n -= 1,
            None => {}
        }

        let max = self.config.maximum_backoff.as_secs_f64();
        let base = self.unjittered.min(max);
        self.unjittered = (self.unjittered * self.config.multiplier).min(max);

        let jitter = self.config.jitter;
        let factor = if jitter > 0.0 {
            rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let delay = Duration::from_secs_f64((base * factor).min(max));

        Some(BackoffStep {
            connect_timeout: delay.max(self.config.minimum_connection_timeout),
            delay,
        })
    }
}
