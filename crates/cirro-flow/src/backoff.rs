//! Exponential backoff schedules.
//!
//! A [`Backoff`] yields an unbounded sequence of wait intervals. The first
//! call to [`Backoff::next_interval`] returns the initial interval; each
//! later call multiplies the previous interval, capped at the maximum.
//! Instances are never reset within an attempt.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parameters of an exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// First interval returned.
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    /// Upper bound on any interval.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Growth factor applied after each interval.
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Creates a new policy.
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// Default status polling schedule: 5s growing by 1.1x up to 5 minutes.
    #[must_use]
    pub const fn poll() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300), 1.1)
    }

    /// Default submit/recover schedule: 3s growing by 1.1x up to 30 seconds.
    #[must_use]
    pub const fn submit() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(30), 1.1)
    }

    /// Starts a fresh schedule from this policy.
    #[must_use]
    pub fn start(&self) -> Backoff {
        Backoff::new(self.initial, self.max, self.multiplier)
    }
}

/// A running exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Option<Duration>,
}

impl Backoff {
    /// Creates a schedule. Multipliers below 1 are treated as 1.
    #[must_use]
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial: initial.min(max),
            max,
            multiplier: if multiplier.is_finite() {
                multiplier.max(1.0)
            } else {
                1.0
            },
            current: None,
        }
    }

    /// Returns the next interval to wait.
    pub fn next_interval(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(previous) => {
                let scaled = previous.as_secs_f64() * self.multiplier;
                if scaled >= self.max.as_secs_f64() {
                    self.max
                } else {
                    Duration::from_secs_f64(scaled)
                }
            }
        };
        self.current = Some(next);
        next
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_interval())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_interval_is_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(300), 1.1);
        assert_eq!(backoff.next_interval(), Duration::from_secs(5));
    }

    #[test]
    fn intervals_grow_geometrically() {
        let intervals: Vec<Duration> =
            Backoff::new(Duration::from_secs(1), Duration::from_secs(100), 2.0)
                .take(4)
                .collect();
        assert_eq!(
            intervals,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn intervals_are_capped() {
        let mut backoff = BackoffPolicy::submit().start();
        let last = (0..100).map(|_| backoff.next_interval()).last();
        assert_eq!(last, Some(Duration::from_secs(30)));
    }

    #[test]
    fn sequence_is_non_decreasing() {
        let intervals: Vec<Duration> = BackoffPolicy::poll().start().take(80).collect();
        assert!(intervals.windows(2).all(|w| w[0] <= w[1]));
        assert!(intervals.iter().all(|d| *d <= Duration::from_secs(300)));
    }

    #[test]
    fn degenerate_multiplier_holds_steady() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10), 0.5);
        assert_eq!(backoff.next_interval(), Duration::from_secs(2));
        assert_eq!(backoff.next_interval(), Duration::from_secs(2));
    }

    #[test]
    fn policy_serde_uses_humantime() {
        let json = r#"{"initial":"5s","max":"5m","multiplier":1.1}"#;
        let policy: BackoffPolicy = serde_json::from_str(json).unwrap_or(BackoffPolicy::submit());
        assert_eq!(policy, BackoffPolicy::poll());
    }
}
