//! Retry/backoff policies used by the failed state
//!
//! A policy looks at the current streak of consecutive failures and either
//! names the pause before the next attempt or gives up on the transfer.

use rand::Rng;
use resumable_types::{ErrorKind, RetrySettings};
use std::fmt::Debug;
use std::time::Duration;

/// Consecutive failures since the last successful action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureStreak {
    pub attempts: u32,
    pub fatal_attempts: u32,
    pub last_kind: Option<ErrorKind>,
}

impl FailureStreak {
    pub fn record(&mut self, kind: ErrorKind) {
        self.attempts += 1;
        if kind == ErrorKind::Fatal {
            self.fatal_attempts += 1;
        }
        self.last_kind = Some(kind);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Decides whether and when a failed transfer is retried
pub trait BackoffPolicy: Debug + Send + Sync {
    fn decide(&self, streak: &FailureStreak) -> RetryDecision;
}

/// Constant pause between attempts
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

impl BackoffPolicy for FixedBackoff {
    fn decide(&self, streak: &FailureStreak) -> RetryDecision {
        match self.max_attempts {
            Some(max) if streak.attempts > max => RetryDecision::GiveUp,
            _ => RetryDecision::RetryAfter(self.delay),
        }
    }
}

/// Exponential backoff with jitter and separate caps for transient and fatal failures
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed
    pub jitter: f64,
    pub max_retries: Option<u32>,
    pub max_fatal_retries: u32,
}

impl ExponentialBackoff {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.multiplier.max(1.0),
            jitter: settings.jitter.clamp(0.0, 1.0),
            max_retries: settings.max_retries,
            max_fatal_retries: settings.max_fatal_retries,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn decide(&self, streak: &FailureStreak) -> RetryDecision {
        if streak.fatal_attempts > self.max_fatal_retries {
            return RetryDecision::GiveUp;
        }
        if let Some(max) = self.max_retries {
            if streak.attempts > max {
                return RetryDecision::GiveUp;
            }
        }
        RetryDecision::RetryAfter(self.apply_jitter(self.base_delay_for(streak.attempts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streak(attempts: u32, fatal_attempts: u32) -> FailureStreak {
        FailureStreak {
            attempts,
            fatal_attempts,
            last_kind: Some(ErrorKind::Transient),
        }
    }

    fn no_jitter() -> ExponentialBackoff {
        ExponentialBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.0,
            max_retries: Some(5),
            max_fatal_retries: 2,
        }
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = FixedBackoff::default();
        assert_eq!(
            policy.decide(&streak(100, 0)),
            RetryDecision::RetryAfter(Duration::from_secs(1))
        );

        let capped = FixedBackoff::new(Duration::from_millis(5)).with_max_attempts(2);
        assert_eq!(
            capped.decide(&streak(2, 0)),
            RetryDecision::RetryAfter(Duration::from_millis(5))
        );
        assert_eq!(capped.decide(&streak(3, 0)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = no_jitter();
        let delays: Vec<_> = (1..=5).map(|n| policy.base_delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000]);
    }

    #[test]
    fn test_transient_cap() {
        let policy = no_jitter();
        assert!(matches!(policy.decide(&streak(5, 0)), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(&streak(6, 0)), RetryDecision::GiveUp);

        let unbounded = ExponentialBackoff {
            max_retries: None,
            ..no_jitter()
        };
        assert!(matches!(unbounded.decide(&streak(1000, 0)), RetryDecision::RetryAfter(_)));
    }

    #[test]
    fn test_fatal_cap_is_tighter() {
        let policy = no_jitter();
        assert!(matches!(policy.decide(&streak(2, 2)), RetryDecision::RetryAfter(_)));
        assert_eq!(policy.decide(&streak(3, 3)), RetryDecision::GiveUp);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = ExponentialBackoff {
            jitter: 0.5,
            ..no_jitter()
        };
        for _ in 0..100 {
            let RetryDecision::RetryAfter(delay) = policy.decide(&streak(1, 0)) else {
                panic!("expected a retry");
            };
            assert!(delay >= Duration::from_millis(49));
            assert!(delay <= Duration::from_millis(151));
        }
    }

    #[test]
    fn test_streak_tracks_fatal_failures() {
        let mut streak = FailureStreak::default();
        streak.record(ErrorKind::Transient);
        streak.record(ErrorKind::Fatal);
        assert_eq!(streak.attempts, 2);
        assert_eq!(streak.fatal_attempts, 1);
        assert_eq!(streak.last_kind, Some(ErrorKind::Fatal));

        streak.reset();
        assert_eq!(streak, FailureStreak::default());
    }
}
