//! Retry backoff strategies.
//!
//! The broker schedules a failed job's next attempt with an [`Exponential`]
//! strategy built from its configuration (base delay times a multiplier per
//! recorded failure), optionally softened with [`Jitter`] to keep herds of
//! retries from landing on the same instant.
//!
//! # Example
//!
//! ```
//! use chrono::TimeDelta;
//! use requeue::backoff::{BackoffStrategy, Strategy};
//!
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1), 2.0)
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
//! assert_eq!(strategy.backoff(10), TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of failures recorded so far, returns the
    /// [`TimeDelta`] to wait before the job should run again.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Constant backoff: the same delay no matter the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff: `base × factor^attempt`, optionally clamped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exponential {
    base: TimeDelta,
    factor: f64,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.base.num_milliseconds() as f64 * self.factor.powi(exponent);
        let millis = millis.min((i64::MAX / 2) as f64) as i64;
        let mut backoff = TimeDelta::milliseconds(millis);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Added to the backoff in the range `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// Added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A [`Strategy`] combined with optional jitter and a floor.
///
/// # Example
///
/// ```
/// use chrono::TimeDelta;
/// use requeue::backoff::{BackoffStrategy, Jitter, Strategy};
///
/// let strategy = BackoffStrategy::constant(TimeDelta::seconds(20))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)))
///     .with_min(TimeDelta::seconds(5));
///
/// let backoff = strategy.backoff(1);
/// assert!(backoff >= TimeDelta::seconds(10));
/// assert!(backoff <= TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] that always returns `delay`.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] growing as `base × factor^attempt`.
    ///
    /// It is advisable to also clamp it with [`BackoffStrategy::with_max`].
    pub const fn exponential(base: TimeDelta, factor: f64) -> Self {
        Self::new(Exponential {
            base,
            factor,
            max: None,
        })
    }

    /// Clamps the maximum value returned by [`Strategy::backoff`].
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`]. More commonly constructed via
    /// [`BackoffStrategy::constant`] or [`BackoffStrategy::exponential`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Adds a random jitter, see [`Jitter`].
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Adds a floor, useful with large jitters to avoid near-zero delays.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_backoff() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(100), 2.0);

        assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(200));
        assert_eq!(strategy.backoff(2), TimeDelta::milliseconds(400));
        assert_eq!(strategy.backoff(3), TimeDelta::milliseconds(800));
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::minutes(10);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1), 3.0).with_max(max);

        for i in 1..100 {
            assert!(strategy.backoff(i) <= max);
        }
    }

    #[test]
    fn exponential_backoff_survives_huge_attempts() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1), 2.0);
        assert!(strategy.backoff(u32::MAX) > TimeDelta::zero());
    }

    #[test]
    fn absolute_jitter_stays_in_range() {
        let delay = TimeDelta::minutes(1);
        let jitter = TimeDelta::seconds(10);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Absolute(jitter));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn relative_jitter_stays_in_range() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Relative(0.1));

        for i in 1..100 {
            let jitter = TimeDelta::seconds(6);
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn jitter_respects_min() {
        let delay = TimeDelta::seconds(20);
        let strategy = BackoffStrategy::constant(delay)
            .with_jitter(Jitter::Absolute(delay))
            .with_min(TimeDelta::seconds(5));

        for i in 1..100 {
            assert!(strategy.backoff(i) >= TimeDelta::seconds(5));
        }
    }
}
