//! Keyed exponential back-off.
//!
//! A [`Backoff`] remembers, per key, how long the next retry of a failing
//! operation should wait. Each consecutive failure doubles the delay up to a
//! ceiling; a key that stops failing ages out and starts again from the
//! floor.
//!
//! # Invariants
//!
//! - A key with no entry is never in back-off
//! - The delay for a key never decreases across consecutive failures and
//!   never exceeds the configured maximum
//! - Every read-modify-write runs under one lock, so concurrent failures on
//!   the same key are applied one after another

mod clock;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

pub use clock::{Clock, FakeClock, SystemClock};

/// Default delay applied after the first failure.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Default ceiling for the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Back-off configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffConfigError {
    /// The floor delay is zero.
    #[error("initial back-off delay must be greater than zero")]
    ZeroInitialDelay,

    /// The ceiling is below the floor.
    #[error("max back-off delay {max:?} is below initial delay {initial:?}")]
    MaxBelowInitial { initial: Duration, max: Duration },

    /// Entries would be collected while still in back-off.
    #[error("retention {retention:?} is shorter than max back-off delay {max:?}")]
    RetentionBelowMax { retention: Duration, max: Duration },
}

/// Delays governing a [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failure for a key.
    pub initial: Duration,

    /// Upper bound for the delay.
    pub max: Duration,

    /// Entries not updated for longer than this are considered stale.
    pub retention: Duration,
}

impl BackoffConfig {
    /// Build a config whose retention horizon is twice the ceiling.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            retention: max.saturating_mul(2),
        }
    }

    /// Check that the delays are usable.
    pub fn validate(&self) -> Result<(), BackoffConfigError> {
        if self.initial.is_zero() {
            return Err(BackoffConfigError::ZeroInitialDelay);
        }
        if self.max < self.initial {
            return Err(BackoffConfigError::MaxBelowInitial {
                initial: self.initial,
                max: self.max,
            });
        }
        if self.retention < self.max {
            return Err(BackoffConfigError::RetentionBelowMax {
                retention: self.retention,
                max: self.max,
            });
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Retry state for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    /// Delay the next retry has to wait out.
    delay: Duration,

    /// When the last failure was recorded.
    last_update: Instant,
}

/// Keyed exponential back-off ledger.
pub struct Backoff {
    config: BackoffConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Backoff {
    /// Create a tracker reading the system clock.
    pub fn new(config: BackoffConfig) -> Result<Self, BackoffConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a tracker reading `clock`.
    pub fn with_clock(
        config: BackoffConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackoffConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// The tracker's configuration.
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Current time according to the tracker's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Returns true if `key` failed recently enough that a retry must wait.
    pub fn is_in_backoff(&self, key: &str, now: Instant) -> bool {
        let entries = self.lock();
        let Some(entry) = entries.get(key) else {
            return false;
        };

        match entry.last_update.checked_add(entry.delay) {
            Some(until) => now < until,
            None => true,
        }
    }

    /// Time left before `key` may be retried, if it is in back-off.
    pub fn remaining(&self, key: &str, now: Instant) -> Option<Duration> {
        let entries = self.lock();
        let entry = entries.get(key)?;
        let until = entry.last_update.checked_add(entry.delay)?;
        let left = until.saturating_duration_since(now);
        (!left.is_zero()).then_some(left)
    }

    /// Record a failure for `key` and return the delay now in force.
    ///
    /// The first failure (or the first after the entry aged out) starts at
    /// the initial delay; each further one doubles it up to the maximum.
    pub fn record_failure(&self, key: &str, now: Instant) -> Duration {
        let mut entries = self.lock();
        let initial = self.config.initial;
        let max = self.config.max;
        let retention = self.config.retention;

        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if Self::is_stale(entry, now, retention) {
                    entry.delay = initial;
                } else {
                    entry.delay = entry.delay.saturating_mul(2).min(max);
                }
                entry.last_update = now;
            })
            .or_insert(Entry {
                delay: initial,
                last_update: now,
            });

        entry.delay
    }

    /// Forget everything about `key`.
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Remove entries not updated within the retention horizon.
    ///
    /// Returns how many entries were removed.
    pub fn gc(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !Self::is_stale(entry, now, retention));
        before - entries.len()
    }

    /// Delay currently recorded for `key`.
    pub fn delay(&self, key: &str) -> Option<Duration> {
        self.lock().get(key).map(|entry| entry.delay)
    }

    /// [`Backoff::is_in_backoff`] at the clock's current time.
    pub fn is_in_backoff_now(&self, key: &str) -> bool {
        self.is_in_backoff(key, self.now())
    }

    /// [`Backoff::record_failure`] at the clock's current time.
    pub fn record_failure_now(&self, key: &str) -> Duration {
        self.record_failure(key, self.now())
    }

    /// [`Backoff::gc`] at the clock's current time.
    pub fn gc_now(&self) -> usize {
        self.gc(self.now())
    }

    /// Number of keys with recorded failures.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no key has a recorded failure.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn is_stale(entry: &Entry, now: Instant, retention: Duration) -> bool {
        now.saturating_duration_since(entry.last_update) > retention
    }

    // Entries are plain values, so a panic elsewhere cannot leave the map
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}
