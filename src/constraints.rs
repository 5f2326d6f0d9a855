//! Defines resource constraints for agent execution.
//!
//! This module provides tools to configure the limits every agent runtime is held to during a
//! match. Constraints include the operation budget, wall-clock timing and the size of the
//! structures agent code may build.
//!
//! # Overview
//!
//! The main entry point is the [`ConstraintsBuilder`] struct, which uses a builder pattern
//! to configure limits. These include:
//!
//! - **Budget constraints**: starting budget and per-turn allowance, counted in metered
//!   operations
//! - **Timing constraints**:
//!   * Per-turn wall-clock timeout
//!   * Grace period for a cancelled turn to unwind
//!   * Number of timeouts tolerated before a robot is stopped
//! - **Interpreter constraints**: call depth, collection length, log volume
//!
//! Once built, a [`Constraints`] object is passed to [`run_match`](crate::server::run_match).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use pawnbox::constraints::ConstraintsBuilder;
//!
//! let constraints = ConstraintsBuilder::new()
//!     .with_turn_allowance(10_000)
//!     .with_turn_timeout(Duration::from_millis(500))
//!     .with_timeout_strikes(2)
//!     .build()
//!     .unwrap();
//! ```
//!
//! You may also construct constraints from environment variables using
//! [`ConstraintsBuilder::from_env()`] for runtime configurability.

use std::{env, time::Duration};

use anyhow::bail;
use tracing::warn;

/// A builder for defining the limits of agent runtimes.
///
/// Unset values fall back to the defaults documented on each setter.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use pawnbox::constraints::ConstraintsBuilder;
///
/// let constraints = ConstraintsBuilder::new()
///     .with_starting_budget(50_000)
///     .with_turn_allowance(20_000)
///     .with_max_call_depth(100)
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct ConstraintsBuilder {
    starting_budget: Option<i64>,
    turn_allowance: Option<i64>,
    turn_timeout: Option<Duration>,
    cancel_grace: Option<Duration>,
    timeout_strikes: Option<u32>,
    max_call_depth: Option<usize>,
    max_collection_len: Option<usize>,
    max_log_entries: Option<usize>,
    max_log_len: Option<usize>,
}

impl ConstraintsBuilder {
    /// Creates a new `ConstraintsBuilder` where every limit takes its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new `ConstraintsBuilder` configured from environment variables.
    ///
    /// Read environment variables are:
    /// - `STARTING_BUDGET` (i64): budget of the first turn
    /// - `TURN_BUDGET` (i64): budget added at every following turn
    /// - `TURN_TIMEOUT_MS` (u64): wall-clock timeout per turn in milliseconds
    /// - `TIMEOUT_STRIKES` (u32): timeouts tolerated before a robot is stopped
    /// - `MAX_CALL_DEPTH` (usize): maximum agent call depth
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(var: &str) -> Option<T> {
            env::var(var).ok()?.parse().ok()
        }

        fn parse_duration_millis(var: &str) -> Option<Duration> {
            parse::<u64>(var).map(Duration::from_millis)
        }

        ConstraintsBuilder {
            starting_budget: parse("STARTING_BUDGET"),
            turn_allowance: parse("TURN_BUDGET"),
            turn_timeout: parse_duration_millis("TURN_TIMEOUT_MS"),
            timeout_strikes: parse("TIMEOUT_STRIKES"),
            max_call_depth: parse("MAX_CALL_DEPTH"),
            ..Self::default()
        }
    }

    /// Sets the budget available on a robot's first turn. Default is 20000.
    #[must_use]
    pub fn with_starting_budget(self, budget: i64) -> Self {
        Self {
            starting_budget: Some(budget),
            ..self
        }
    }

    /// Sets the budget added at the start of every later turn. Default is 20000.
    ///
    /// A deficit left by the previous turn is subtracted from it.
    #[must_use]
    pub fn with_turn_allowance(self, allowance: i64) -> Self {
        Self {
            turn_allowance: Some(allowance),
            ..self
        }
    }

    /// Sets the maximum wall-clock duration of one turn. Default is one second.
    #[must_use]
    pub fn with_turn_timeout(self, duration: Duration) -> Self {
        Self {
            turn_timeout: Some(duration),
            ..self
        }
    }

    /// Sets how long a cancelled turn may take to unwind before its robot is abandoned.
    /// Default is one second.
    #[must_use]
    pub fn with_cancel_grace(self, duration: Duration) -> Self {
        Self {
            cancel_grace: Some(duration),
            ..self
        }
    }

    /// Sets the number of timed out turns after which a robot is stopped. Default is 3.
    #[must_use]
    pub fn with_timeout_strikes(self, strikes: u32) -> Self {
        Self {
            timeout_strikes: Some(strikes),
            ..self
        }
    }

    /// Sets the maximum agent call depth. Default is 200.
    #[must_use]
    pub fn with_max_call_depth(self, depth: usize) -> Self {
        Self {
            max_call_depth: Some(depth),
            ..self
        }
    }

    /// Sets the longest list, string or dict agent code may build. Default is 1000000.
    #[must_use]
    pub fn with_max_collection_len(self, len: usize) -> Self {
        Self {
            max_collection_len: Some(len),
            ..self
        }
    }

    /// Sets the number of log lines kept per robot per turn, and the length of each.
    /// Defaults are 100 lines of 1000 characters.
    #[must_use]
    pub fn with_log_limits(self, entries: usize, len: usize) -> Self {
        Self {
            max_log_entries: Some(entries),
            max_log_len: Some(len),
            ..self
        }
    }

    /// Consumes the builder and returns the constructed `Constraints`.
    ///
    /// # Errors
    ///
    /// Returns an error when the constraints are impossible, e.g. a zero turn allowance.
    pub fn build(self) -> anyhow::Result<Constraints> {
        let turn_allowance = self.turn_allowance.unwrap_or(20_000);
        let starting_budget = self.starting_budget.unwrap_or(turn_allowance);
        if turn_allowance <= 0 {
            bail!("Turn allowance must be positive, got {turn_allowance}");
        }
        if starting_budget <= 0 {
            bail!("Starting budget must be positive, got {starting_budget}");
        }

        let turn_timeout = self.turn_timeout.unwrap_or(Duration::from_secs(1));
        if turn_timeout.is_zero() {
            bail!("Turn timeout cannot be zero");
        }
        let timeout_strikes = self.timeout_strikes.unwrap_or(3);
        if timeout_strikes == 0 {
            bail!("At least one timeout strike is needed");
        }

        let max_call_depth = self.max_call_depth.unwrap_or(200);
        if max_call_depth == 0 {
            bail!("Call depth must allow at least one frame");
        }
        if max_call_depth > 1000 {
            warn!(max_call_depth, "unusually deep call limit");
        }

        Ok(Constraints {
            starting_budget,
            turn_allowance,
            turn_timeout,
            cancel_grace: self.cancel_grace.unwrap_or(Duration::from_secs(1)),
            timeout_strikes,
            max_call_depth,
            max_collection_len: self.max_collection_len.unwrap_or(1_000_000),
            max_log_entries: self.max_log_entries.unwrap_or(100),
            max_log_len: self.max_log_len.unwrap_or(1000),
        })
    }
}

/// Obtained using `ConstraintsBuilder`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Constraints {
    pub(crate) starting_budget: i64,
    pub(crate) turn_allowance: i64,
    pub(crate) turn_timeout: Duration,
    pub(crate) cancel_grace: Duration,
    pub(crate) timeout_strikes: u32,
    pub(crate) max_call_depth: usize,
    pub(crate) max_collection_len: usize,
    pub(crate) max_log_entries: usize,
    pub(crate) max_log_len: usize,
}

impl Constraints {
    /// create a ConstraintsBuilder
    pub fn builder() -> ConstraintsBuilder {
        ConstraintsBuilder::new()
    }

    pub fn turn_allowance(&self) -> i64 {
        self.turn_allowance
    }

    pub fn turn_timeout(&self) -> Duration {
        self.turn_timeout
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            starting_budget: 20_000,
            turn_allowance: 20_000,
            turn_timeout: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(1),
            timeout_strikes: 3,
            max_call_depth: 200,
            max_collection_len: 1_000_000,
            max_log_entries: 100,
            max_log_len: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_builder() {
        assert_eq!(ConstraintsBuilder::new().build().unwrap(), Constraints::default());
    }

    #[test]
    fn starting_budget_follows_allowance_when_unset() {
        let c = ConstraintsBuilder::new().with_turn_allowance(500).build().unwrap();
        assert_eq!(c.starting_budget, 500);
    }

    #[test]
    fn impossible_constraints_are_rejected() {
        assert!(ConstraintsBuilder::new().with_turn_allowance(0).build().is_err());
        assert!(ConstraintsBuilder::new()
            .with_turn_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(ConstraintsBuilder::new().with_timeout_strikes(0).build().is_err());
        assert!(ConstraintsBuilder::new().with_max_call_depth(0).build().is_err());
    }
}
