//! Invariant checks over run results.
//!
//! These hold for every run regardless of the failure pattern injected, and
//! are meant to be asserted at the end of integration and property tests.

use std::collections::HashSet;

use anyhow::{ensure, Result};
use rowcast_delivery::RunResult;

/// Core system invariants that must always hold.
pub struct Invariants;

impl Invariants {
    /// Every record read reached exactly one terminal outcome.
    pub fn all_accounted(result: &RunResult) -> Result<()> {
        ensure!(!result.interrupted, "interrupted runs leave records in flight");
        let terminal = result.success + result.permanent_failure + result.duplicates;
        ensure!(
            terminal == result.total,
            "{} records read but {} terminal ({} ok, {} failed, {} duplicate)",
            result.total,
            terminal,
            result.success,
            result.permanent_failure,
            result.duplicates
        );
        Ok(())
    }

    /// Counters agree with the failures carried in the result.
    pub fn failures_match_counter(result: &RunResult) -> Result<()> {
        ensure!(
            result.failures.len() as u64 == result.permanent_failure,
            "{} failed records listed but {} counted",
            result.failures.len(),
            result.permanent_failure
        );
        ensure!(
            result.retried_and_recovered <= result.success,
            "recovered {} exceeds successes {}",
            result.retried_and_recovered,
            result.success
        );
        Ok(())
    }

    /// No record offset was accepted twice by the remote.
    pub fn no_double_delivery(delivered: &[u64]) -> Result<()> {
        let mut seen = HashSet::with_capacity(delivered.len());
        for offset in delivered {
            ensure!(seen.insert(*offset), "record at offset {offset} delivered twice");
        }
        Ok(())
    }
}
