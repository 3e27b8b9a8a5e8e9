//! Import result tally.
//!
//! Counts every eligible record exactly once, so
//! `imported + updated + duplicates + invalid == total` holds for any
//! completed run.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a single record ended up being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Imported,
    Updated,
    Duplicate,
    Invalid,
}

/// Summary returned by a completed import run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ImportResult {
    /// Rows that passed the name + contact check.
    pub total: usize,
    /// New leads created.
    pub imported: usize,
    /// Existing leads that received new data.
    pub updated: usize,
    /// Rows repeating a phone from this run, or matching a lead with nothing new.
    pub duplicates: usize,
    /// Rows whose writes failed.
    pub invalid: usize,
    /// Rows dropped before counting because they lacked a name or any contact.
    pub dropped: usize,
    /// Assignments per member, present for round-robin runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distribution: Option<BTreeMap<i32, usize>>,
}

impl ImportResult {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Imported => self.imported += 1,
            RecordOutcome::Updated => self.updated += 1,
            RecordOutcome::Duplicate => self.duplicates += 1,
            RecordOutcome::Invalid => self.invalid += 1,
        }
    }

    /// Number of records already classified.
    pub fn processed(&self) -> usize {
        self.imported + self.updated + self.duplicates + self.invalid
    }

    /// True when every eligible record has been counted exactly once.
    pub fn is_balanced(&self) -> bool {
        self.processed() == self.total
    }

    /// Merge per-batch counts into the run total.
    pub fn merge(&mut self, other: &ImportResult) {
        self.imported += other.imported;
        self.updated += other.updated;
        self.duplicates += other.duplicates;
        self.invalid += other.invalid;
    }
}
