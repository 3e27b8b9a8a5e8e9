//! Assignment of imported leads to team members.
//!
//! The mode is chosen once per run. Round-robin keeps a single atomic cursor
//! so that, whatever order workers ask in, no member ends the run with more
//! than one assignment above any other.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How leads touched by a run are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributionMode {
    /// Cycle through the roster in order.
    RoundRobin(Vec<i32>),
    /// Every lead goes to the same member.
    Fixed(i32),
    /// Leads are left unassigned.
    Unassigned,
}

/// Per-run assignment state.
#[derive(Debug)]
pub struct Distributor {
    mode: DistributionMode,
    cursor: AtomicUsize,
    counts: Vec<AtomicUsize>,
}

impl Distributor {
    pub fn new(mode: DistributionMode) -> Self {
        let counts = match &mode {
            DistributionMode::RoundRobin(members) => {
                members.iter().map(|_| AtomicUsize::new(0)).collect()
            }
            _ => Vec::new(),
        };

        Self {
            mode,
            cursor: AtomicUsize::new(0),
            counts,
        }
    }

    pub fn mode(&self) -> &DistributionMode {
        &self.mode
    }

    /// Next assignee, advancing the round-robin cursor by exactly one.
    pub fn assign(&self) -> Option<i32> {
        match &self.mode {
            DistributionMode::RoundRobin(members) if !members.is_empty() => {
                let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
                self.counts[slot].fetch_add(1, Ordering::Relaxed);
                Some(members[slot])
            }
            DistributionMode::RoundRobin(_) => None,
            DistributionMode::Fixed(member) => Some(*member),
            DistributionMode::Unassigned => None,
        }
    }

    /// Assignment counts per member for round-robin runs.
    ///
    /// Every roster member appears, including those that received nothing.
    /// A member listed twice in the roster gets the sum of both slots.
    pub fn tally(&self) -> Option<BTreeMap<i32, usize>> {
        let DistributionMode::RoundRobin(members) = &self.mode else {
            return None;
        };

        let mut tally = BTreeMap::new();
        for (member, count) in members.iter().zip(&self.counts) {
            *tally.entry(*member).or_insert(0) += count.load(Ordering::Relaxed);
        }
        Some(tally)
    }
}
