//! Read-only query interface over a run's history.
//!
//! [`HistoryView`] is what reporting tools consume: every trial record, the
//! best objective so far (earliest trial id wins ties, trials violating an
//! outcome constraint never win) and per-fidelity breakdowns. It can be taken from a live [`Driver`](crate::driver::Driver)
//! or read straight from a journal file without locking it.

mod export;

use std::path::Path;

use crate::error::{Error, Result};
use crate::parameter::SearchSpace;
use crate::storage::{read_journal, HistorySnapshot};
use crate::trial::TrialRecord;
use crate::types::{Direction, TrialId, TrialStatus};

/// Aggregate statistics for one fidelity level.
#[derive(Clone, Debug, PartialEq)]
pub struct FidelitySummary {
    /// The fidelity value; `None` for trials of a space without a fidelity axis.
    pub fidelity: Option<f64>,
    /// All trials at this level.
    pub trials: usize,
    /// Completed trials.
    pub completed: usize,
    /// Failed trials.
    pub failed: usize,
    /// Cancelled trials.
    pub cancelled: usize,
    /// Best feasible completed trial at this level and its objective.
    pub best: Option<(TrialId, f64)>,
    /// Summed relative cost of the dispatched, observed trials.
    pub cost: f64,
}

/// A read-only view of the trial ledger.
#[derive(Clone, Debug)]
pub struct HistoryView {
    direction: Direction,
    space: SearchSpace,
    records: Vec<TrialRecord>,
}

impl HistoryView {
    /// Wrap a snapshot.
    #[must_use]
    pub fn new(direction: Direction, space: SearchSpace, snapshot: HistorySnapshot) -> Self {
        Self {
            direction,
            space,
            records: snapshot.into_records(),
        }
    }

    pub(crate) fn from_records(
        direction: Direction,
        space: SearchSpace,
        records: Vec<TrialRecord>,
    ) -> Self {
        Self {
            direction,
            space,
            records,
        }
    }

    /// Read a journal file without taking its lock.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`read_journal`].
    pub fn from_journal(path: impl AsRef<Path>) -> Result<Self> {
        let (header, snapshot) = read_journal(path)?;
        Ok(Self::new(header.direction, header.space, snapshot))
    }

    /// The optimization direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The search space the history was written for.
    #[must_use]
    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// All trial records in id order.
    #[must_use]
    pub fn records(&self) -> &[TrialRecord] {
        &self.records
    }

    /// Look up a trial.
    #[must_use]
    pub fn get(&self, id: TrialId) -> Option<&TrialRecord> {
        self.records
            .binary_search_by_key(&id, TrialRecord::id)
            .ok()
            .map(|i| &self.records[i])
    }

    /// Number of trials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// `true` if the history holds no trials.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of trials in `status`.
    #[must_use]
    pub fn count(&self, status: TrialStatus) -> usize {
        self.records.iter().filter(|r| r.status() == status).count()
    }

    /// `true` if `record` completed and its metrics meet every outcome
    /// constraint of the space.
    #[must_use]
    pub fn is_feasible(&self, record: &TrialRecord) -> bool {
        record.status() == TrialStatus::Completed
            && self.space.satisfies_outcomes(record.metrics())
    }

    /// The best feasible completed full-fidelity trial.
    ///
    /// Without a fidelity axis every feasible completed trial qualifies.
    /// Ties go to the earliest trial id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial qualifies.
    pub fn best(&self) -> Result<&TrialRecord> {
        self.best_where(|r| self.space.is_full_fidelity(r.point()))
    }

    /// The objective of [`best`](Self::best).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial qualifies.
    pub fn best_value(&self) -> Result<f64> {
        self.best()?.objective().ok_or(Error::NoCompletedTrials)
    }

    /// The best feasible completed trial evaluated at exactly `fidelity`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial ran at that level.
    pub fn best_at(&self, fidelity: f64) -> Result<&TrialRecord> {
        self.best_where(|r| r.fidelity() == Some(fidelity))
    }

    /// The `n` best feasible completed full-fidelity trials, best first.
    #[must_use]
    pub fn top_trials(&self, n: usize) -> Vec<&TrialRecord> {
        let mut completed: Vec<&TrialRecord> = self
            .feasible()
            .filter(|r| self.space.is_full_fidelity(r.point()))
            .collect();
        // Stable sort keeps id order among equal objectives.
        completed.sort_by(|a, b| self.compare(b, a));
        completed.truncate(n);
        completed
    }

    /// Per-fidelity breakdown, ascending by fidelity (`None` first).
    #[must_use]
    pub fn per_fidelity(&self) -> Vec<FidelitySummary> {
        let mut levels: Vec<Option<f64>> = self.records.iter().map(TrialRecord::fidelity).collect();
        levels.sort_by(|a, b| match (a, b) {
            (Some(a), Some(b)) => a.total_cmp(b),
            _ => a.is_some().cmp(&b.is_some()),
        });
        levels.dedup();

        levels
            .into_iter()
            .map(|fidelity| {
                let at_level: Vec<&TrialRecord> = self
                    .records
                    .iter()
                    .filter(|r| r.fidelity() == fidelity)
                    .collect();
                let count = |status: TrialStatus| {
                    at_level.iter().filter(|r| r.status() == status).count()
                };
                let best = at_level
                    .iter()
                    .copied()
                    .filter(|r| self.is_feasible(r))
                    .fold(None, |best: Option<&TrialRecord>, r| match best {
                        Some(b) if self.compare(r, b).is_le() => Some(b),
                        _ => Some(r),
                    })
                    .and_then(|r| r.objective().map(|v| (r.id(), v)));
                FidelitySummary {
                    fidelity,
                    trials: at_level.len(),
                    completed: count(TrialStatus::Completed),
                    failed: count(TrialStatus::Failed),
                    cancelled: count(TrialStatus::Cancelled),
                    best,
                    cost: at_level
                        .iter()
                        .filter(|r| r.status().is_observed() && r.was_dispatched())
                        .map(|r| self.space.cost(r.point()))
                        .sum(),
                }
            })
            .collect()
    }

    /// Summed relative cost of every dispatched, observed trial.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.per_fidelity().iter().map(|f| f.cost).sum()
    }

    fn feasible(&self) -> impl Iterator<Item = &TrialRecord> {
        self.records.iter().filter(|r| self.is_feasible(r))
    }

    /// Orders two completed trials so that the better one compares `Greater`.
    fn compare(&self, a: &TrialRecord, b: &TrialRecord) -> core::cmp::Ordering {
        match (a.objective(), b.objective()) {
            (Some(a), Some(b)) => self.direction.compare(a, b),
            (a, b) => a.is_some().cmp(&b.is_some()),
        }
    }

    fn best_where(&self, keep: impl Fn(&TrialRecord) -> bool) -> Result<&TrialRecord> {
        self.feasible()
            .filter(|r| keep(r))
            .fold(None, |best: Option<&TrialRecord>, r| match best {
                // Records are in id order: only a strictly better one replaces.
                Some(b) if self.compare(r, b).is_le() => Some(b),
                _ => Some(r),
            })
            .ok_or(Error::NoCompletedTrials)
    }
}
