//! The optimization driver.
//!
//! A [`Driver`] owns the trial table and is the only writer of the history
//! store. It asks the proposer for points while the in-flight budget allows,
//! renders and dispatches them, routes execution reports through the
//! extraction adapter, and stops once the [`StopPolicy`] is met.
//!
//! # Examples
//!
//! ```no_run
//! use picopt::prelude::*;
//!
//! # async fn example() -> picopt::Result<()> {
//! let space = SearchSpace::new(
//!     vec![
//!         VariableSpec::continuous("a0", 1.0, 4.0),
//!         VariableSpec::integer("nz", 64, 512),
//!     ],
//!     None,
//! )?;
//!
//! let mut driver = Driver::builder()
//!     .maximize()
//!     .space(space)
//!     .template(Template::parse("a0 = {{ a0 }}\nnz = {{ nz }}\n")?)
//!     .executor(LocalExecutor::new("runs", "./simulate"))
//!     .extractor(JsonFileExtractor::new("summary.json", "energy"))
//!     .journal("runs/history.jsonl")
//!     .max_in_flight(4)
//!     .stop(StopPolicy::new().max_trials(40))
//!     .build()?;
//!
//! let summary = driver.run().await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

mod builder;
mod run;

use core::cmp::Ordering;
use core::fmt;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::watch;

pub use builder::DriverBuilder;

use crate::error::{Error, Result};
use crate::execution::{ExecutionManager, ResourceRequest};
use crate::extraction::Extractor;
use crate::history::HistoryView;
use crate::parameter::{ParameterPoint, SearchSpace};
use crate::proposer::Proposer;
use crate::stop::{StopPolicy, StopReason};
use crate::storage::{HistorySnapshot, HistoryStore};
use crate::template::Renderer;
use crate::trial::TrialRecord;
use crate::types::{Direction, TrialId, TrialStatus};

/// Requests a graceful stop of a running [`Driver`].
///
/// Cloneable and usable from any task or thread (a signal handler, for
/// example). After [`stop`](Self::stop) the driver proposes nothing new,
/// waits up to its grace period for in-flight trials, cancels the rest and
/// returns.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the driver to drain and stop.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// `true` once a stop was requested and the run has not yet ended.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        *self.tx.borrow()
    }
}

/// How a call to [`Driver::run`] ended.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Why the run stopped.
    pub reason: StopReason,
    /// Wall-clock duration of this run.
    pub elapsed: Duration,
    /// Trials proposed during this run.
    pub proposed: usize,
    /// Completed trials in the whole history.
    pub completed: usize,
    /// Failed trials in the whole history.
    pub failed: usize,
    /// Cancelled trials in the whole history.
    pub cancelled: usize,
    /// Best feasible full-fidelity trial so far and its objective.
    pub best: Option<(TrialId, f64)>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stopped: {} after {:.1?} ({} proposed; {} completed, {} failed, {} cancelled in history)",
            self.reason, self.elapsed, self.proposed, self.completed, self.failed, self.cancelled
        )?;
        if let Some((id, value)) = self.best {
            write!(f, "; best {value} (trial #{id})")?;
        }
        Ok(())
    }
}

/// The optimization control loop.
///
/// Built with [`Driver::builder`]. Building loads and reconciles any prior
/// history, so a constructed driver is already in the state "as if the
/// previous process had never stopped".
pub struct Driver {
    pub(crate) direction: Direction,
    pub(crate) space: SearchSpace,
    pub(crate) renderer: Arc<dyn Renderer>,
    pub(crate) proposer: Box<dyn Proposer>,
    pub(crate) executor: Arc<dyn ExecutionManager>,
    pub(crate) extractor: Arc<dyn Extractor>,
    pub(crate) store: Arc<dyn HistoryStore>,
    pub(crate) policy: StopPolicy,
    pub(crate) max_in_flight: usize,
    pub(crate) extraction_timeout: Option<Duration>,
    pub(crate) grace_period: Duration,
    pub(crate) resources: ResourceRequest,
    /// Authoritative mirror of the history, in id order.
    pub(crate) ledger: Vec<TrialRecord>,
    pub(crate) next_id: TrialId,
    /// Points to evaluate before the proposer is consulted.
    pub(crate) queued: VecDeque<ParameterPoint>,
    /// In-flight trials of an interrupted run that still need a job.
    pub(crate) resubmit: VecDeque<TrialId>,
    /// Feasible full-fidelity objectives in observation order.
    pub(crate) objectives: Vec<f64>,
    pub(crate) best: Option<(TrialId, f64)>,
    pub(crate) stop: Arc<watch::Sender<bool>>,
}

impl Driver {
    /// Start configuring a driver.
    #[must_use]
    pub fn builder() -> DriverBuilder {
        DriverBuilder::new()
    }

    /// The optimization direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The search space.
    #[must_use]
    pub fn space(&self) -> &SearchSpace {
        &self.space
    }

    /// The stop policy.
    #[must_use]
    pub fn stop_policy(&self) -> &StopPolicy {
        &self.policy
    }

    /// A handle that asks a running driver to stop.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop),
        }
    }

    /// Queue a point to be evaluated before the proposer is asked again.
    ///
    /// The point goes through the same completion and validation as a
    /// proposed one.
    pub fn enqueue(&mut self, point: ParameterPoint) {
        self.queued.push_back(point);
    }

    /// A read-only snapshot of every trial.
    #[must_use]
    pub fn history(&self) -> HistoryView {
        HistoryView::from_records(self.direction, self.space.clone(), self.ledger.clone())
    }

    /// Look up a trial.
    #[must_use]
    pub fn trial(&self, id: TrialId) -> Option<&TrialRecord> {
        self.position(id).ok().map(|i| &self.ledger[i])
    }

    /// Trials currently dispatched or running.
    ///
    /// Trials left in flight by an interrupted run are not counted until
    /// they are resubmitted; see [`pending_resubmits`](Self::pending_resubmits).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.ledger
            .iter()
            .filter(|r| r.status().is_in_flight() && !self.resubmit.contains(&r.id()))
            .count()
    }

    /// Trials of an interrupted run that wait for a slot to be resubmitted.
    #[must_use]
    pub fn pending_resubmits(&self) -> Vec<TrialId> {
        self.resubmit.iter().copied().collect()
    }

    /// The best feasible full-fidelity objective seen so far. Ties go to the
    /// earliest trial id.
    #[must_use]
    pub fn best(&self) -> Option<(TrialId, f64)> {
        self.best
    }

    /// Bring the in-memory state in line with a loaded history.
    ///
    /// Completed and failed trials are replayed to the proposer, in-flight
    /// trials are queued for resubmission under their original id, and
    /// trials that never left `proposed` are cancelled. Queued trials keep
    /// their recorded status until the run gives them a slot.
    pub(crate) fn reconcile(&mut self, snapshot: HistorySnapshot) -> Result<()> {
        self.next_id = snapshot.next_id();
        self.ledger = snapshot.into_records();
        if self.ledger.is_empty() {
            return Ok(());
        }

        let mut cancelled = 0usize;
        for i in 0..self.ledger.len() {
            let record = &mut self.ledger[i];
            match record.status() {
                TrialStatus::Proposed => {
                    record.cancel()?;
                    self.store.append(&self.ledger[i])?;
                    cancelled += 1;
                }
                TrialStatus::Dispatched | TrialStatus::Running => {
                    self.resubmit.push_back(record.id());
                }
                _ => {}
            }
        }

        let observed: Vec<TrialRecord> = self
            .ledger
            .iter()
            .filter(|r| r.status().is_observed())
            .cloned()
            .collect();
        if !observed.is_empty() {
            self.proposer.observe(&observed);
        }

        let mut candidates: Vec<&TrialRecord> =
            observed.iter().filter(|r| self.is_candidate(r)).collect();
        candidates.sort_by_key(|r| r.entered(TrialStatus::Completed));
        self.objectives = candidates.iter().filter_map(|r| r.objective()).collect();
        for record in candidates {
            self.consider_best(record);
        }

        tracing::info!(
            trials = self.ledger.len(),
            completed = observed
                .iter()
                .filter(|r| r.status() == TrialStatus::Completed)
                .count(),
            failed = observed
                .iter()
                .filter(|r| r.status() == TrialStatus::Failed)
                .count(),
            resubmits = self.resubmit.len(),
            cancelled,
            next_id = %self.next_id,
            "resumed history"
        );
        Ok(())
    }

    /// `true` if `record` can be the best trial: completed at full fidelity
    /// and within every outcome constraint.
    pub(crate) fn is_candidate(&self, record: &TrialRecord) -> bool {
        record.status() == TrialStatus::Completed
            && self.space.is_full_fidelity(record.point())
            && self.space.satisfies_outcomes(record.metrics())
    }

    /// Update the incumbent with a candidate; returns `true` if `record` is
    /// a new best.
    ///
    /// Equal objectives go to the earlier trial id, whatever order they
    /// complete in.
    pub(crate) fn consider_best(&mut self, record: &TrialRecord) -> bool {
        let Some(value) = record.objective() else {
            return false;
        };
        let replaces = match self.best {
            None => true,
            Some((id, incumbent)) => match self.direction.compare(value, incumbent) {
                Ordering::Greater => true,
                Ordering::Equal => record.id() < id,
                Ordering::Less => false,
            },
        };
        if replaces {
            self.best = Some((record.id(), value));
        }
        replaces
    }

    pub(crate) fn position(&self, id: TrialId) -> Result<usize> {
        self.ledger
            .binary_search_by_key(&id, TrialRecord::id)
            .map_err(|_| Error::Internal("trial missing from ledger"))
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("direction", &self.direction)
            .field("space", &self.space)
            .field("max_in_flight", &self.max_in_flight)
            .field("trials", &self.ledger.len())
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}
