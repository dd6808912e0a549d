//! The trial record: the unit of the ledger.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::parameter::ParameterPoint;
use crate::types::{TrialId, TrialStatus};

/// When a trial entered a status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// The status entered.
    pub status: TrialStatus,
    /// Wall-clock time of the transition.
    pub at: DateTime<Utc>,
}

/// The result of an observed (completed or failed) trial.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The trial produced an objective value.
    Completed {
        /// The objective value.
        objective: f64,
    },
    /// The trial failed.
    Failed {
        /// Why.
        reason: String,
    },
}

/// One trial, tracked from proposal to a terminal status.
///
/// The record enforces the status state machine: each transition method
/// rejects moves that [`TrialStatus::can_transition_to`] forbids, the
/// objective is present iff the status is `completed`, and the failure
/// reason iff it is `failed`. Terminal records never change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    id: TrialId,
    point: ParameterPoint,
    status: TrialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    objective: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failure: Option<String>,
    /// Submission attempt, incremented when a resumed driver re-dispatches.
    #[serde(default = "first_attempt")]
    attempt: u32,
    transitions: Vec<StatusChange>,
}

fn first_attempt() -> u32 {
    1
}

impl TrialRecord {
    /// A freshly proposed trial.
    #[must_use]
    pub fn proposed(id: TrialId, point: ParameterPoint) -> Self {
        Self {
            id,
            point,
            status: TrialStatus::Proposed,
            objective: None,
            metrics: BTreeMap::new(),
            failure: None,
            attempt: 1,
            transitions: vec![StatusChange {
                status: TrialStatus::Proposed,
                at: Utc::now(),
            }],
        }
    }

    /// The trial id.
    #[must_use]
    pub fn id(&self) -> TrialId {
        self.id
    }

    /// The evaluated point.
    #[must_use]
    pub fn point(&self) -> &ParameterPoint {
        &self.point
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TrialStatus {
        self.status
    }

    /// Objective value, present iff completed.
    #[must_use]
    pub fn objective(&self) -> Option<f64> {
        self.objective
    }

    /// Auxiliary metrics reported by extraction.
    #[must_use]
    pub fn metrics(&self) -> &BTreeMap<String, f64> {
        &self.metrics
    }

    /// Failure reason, present iff failed.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Submission attempt (1 unless re-dispatched after a resume).
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Every status change in order.
    #[must_use]
    pub fn transitions(&self) -> &[StatusChange] {
        &self.transitions
    }

    /// Time the trial entered `status` most recently.
    #[must_use]
    pub fn entered(&self, status: TrialStatus) -> Option<DateTime<Utc>> {
        self.transitions
            .iter()
            .rev()
            .find(|c| c.status == status)
            .map(|c| c.at)
    }

    /// `true` once the trial was handed to the execution manager, i.e. it
    /// consumed (or is consuming) compute.
    #[must_use]
    pub fn was_dispatched(&self) -> bool {
        self.entered(TrialStatus::Dispatched).is_some()
    }

    /// The fidelity the trial was evaluated at.
    #[must_use]
    pub fn fidelity(&self) -> Option<f64> {
        self.point.fidelity()
    }

    /// The outcome, once observed.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        match self.status {
            TrialStatus::Completed => self
                .objective
                .map(|objective| Outcome::Completed { objective }),
            TrialStatus::Failed => Some(Outcome::Failed {
                reason: self.failure.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    fn transition(&mut self, next: TrialStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                trial: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.transitions.push(StatusChange {
            status: next,
            at: Utc::now(),
        });
        Ok(())
    }

    /// `proposed -> dispatched`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] from any other status.
    pub fn dispatch(&mut self) -> Result<()> {
        if self.status != TrialStatus::Proposed {
            return Err(Error::InvalidTransition {
                trial: self.id,
                from: self.status,
                to: TrialStatus::Dispatched,
            });
        }
        self.transition(TrialStatus::Dispatched)
    }

    /// Re-submit a `dispatched`/`running` trial whose outcome was lost,
    /// bumping the attempt counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] unless the trial is in flight.
    pub fn redispatch(&mut self) -> Result<()> {
        if !self.status.is_in_flight() {
            return Err(Error::InvalidTransition {
                trial: self.id,
                from: self.status,
                to: TrialStatus::Dispatched,
            });
        }
        self.transition(TrialStatus::Dispatched)?;
        self.attempt = self.attempt.saturating_add(1);
        Ok(())
    }

    /// `dispatched -> running`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] from any other status.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TrialStatus::Running)
    }

    /// `running -> completed` with the extracted objective.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] from any other status.
    pub fn complete(&mut self, objective: f64, metrics: BTreeMap<String, f64>) -> Result<()> {
        self.transition(TrialStatus::Completed)?;
        self.objective = Some(objective);
        self.metrics = metrics;
        Ok(())
    }

    /// Any non-terminal status `-> failed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the trial is already terminal.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TrialStatus::Failed)?;
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Any non-terminal status `-> cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the trial is already terminal.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(TrialStatus::Cancelled)
    }

    /// Check the status/objective/failure invariants and that `next` is a
    /// legal successor of `self`. Used when replaying a persisted log.
    pub(crate) fn check_successor(&self, next: &TrialRecord) -> core::result::Result<(), String> {
        if self.id != next.id {
            return Err(format!("trial id changed from {} to {}", self.id, next.id));
        }
        if self.point != next.point {
            return Err(format!("trial {} changed its parameter point", self.id));
        }
        if !self.status.can_transition_to(next.status) {
            return Err(format!(
                "trial {} cannot move from {} to {}",
                self.id, self.status, next.status
            ));
        }
        if next.attempt < self.attempt {
            return Err(format!("trial {} attempt went backwards", self.id));
        }
        Ok(())
    }

    pub(crate) fn check_invariants(&self) -> core::result::Result<(), String> {
        match (self.status, self.objective, &self.failure) {
            (TrialStatus::Completed, None, _) => {
                Err(format!("completed trial {} has no objective", self.id))
            }
            (TrialStatus::Failed, _, None) => {
                Err(format!("failed trial {} has no failure reason", self.id))
            }
            (status, Some(_), _) if status != TrialStatus::Completed => Err(format!(
                "trial {} has an objective but is {status}",
                self.id
            )),
            (status, _, Some(_)) if status != TrialStatus::Failed => Err(format!(
                "trial {} has a failure reason but is {status}",
                self.id
            )),
            _ => Ok(()),
        }
    }
}
