//! Core types shared by the driver, the ledger and the query interface.

use core::cmp::Ordering;
use core::fmt;

use serde::{Deserialize, Serialize};

/// The direction of optimization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Minimize the objective value.
    #[default]
    Minimize,
    /// Maximize the objective value.
    Maximize,
}

impl Direction {
    /// Orders two objective values so that the better one compares `Greater`.
    #[must_use]
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        let ordering = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        match self {
            Direction::Minimize => ordering.reverse(),
            Direction::Maximize => ordering,
        }
    }

    /// Returns `true` if `candidate` is strictly better than `incumbent`.
    #[must_use]
    pub fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        self.compare(candidate, incumbent) == Ordering::Greater
    }

    /// How much `candidate` improves on `incumbent` (positive is better).
    #[must_use]
    pub fn improvement(self, candidate: f64, incumbent: f64) -> f64 {
        match self {
            Direction::Minimize => incumbent - candidate,
            Direction::Maximize => candidate - incumbent,
        }
    }
}

/// Unique, monotonically increasing identifier of a trial.
///
/// Ids are assigned at proposal time and never reused, including across a
/// resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub u64);

impl TrialId {
    /// The id following this one.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The state of a trial in its lifecycle.
///
/// ```text
/// proposed -> dispatched -> running -> completed
///     |           |            |  \--> failed
///     |           |            \-----> cancelled
///     \-----------+-> failed / cancelled
/// ```
///
/// `dispatched`/`running` may also move back to `dispatched` when a resumed
/// driver re-submits a trial whose outcome was never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Created by the proposer, not yet handed to the execution manager.
    Proposed,
    /// Submitted to the execution manager.
    Dispatched,
    /// The execution manager acknowledged scheduling.
    Running,
    /// Finished with an objective value.
    Completed,
    /// Finished without an objective value.
    Failed,
    /// Abandoned by the driver during shutdown.
    Cancelled,
}

impl TrialStatus {
    /// Terminal states never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States that count against the in-flight budget.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// Completed and failed trials have been observed by the proposer.
    #[must_use]
    pub fn is_observed(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal ledger transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TrialStatus::{Cancelled, Completed, Dispatched, Failed, Proposed, Running};
        match (self, next) {
            (Proposed, Dispatched | Failed | Cancelled) => true,
            // Re-dispatch after a resume is the only backward edge.
            (Dispatched | Running, Dispatched) => true,
            (Dispatched, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    /// Lower-case name as written to the history file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
