//! Stop conditions.
//!
//! A [`StopPolicy`] is a set of [`StopCondition`]s; the run stops when any
//! of them is met. The driver evaluates [`StopPolicy::check`] once per
//! completed or failed trial, never while waiting on in-flight work. Before
//! requesting each new point it asks [`StopPolicy::blocking`] for a budget
//! that forbids it, so in-flight trials never overshoot the trial or cost
//! budget.

use core::fmt;
use core::time::Duration;

use crate::types::Direction;

/// One reason to end a run.
#[derive(Clone, Debug, PartialEq)]
pub enum StopCondition {
    /// Stop once this many trials have been observed (completed or failed).
    /// Cancelled trials do not count.
    MaxTrials(usize),
    /// Stop once the run has lasted this long.
    MaxDuration(Duration),
    /// Stop when the best full-fidelity objective has not improved by more
    /// than `min_delta` over the last `window` completed full-fidelity trials.
    /// Trials violating an outcome constraint are left out.
    NoImprovement {
        /// Number of most recent completions considered.
        window: usize,
        /// Smallest change that counts as an improvement.
        min_delta: f64,
    },
    /// Stop once the summed relative cost of observed trials reaches this
    /// budget. In-flight trials count against it when proposing.
    MaxCost(f64),
}

/// Why a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The trial budget was exhausted.
    MaxTrials,
    /// The time budget was exceeded.
    MaxDuration,
    /// The objective stopped improving.
    NoImprovement,
    /// The cost budget was exhausted.
    MaxCost,
    /// The proposer returned no further points.
    ProposerExhausted,
    /// A stop was requested through a [`StopHandle`](crate::driver::StopHandle).
    Requested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MaxTrials => "trial budget exhausted",
            Self::MaxDuration => "time budget exceeded",
            Self::NoImprovement => "no improvement",
            Self::MaxCost => "cost budget exhausted",
            Self::ProposerExhausted => "proposer exhausted",
            Self::Requested => "stop requested",
        })
    }
}

/// The driver's view of a run, as seen by the stop policy.
#[derive(Clone, Debug)]
pub struct Progress<'a> {
    /// Completed plus failed trials, including those of earlier runs.
    pub observed: usize,
    /// Dispatched plus running trials, including those of an interrupted
    /// run still waiting to be resubmitted.
    pub in_flight: usize,
    /// Time since this run started.
    pub elapsed: Duration,
    /// Summed relative cost of observed trials.
    pub cost: f64,
    /// Summed relative cost of in-flight trials.
    pub in_flight_cost: f64,
    /// Objectives of feasible completed full-fidelity trials, in observation
    /// order.
    pub objectives: &'a [f64],
    /// The optimization direction.
    pub direction: Direction,
}

/// A set of stop conditions; the first one met ends the run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StopPolicy {
    conditions: Vec<StopCondition>,
}

impl StopPolicy {
    /// A policy with no conditions: the run ends only when the proposer is
    /// exhausted or a stop is requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a condition.
    #[must_use]
    pub fn with(mut self, condition: StopCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Shorthand for [`StopCondition::MaxTrials`].
    #[must_use]
    pub fn max_trials(self, n: usize) -> Self {
        self.with(StopCondition::MaxTrials(n))
    }

    /// Shorthand for [`StopCondition::MaxDuration`].
    #[must_use]
    pub fn max_duration(self, duration: Duration) -> Self {
        self.with(StopCondition::MaxDuration(duration))
    }

    /// Shorthand for [`StopCondition::NoImprovement`].
    #[must_use]
    pub fn no_improvement(self, window: usize, min_delta: f64) -> Self {
        self.with(StopCondition::NoImprovement { window, min_delta })
    }

    /// Shorthand for [`StopCondition::MaxCost`].
    #[must_use]
    pub fn max_cost(self, budget: f64) -> Self {
        self.with(StopCondition::MaxCost(budget))
    }

    /// The configured conditions.
    #[must_use]
    pub fn conditions(&self) -> &[StopCondition] {
        &self.conditions
    }

    /// The trial budget, if one is set.
    #[must_use]
    pub fn trial_budget(&self) -> Option<usize> {
        self.conditions
            .iter()
            .filter_map(|c| match c {
                StopCondition::MaxTrials(n) => Some(*n),
                _ => None,
            })
            .min()
    }

    /// The first budget that forbids proposing one more trial costing
    /// `next_cost`, or `None` if the trial, time and cost budgets all allow
    /// it.
    #[must_use]
    pub fn blocking(&self, progress: &Progress<'_>, next_cost: f64) -> Option<StopReason> {
        self.conditions.iter().find_map(|condition| match condition {
            StopCondition::MaxTrials(n) if progress.observed + progress.in_flight >= *n => {
                Some(StopReason::MaxTrials)
            }
            StopCondition::MaxDuration(limit) if progress.elapsed >= *limit => {
                Some(StopReason::MaxDuration)
            }
            StopCondition::MaxCost(budget)
                if progress.cost + progress.in_flight_cost + next_cost > *budget =>
            {
                Some(StopReason::MaxCost)
            }
            _ => None,
        })
    }

    /// The first condition met, if any.
    #[must_use]
    pub fn check(&self, progress: &Progress<'_>) -> Option<StopReason> {
        self.conditions.iter().find_map(|condition| match condition {
            StopCondition::MaxTrials(n) if progress.observed >= *n => Some(StopReason::MaxTrials),
            StopCondition::MaxDuration(limit) if progress.elapsed >= *limit => {
                Some(StopReason::MaxDuration)
            }
            StopCondition::MaxCost(budget) if progress.cost >= *budget => Some(StopReason::MaxCost),
            StopCondition::NoImprovement { window, min_delta }
                if stalled(progress.objectives, *window, *min_delta, progress.direction) =>
            {
                Some(StopReason::NoImprovement)
            }
            _ => None,
        })
    }
}

/// `true` if the best of the last `window` values does not beat the best
/// before them by more than `min_delta`.
fn stalled(values: &[f64], window: usize, min_delta: f64, direction: Direction) -> bool {
    if window == 0 || values.len() <= window {
        return false;
    }
    let (before, recent) = values.split_at(values.len() - window);
    let best = |vs: &[f64]| {
        vs.iter()
            .copied()
            .reduce(|a, b| if direction.is_better(b, a) { b } else { a })
    };
    match (best(before), best(recent)) {
        (Some(incumbent), Some(candidate)) => {
            direction.improvement(candidate, incumbent) <= min_delta
        }
        _ => false,
    }
}
