//! Proposer trait and implementations.
//!
//! A proposer suggests the next parameter points to evaluate. The driver
//! only ever talks to it through [`Proposer`], so any search algorithm can be
//! plugged in.
//!
//! # Available proposers
//!
//! | Proposer | Algorithm | Uses history |
//! |----------|-----------|--------------|
//! | [`RandomProposer`] | Uniform random sampling | No |
//! | [`SobolProposer`] | Scrambled Sobol low-discrepancy sequence | Trial count only |
//! | [`FidelityLadder`] | Evaluates every point of an inner proposer at several fidelities | Delegates |
//!
//! # Contract
//!
//! - Points need not assign fixed variables or a fidelity; the driver
//!   completes them against the search space before validation.
//! - Points that fail validation are recorded as failed trials and fed back
//!   through [`observe`](Proposer::observe), never silently dropped.
//! - Returning no points while nothing is in flight ends the run.
//! - [`observe`](Proposer::observe) only ever sees records that are already
//!   durable in the history. On resume it is called once with every
//!   completed and failed record of the previous run.

mod ladder;
mod random;
mod sobol;

pub use ladder::FidelityLadder;
pub use random::RandomProposer;
pub use sobol::SobolProposer;

use crate::parameter::{ParamValue, ParameterPoint, SearchSpace, VariableKind};
use crate::trial::TrialRecord;

/// Suggests parameter points for evaluation.
///
/// Implementations take `&self` and are `Send + Sync`; use interior
/// mutability (e.g. `parking_lot::Mutex`) for RNG or model state.
pub trait Proposer: Send + Sync {
    /// Suggest up to `n` new points.
    ///
    /// `history` holds every trial known to the driver, in id order,
    /// including in-flight ones.
    fn propose(&self, n: usize, space: &SearchSpace, history: &[TrialRecord])
        -> Vec<ParameterPoint>;

    /// Receive newly observed (completed or failed) trials.
    ///
    /// The default implementation ignores them.
    fn observe(&self, records: &[TrialRecord]) {
        let _ = records;
    }
}

impl<P: Proposer + ?Sized> Proposer for std::sync::Arc<P> {
    fn propose(
        &self,
        n: usize,
        space: &SearchSpace,
        history: &[TrialRecord],
    ) -> Vec<ParameterPoint> {
        (**self).propose(n, space, history)
    }

    fn observe(&self, records: &[TrialRecord]) {
        (**self).observe(records);
    }
}

/// Map a uniform `u` in `[0, 1)` onto a variable's domain.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub(crate) fn map_unit(u: f64, kind: &VariableKind) -> ParamValue {
    match kind {
        VariableKind::Continuous { lower, upper } => {
            ParamValue::Float((lower + u * (upper - lower)).clamp(*lower, *upper))
        }
        VariableKind::Integer { lower, upper } => {
            // Widened so that the full i64 range does not overflow.
            let width = i128::from(*upper) - i128::from(*lower) + 1;
            let k = (u * width as f64).floor() as i128;
            let value = (i128::from(*lower) + k).clamp(i128::from(*lower), i128::from(*upper));
            ParamValue::Int(i64::try_from(value).unwrap_or(*upper))
        }
        VariableKind::Categorical { choices } => {
            let index = ((u * choices.len() as f64).floor() as usize).min(choices.len() - 1);
            ParamValue::Categorical(choices[index].clone())
        }
    }
}

/// Variables a proposer has to choose values for (not fixed).
pub(crate) fn free_variables(
    space: &SearchSpace,
) -> impl Iterator<Item = &crate::parameter::VariableSpec> {
    space.variables().iter().filter(|v| v.fixed.is_none())
}
