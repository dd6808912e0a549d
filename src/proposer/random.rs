//! Random proposer implementation.

use parking_lot::Mutex;

use super::{free_variables, Proposer};
use crate::parameter::{ParamValue, ParameterPoint, SearchSpace, VariableKind};
use crate::trial::TrialRecord;

/// Draws per point before an infeasible one is handed out anyway.
const MAX_DRAWS: usize = 100;

/// A proposer that samples every free variable uniformly at random.
///
/// It ignores the trial history and serves as the baseline proposer. Draws
/// that break a parameter constraint of the space are redrawn; a point
/// still infeasible after a hundred draws is proposed as is and
/// fails validation in the driver.
///
/// # Examples
///
/// ```
/// use picopt::proposer::RandomProposer;
///
/// // Create with default RNG
/// let proposer = RandomProposer::new();
///
/// // Create with a fixed seed for reproducibility
/// let proposer = RandomProposer::with_seed(42);
/// ```
pub struct RandomProposer {
    rng: Mutex<fastrand::Rng>,
}

impl RandomProposer {
    /// Creates a new random proposer with a default random seed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Creates a new random proposer with a fixed seed for reproducibility.
    ///
    /// Using the same seed will produce the same sequence of points.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for RandomProposer {
    fn default() -> Self {
        Self::new()
    }
}

impl Proposer for RandomProposer {
    fn propose(
        &self,
        n: usize,
        space: &SearchSpace,
        _history: &[TrialRecord],
    ) -> Vec<ParameterPoint> {
        let mut rng = self.rng.lock();
        let mut draw = || -> ParameterPoint {
            free_variables(space)
                .map(|spec| (spec.name.clone(), sample(&mut rng, &spec.kind)))
                .collect()
        };
        (0..n)
            .map(|_| {
                let mut point = draw();
                for _ in 1..MAX_DRAWS {
                    if space.satisfies_constraints(&space.complete(&point)) {
                        break;
                    }
                    point = draw();
                }
                point
            })
            .collect()
    }
}

fn sample(rng: &mut fastrand::Rng, kind: &VariableKind) -> ParamValue {
    match kind {
        VariableKind::Continuous { lower, upper } => {
            ParamValue::Float(lower + rng.f64() * (upper - lower))
        }
        VariableKind::Integer { lower, upper } => ParamValue::Int(rng.i64(*lower..=*upper)),
        VariableKind::Categorical { choices } => {
            ParamValue::Categorical(choices[rng.usize(0..choices.len())].clone())
        }
    }
}
