//! Quasi-random proposer using Sobol low-discrepancy sequences.
//!
//! [`SobolProposer`] draws points from a Sobol sequence (scrambled via the
//! Burley 2020 algorithm) to cover the search space more evenly than
//! uniform random sampling.
//!
//! Each proposal takes the next sequence index and each free variable maps
//! to its own Sobol dimension, in declaration order. The index never falls
//! behind the number of trials in the history, so a resumed run continues
//! the sequence instead of repeating it.

use parking_lot::Mutex;
use sobol_burley::sample;

use super::{free_variables, map_unit, Proposer};
use crate::parameter::{ParameterPoint, SearchSpace};
use crate::trial::TrialRecord;

/// Quasi-random proposer using a scrambled Sobol sequence.
///
/// Sobol sequences are most effective in moderate dimensions (up to ~20).
///
/// # Examples
///
/// ```
/// use picopt::proposer::SobolProposer;
///
/// let proposer = SobolProposer::with_seed(42);
/// ```
pub struct SobolProposer {
    seed: u32,
    next_index: Mutex<u32>,
}

impl SobolProposer {
    /// Creates a new Sobol proposer with a default seed of 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Creates a new Sobol proposer with the given seed.
    ///
    /// Different seeds produce statistically independent sequences.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed: seed as u32,
            next_index: Mutex::new(0),
        }
    }
}

impl Default for SobolProposer {
    fn default() -> Self {
        Self::new()
    }
}

impl Proposer for SobolProposer {
    #[allow(clippy::cast_possible_truncation)]
    fn propose(
        &self,
        n: usize,
        space: &SearchSpace,
        history: &[TrialRecord],
    ) -> Vec<ParameterPoint> {
        let mut next = self.next_index.lock();
        let start = (*next).max(history.len() as u32);
        let points = (0..n as u32)
            .map(|offset| {
                let index = start + offset;
                free_variables(space)
                    .enumerate()
                    .map(|(dim, spec)| {
                        let u = f64::from(sample(index, dim as u32, self.seed));
                        (spec.name.clone(), map_unit(u, &spec.kind))
                    })
                    .collect()
            })
            .collect();
        *next = start + n as u32;
        points
    }
}
