use std::collections::VecDeque;

use parking_lot::Mutex;

use super::Proposer;
use crate::parameter::{ParameterPoint, SearchSpace};
use crate::trial::TrialRecord;

/// Multi-fidelity wrapper: every point of the inner proposer is evaluated at
/// each fidelity level, cheapest first.
///
/// Each level becomes its own trial with its own id. Points are released in
/// ladder order, so with a concurrency budget of one the low-fidelity trial
/// of a point always runs before its full-fidelity evaluation.
///
/// # Examples
///
/// ```
/// use picopt::proposer::{FidelityLadder, RandomProposer};
///
/// let proposer = FidelityLadder::new(RandomProposer::with_seed(1), vec![0.2, 1.0]);
/// ```
pub struct FidelityLadder<P> {
    inner: P,
    levels: Vec<f64>,
    pending: Mutex<VecDeque<ParameterPoint>>,
}

impl<P: Proposer> FidelityLadder<P> {
    /// Wrap `inner`, evaluating each of its points at every level.
    ///
    /// Levels are sorted ascending and deduplicated.
    #[must_use]
    pub fn new(inner: P, mut levels: Vec<f64>) -> Self {
        levels.retain(|l| l.is_finite());
        levels.sort_by(f64::total_cmp);
        levels.dedup();
        Self {
            inner,
            levels,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// The fidelity levels, ascending.
    #[must_use]
    pub fn levels(&self) -> &[f64] {
        &self.levels
    }
}

impl<P: Proposer> Proposer for FidelityLadder<P> {
    fn propose(
        &self,
        n: usize,
        space: &SearchSpace,
        history: &[TrialRecord],
    ) -> Vec<ParameterPoint> {
        if self.levels.is_empty() {
            return self.inner.propose(n, space, history);
        }

        let mut pending = self.pending.lock();
        if pending.len() < n {
            let wanted = (n - pending.len()).div_ceil(self.levels.len());
            for point in self.inner.propose(wanted, space, history) {
                for &level in &self.levels {
                    pending.push_back(point.clone().with_fidelity(level));
                }
            }
        }
        let take = n.min(pending.len());
        pending.drain(..take).collect()
    }

    fn observe(&self, records: &[TrialRecord]) {
        self.inner.observe(records);
    }
}
