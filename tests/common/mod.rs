//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use picopt::execution::{
    ExecutionEvent, ExecutionManager, ExecutionReport, JobHandle, JobRequest, ReportSender,
};
use picopt::parameter::{FidelitySpec, ParameterPoint, SearchSpace, VariableSpec};
use picopt::proposer::Proposer;
use picopt::template::Template;
use picopt::trial::TrialRecord;
use picopt::{Error, TrialId};

/// What the scripted executor does with one submission.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Script {
    Complete,
    Fail(&'static str),
    TimeOut,
    /// Report `Started` and then nothing until cancelled.
    Hang,
    /// Refuse the submission.
    Reject,
    /// Refuse the submission with an error that must end the run.
    RejectFatal,
}

/// A submission as seen by the executor.
#[derive(Clone, Debug)]
pub struct Submission {
    pub trial: TrialId,
    pub attempt: u32,
    pub fidelity: Option<f64>,
    pub artifact: String,
    pub job: JobHandle,
}

#[derive(Default)]
struct ExecutorState {
    next: u64,
    active: usize,
    max_active: usize,
    submissions: Vec<Submission>,
    cancelled: Vec<JobHandle>,
}

/// Execution manager that follows a per-request script and records what it
/// was asked to do. Clones share state.
///
/// A completed job's output path is the trial id, so extractors can tell
/// trials apart with [`trial_of`].
#[derive(Clone)]
pub struct ScriptedExecutor {
    script: Arc<dyn Fn(&JobRequest) -> Script + Send + Sync>,
    delay: Arc<dyn Fn(&JobRequest) -> Duration + Send + Sync>,
    state: Arc<Mutex<ExecutorState>>,
}

impl ScriptedExecutor {
    pub fn new(script: impl Fn(&JobRequest) -> Script + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            delay: Arc::new(|_: &JobRequest| Duration::ZERO),
            state: Arc::new(Mutex::new(ExecutorState::default())),
        }
    }

    /// Completes every job.
    pub fn completing() -> Self {
        Self::new(|_| Script::Complete)
    }

    /// Wait `delay` between `Started` and the terminal report.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delays(move |_| delay)
    }

    /// Like [`with_delay`](Self::with_delay), chosen per request.
    pub fn with_delays(
        mut self,
        delay: impl Fn(&JobRequest) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.delay = Arc::new(delay);
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    pub fn submitted_trials(&self) -> Vec<u64> {
        self.state
            .lock()
            .submissions
            .iter()
            .map(|s| s.trial.0)
            .collect()
    }

    /// Largest number of jobs that were running at once.
    pub fn max_active(&self) -> usize {
        self.state.lock().max_active
    }

    pub fn cancelled(&self) -> Vec<JobHandle> {
        self.state.lock().cancelled.clone()
    }
}

impl ExecutionManager for ScriptedExecutor {
    fn submit(&self, request: JobRequest, reports: ReportSender) -> picopt::Result<JobHandle> {
        let script = (self.script)(&request);
        match script {
            Script::Reject => return Err(Error::Execution("no free workers".to_string())),
            Script::RejectFatal => {
                return Err(Error::Storage {
                    path: PathBuf::from("/scratch/queue.db"),
                    reason: "disk full".to_string(),
                })
            }
            _ => {}
        }

        let job = {
            let mut state = self.state.lock();
            let job = JobHandle(state.next);
            state.next += 1;
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            state.submissions.push(Submission {
                trial: request.trial_id,
                attempt: request.attempt,
                fidelity: request.fidelity,
                artifact: request.artifact.clone(),
                job,
            });
            job
        };

        let state = Arc::clone(&self.state);
        let delay = (self.delay)(&request);
        let output = PathBuf::from(request.trial_id.0.to_string());
        tokio::spawn(async move {
            let _ = reports.send(ExecutionReport::new(job, ExecutionEvent::Started));
            let event = match script {
                Script::Complete => ExecutionEvent::Completed { output },
                Script::Fail(reason) => ExecutionEvent::Failed {
                    reason: reason.to_string(),
                },
                Script::TimeOut => ExecutionEvent::TimedOut,
                Script::Hang | Script::Reject | Script::RejectFatal => return,
            };
            tokio::time::sleep(delay).await;
            state.lock().active -= 1;
            let _ = reports.send(ExecutionReport::new(job, event));
        });
        Ok(job)
    }

    fn cancel(&self, job: JobHandle) {
        let mut state = self.state.lock();
        state.cancelled.push(job);
        state.active = state.active.saturating_sub(1);
    }
}

/// The trial id a [`ScriptedExecutor`] output path belongs to.
pub fn trial_of(output: &Path) -> u64 {
    output.to_string_lossy().parse().unwrap()
}

/// Proposer that hands out a fixed list of points, then optionally repeats
/// one point forever. Records every observation.
pub struct ScriptedProposer {
    points: Mutex<VecDeque<ParameterPoint>>,
    repeat: Option<ParameterPoint>,
    observed: Arc<Mutex<Vec<TrialRecord>>>,
}

impl ScriptedProposer {
    /// Proposes `point` every time.
    pub fn constant(point: ParameterPoint) -> Self {
        Self {
            points: Mutex::new(VecDeque::new()),
            repeat: Some(point),
            observed: Arc::default(),
        }
    }

    /// Proposes each of `points` once and is exhausted after.
    pub fn sequence(points: Vec<ParameterPoint>) -> Self {
        Self {
            points: Mutex::new(points.into()),
            repeat: None,
            observed: Arc::default(),
        }
    }

    /// Shared handle on the observations; stays valid after the proposer
    /// moves into a driver.
    pub fn observations(&self) -> Arc<Mutex<Vec<TrialRecord>>> {
        Arc::clone(&self.observed)
    }
}

impl Proposer for ScriptedProposer {
    fn propose(
        &self,
        n: usize,
        _space: &SearchSpace,
        _history: &[TrialRecord],
    ) -> Vec<ParameterPoint> {
        let mut points = self.points.lock();
        let take = n.min(points.len());
        let mut out: Vec<_> = points.drain(..take).collect();
        if let Some(point) = &self.repeat {
            out.resize(n, point.clone());
        }
        out
    }

    fn observe(&self, records: &[TrialRecord]) {
        self.observed.lock().extend_from_slice(records);
    }
}

/// `x` continuous in [0, 1], `y` integer in [0, 10].
pub fn space_xy() -> SearchSpace {
    SearchSpace::new(
        vec![
            VariableSpec::continuous("x", 0.0, 1.0),
            VariableSpec::integer("y", 0, 10),
        ],
        None,
    )
    .unwrap()
}

pub fn template_xy() -> Template {
    Template::parse("x = {{ x }}\ny = {{ y }}\n").unwrap()
}

/// [`space_xy`] plus a `res` fidelity axis in [0.2, 1.0] with linear cost.
pub fn space_xy_res() -> SearchSpace {
    SearchSpace::new(
        vec![
            VariableSpec::continuous("x", 0.0, 1.0),
            VariableSpec::integer("y", 0, 10),
        ],
        Some(FidelitySpec::new("res", 0.2, 1.0)),
    )
    .unwrap()
}

pub fn template_xy_res() -> Template {
    Template::parse("x = {{ x }}\ny = {{ y }}\nres = {{ res }}\n").unwrap()
}

pub fn point(x: f64, y: i64) -> ParameterPoint {
    ParameterPoint::new().with("x", x).with("y", y)
}
