//! The ensemble execution manager contract.
//!
//! The driver hands a rendered input artifact to an [`ExecutionManager`]
//! and gets a [`JobHandle`] back. Everything after that is asynchronous: the
//! manager sends [`ExecutionReport`]s on the channel it was given, in any
//! order across jobs, and the driver maps each report back to its trial via
//! the handle.
//!
//! [`LocalExecutor`] runs the simulation as a child process on this machine.
//! Cluster backends (Slurm, PBS, a workflow engine) implement the same trait.

mod local;

use core::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use local::LocalExecutor;

use crate::types::TrialId;

/// Compute resources requested for one simulation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    /// Number of workers (MPI ranks, nodes, ... as the backend defines).
    pub workers: u32,
    /// Number of GPUs.
    pub gpus: u32,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            workers: 1,
            gpus: 0,
        }
    }
}

/// One simulation to run.
#[derive(Clone, Debug)]
pub struct JobRequest {
    /// The trial this job evaluates.
    pub trial_id: TrialId,
    /// Submission attempt of the trial (greater than 1 after a resume).
    pub attempt: u32,
    /// The rendered simulation input.
    pub artifact: String,
    /// Requested resources.
    pub resources: ResourceRequest,
    /// The fidelity the trial runs at, if any.
    pub fidelity: Option<f64>,
}

/// Identifies a submitted job within one execution manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle(pub u64);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// What happened to a job.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionEvent {
    /// The job was scheduled onto a worker.
    Started,
    /// The simulation finished; its output lives at `output`.
    Completed {
        /// Output location handed to the extraction adapter.
        output: PathBuf,
    },
    /// The job could not be scheduled or the simulation failed.
    Failed {
        /// Why.
        reason: String,
    },
    /// The job exceeded its wall-clock limit.
    TimedOut,
}

/// An asynchronous report from the execution manager.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionReport {
    /// The job the report is about.
    pub job: JobHandle,
    /// What happened.
    pub event: ExecutionEvent,
}

impl ExecutionReport {
    /// Shorthand constructor.
    #[must_use]
    pub fn new(job: JobHandle, event: ExecutionEvent) -> Self {
        Self { job, event }
    }
}

/// Channel on which an execution manager reports job events.
pub type ReportSender = mpsc::UnboundedSender<ExecutionReport>;

/// Schedules rendered simulations onto compute workers.
///
/// `submit` must return promptly; the run itself proceeds in the
/// background and is reported through `reports`. At most one terminal event
/// (`Completed`, `Failed` or `TimedOut`) may be sent per handle; the driver
/// ignores anything after it.
pub trait ExecutionManager: Send + Sync {
    /// Submit a job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Execution`](crate::Error::Execution) if the job
    /// cannot be accepted. The trial then fails without running.
    fn submit(&self, request: JobRequest, reports: ReportSender) -> crate::Result<JobHandle>;

    /// Ask the manager to stop a job. Best effort; the driver records the
    /// trial as cancelled whether or not the remote side stops.
    fn cancel(&self, job: JobHandle) {
        let _ = job;
    }
}

impl<M: ExecutionManager + ?Sized> ExecutionManager for std::sync::Arc<M> {
    fn submit(&self, request: JobRequest, reports: ReportSender) -> crate::Result<JobHandle> {
        (**self).submit(request, reports)
    }

    fn cancel(&self, job: JobHandle) {
        (**self).cancel(job);
    }
}
