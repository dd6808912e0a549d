use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::process::Command;
use tokio::task::AbortHandle;

use super::{ExecutionEvent, ExecutionManager, ExecutionReport, JobHandle, JobRequest, ReportSender};
use crate::error::{Error, Result};
use crate::types::TrialId;

/// Runs each simulation as a child process on the local machine.
///
/// Every job gets its own directory under the work directory
/// (`trial_00042`, or `trial_00042_r2` for a re-dispatched attempt). The
/// rendered artifact is written there as the input file, the command runs
/// with that directory as its working directory, and its stdout and stderr
/// are captured to `stdout.log` and `stderr.log`. On success the directory
/// is reported as the output location.
///
/// The child sees `PICOPT_TRIAL_ID`, `PICOPT_ATTEMPT`, `PICOPT_WORKERS`,
/// `PICOPT_GPUS` and, for multi-fidelity runs, `PICOPT_FIDELITY`.
///
/// # Examples
///
/// ```no_run
/// use core::time::Duration;
///
/// use picopt::execution::LocalExecutor;
///
/// let executor = LocalExecutor::new("runs", "mpirun")
///     .args(["-n", "4", "warpx.3d", "inputs"])
///     .timeout(Duration::from_secs(3600));
/// ```
pub struct LocalExecutor {
    workdir: PathBuf,
    program: String,
    args: Vec<String>,
    input_file: String,
    timeout: Option<Duration>,
    next_handle: AtomicU64,
    running: Arc<Mutex<HashMap<JobHandle, AbortHandle>>>,
}

impl LocalExecutor {
    /// Run `program` for each job, with trial directories under `workdir`.
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            program: program.into(),
            args: Vec::new(),
            input_file: "inputs".to_string(),
            timeout: None,
            next_handle: AtomicU64::new(0),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// File name the rendered artifact is written to. Default: `inputs`.
    #[must_use]
    pub fn input_file(mut self, name: impl Into<String>) -> Self {
        self.input_file = name.into();
        self
    }

    /// Wall-clock limit per simulation; exceeding it kills the process and
    /// reports [`ExecutionEvent::TimedOut`].
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The directory a trial attempt runs in.
    #[must_use]
    pub fn trial_dir(&self, trial_id: TrialId, attempt: u32) -> PathBuf {
        let name = if attempt > 1 {
            format!("trial_{:05}_r{attempt}", trial_id.0)
        } else {
            format!("trial_{:05}", trial_id.0)
        };
        self.workdir.join(name)
    }

    /// Number of jobs currently running.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.lock().len()
    }

    fn command(&self, request: &JobRequest, dir: &Path) -> Result<Command> {
        let log = |name: &str| {
            std::fs::File::create(dir.join(name))
                .map(Stdio::from)
                .map_err(|e| Error::Execution(format!("cannot create {name}: {e}")))
        };

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(dir)
            .env("PICOPT_TRIAL_ID", request.trial_id.to_string())
            .env("PICOPT_ATTEMPT", request.attempt.to_string())
            .env("PICOPT_WORKERS", request.resources.workers.to_string())
            .env("PICOPT_GPUS", request.resources.gpus.to_string())
            .stdin(Stdio::null())
            .stdout(log("stdout.log")?)
            .stderr(log("stderr.log")?)
            .kill_on_drop(true);
        if let Some(fidelity) = request.fidelity {
            command.env("PICOPT_FIDELITY", fidelity.to_string());
        }
        Ok(command)
    }
}

impl ExecutionManager for LocalExecutor {
    fn submit(&self, request: JobRequest, reports: ReportSender) -> Result<JobHandle> {
        let dir = self.trial_dir(request.trial_id, request.attempt);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Execution(format!("cannot create {}: {e}", dir.display())))?;
        std::fs::write(dir.join(&self.input_file), &request.artifact)
            .map_err(|e| Error::Execution(format!("cannot write input file: {e}")))?;
        let mut command = self.command(&request, &dir)?;

        let job = JobHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let timeout = self.timeout;
        let running = Arc::clone(&self.running);
        let trial_id = request.trial_id;

        // Hold the map lock across spawn so the task cannot deregister
        // itself before it is registered.
        let mut guard = self.running.lock();
        let task = tokio::spawn(async move {
            let event = run(&mut command, dir, timeout, job, &reports).await;
            running.lock().remove(&job);
            if let ExecutionEvent::Failed { reason } = &event {
                tracing::debug!(trial = %trial_id, %job, %reason, "local job failed");
            }
            let _ = reports.send(ExecutionReport::new(job, event));
        });
        guard.insert(job, task.abort_handle());
        drop(guard);

        Ok(job)
    }

    fn cancel(&self, job: JobHandle) {
        if let Some(task) = self.running.lock().remove(&job) {
            // Dropping the task drops the child, which kills it.
            task.abort();
            tracing::debug!(%job, "cancelled local job");
        }
    }
}

async fn run(
    command: &mut Command,
    output: PathBuf,
    timeout: Option<Duration>,
    job: JobHandle,
    reports: &ReportSender,
) -> ExecutionEvent {
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecutionEvent::Failed {
                reason: format!("failed to start simulation: {e}"),
            }
        }
    };
    let _ = reports.send(ExecutionReport::new(job, ExecutionEvent::Started));

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.kill().await;
                return ExecutionEvent::TimedOut;
            }
        },
        None => child.wait().await,
    };

    match status {
        Ok(status) if status.success() => ExecutionEvent::Completed { output },
        Ok(status) => ExecutionEvent::Failed {
            reason: format!("simulation exited with {status}"),
        },
        Err(e) => ExecutionEvent::Failed {
            reason: format!("failed to wait for simulation: {e}"),
        },
    }
}
