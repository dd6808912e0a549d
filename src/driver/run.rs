use core::time::Duration;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::Instrument;

use super::{Driver, RunSummary};
use crate::error::{Error, Result};
use crate::execution::{ExecutionEvent, ExecutionReport, JobHandle, JobRequest, ReportSender};
use crate::extraction::{Extraction, Extractor};
use crate::stop::{Progress, StopReason};
use crate::trial::TrialRecord;
use crate::types::{TrialId, TrialStatus};

/// Trials of this run that hold an in-flight slot.
struct Active {
    /// Submitted jobs, by handle.
    jobs: HashMap<JobHandle, TrialId>,
    /// Extractions of finished jobs.
    extractions: JoinSet<(TrialId, Result<Extraction>)>,
    extracting: HashSet<TrialId>,
}

impl Active {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            extractions: JoinSet::new(),
            extracting: HashSet::new(),
        }
    }

    fn len(&self) -> usize {
        self.jobs.len() + self.extracting.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Driver {
    /// Run the optimization loop until a stop condition is met.
    ///
    /// Per-trial failures (invalid points, render errors, execution and
    /// extraction failures) are recorded on the trial and never end the
    /// run. On a stop, no new points are proposed; in-flight trials get the
    /// grace period to finish and are cancelled after it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if a transition cannot be persisted. The
    /// history is then left as of the last acknowledged append, which a
    /// resumed driver reconciles. Any other error for which
    /// [`Error::is_fatal`] holds, such as one returned by a custom execution
    /// manager, also ends the run.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let span = tracing::info_span!(
            "run",
            direction = ?self.direction,
            max_in_flight = self.max_in_flight
        );
        let result = self.run_loop().instrument(span).await;
        self.stop.send_replace(false);
        result
    }

    async fn run_loop(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let first_new = self.next_id;
        let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionReport>();
        let mut stop_rx = self.stop.subscribe();
        let mut active = Active::new();
        let mut reason: Option<StopReason> = None;
        let mut drain_until: Option<Instant> = None;

        if *stop_rx.borrow_and_update() {
            reason = Some(StopReason::Requested);
        }

        loop {
            if reason.is_none() {
                reason = self.fill(started, &tx, &mut active)?;
            }

            if active.is_empty() {
                match reason {
                    Some(_) => break,
                    None => return Err(Error::Internal("driver idle without a stop reason")),
                }
            }

            if let (Some(r), None) = (reason, drain_until) {
                tracing::info!(reason = %r, in_flight = active.len(), "draining");
                drain_until = Some(Instant::now() + self.grace_period);
            }
            let deadline = drain_until.unwrap_or_else(Instant::now);

            tokio::select! {
                report = rx.recv() => {
                    let Some(report) = report else {
                        return Err(Error::Internal("report channel closed"));
                    };
                    if let Some(r) = self.on_report(report, started, &mut active)? {
                        reason.get_or_insert(r);
                    }
                }
                Some(joined) = active.extractions.join_next(), if !active.extractions.is_empty() => {
                    let (id, result) = joined.map_err(|e| Error::TaskError(e.to_string()))?;
                    if active.extracting.remove(&id) {
                        if let Some(r) = self.on_extracted(id, result, started)? {
                            reason.get_or_insert(r);
                        }
                    }
                }
                changed = stop_rx.changed(), if reason.is_none() => {
                    if changed.is_ok() && *stop_rx.borrow_and_update() {
                        tracing::info!("stop requested");
                        reason = Some(StopReason::Requested);
                    }
                }
                () = tokio::time::sleep_until(deadline), if drain_until.is_some() => {
                    self.cancel_all(&mut active)?;
                    break;
                }
            }
        }

        let reason = reason.ok_or(Error::Internal("run ended without a stop reason"))?;
        let summary = RunSummary {
            reason,
            elapsed: started.elapsed(),
            proposed: usize::try_from(self.next_id.0 - first_new.0).unwrap_or(usize::MAX),
            completed: self.count(TrialStatus::Completed),
            failed: self.count(TrialStatus::Failed),
            cancelled: self.count(TrialStatus::Cancelled),
            best: self.best,
        };
        tracing::info!(
            %reason,
            proposed = summary.proposed,
            completed = summary.completed,
            failed = summary.failed,
            best = ?summary.best,
            "run finished"
        );
        Ok(summary)
    }

    /// Dispatch trials until the in-flight budget is used up.
    ///
    /// Returns a stop reason once proposing is over for good: the proposer
    /// is exhausted or a budget forbids the next trial while nothing is in
    /// flight, or a trial that failed before dispatch met a stop condition.
    fn fill(
        &mut self,
        started: Instant,
        tx: &ReportSender,
        active: &mut Active,
    ) -> Result<Option<StopReason>> {
        while active.len() < self.max_in_flight {
            if let Some(id) = self.resubmit.pop_front() {
                if let Some(reason) = self.launch(id, started, tx, active)? {
                    return Ok(Some(reason));
                }
                continue;
            }

            if let Some(reason) = self.policy.blocking(&self.progress(started), 0.0) {
                return Ok(active.is_empty().then_some(reason));
            }

            if self.queued.is_empty() {
                let wanted = self.max_in_flight - active.len();
                let points = self.proposer.propose(wanted, &self.space, &self.ledger);
                if points.is_empty() {
                    return Ok(active.is_empty().then_some(StopReason::ProposerExhausted));
                }
                self.queued.extend(points);
            }
            let Some(raw) = self.queued.pop_front() else {
                continue;
            };

            let point = self.space.complete(&raw);
            let cost = self.space.cost(&point);
            if let Some(reason) = self.policy.blocking(&self.progress(started), cost) {
                self.queued.push_front(raw);
                return Ok(active.is_empty().then_some(reason));
            }

            let id = self.next_id;
            self.next_id = id.next();
            let record = TrialRecord::proposed(id, point);
            self.store.append(&record)?;
            tracing::debug!(trial = %id, point = %record.point(), "trial proposed");
            self.ledger.push(record);

            if let Some(reason) = self.launch(id, started, tx, active)? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    /// Render and submit a proposed trial, or resubmit one left in flight by
    /// an interrupted run under its next attempt.
    ///
    /// The trial is recorded as dispatched only once the executor accepted
    /// the job. A point that fails validation or rendering, or a job the
    /// executor rejects, fails the trial without taking a slot.
    fn launch(
        &mut self,
        id: TrialId,
        started: Instant,
        tx: &ReportSender,
        active: &mut Active,
    ) -> Result<Option<StopReason>> {
        let record = &self.ledger[self.position(id)?];
        let resubmit = record.status().is_in_flight();
        let attempt = if resubmit {
            record.attempt().saturating_add(1)
        } else {
            record.attempt()
        };
        let request = self.render(record).map(|artifact| JobRequest {
            trial_id: id,
            attempt,
            artifact,
            resources: self.resources.clone(),
            fidelity: record.fidelity(),
        });
        let submitted =
            request.and_then(|request| self.executor.submit(request, tx.clone()));

        match submitted {
            Ok(job) => {
                if resubmit {
                    self.update(id, TrialRecord::redispatch)?;
                } else {
                    self.update(id, TrialRecord::dispatch)?;
                }
                active.jobs.insert(job, id);
                tracing::info!(trial = %id, %job, attempt, "trial dispatched");
                Ok(None)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(trial = %id, %reason, "trial failed before running");
                self.update(id, |r| r.fail(reason))?;
                self.observed(id, started)
            }
        }
    }

    fn render(&self, record: &TrialRecord) -> Result<String> {
        self.space.validate(record.point())?;
        let substitutions = self
            .space
            .bind_to_template(record.point(), self.renderer.placeholders())?;
        Ok(self.renderer.render(&substitutions)?)
    }

    fn on_report(
        &mut self,
        report: ExecutionReport,
        started: Instant,
        active: &mut Active,
    ) -> Result<Option<StopReason>> {
        let ExecutionReport { job, event } = report;
        let Some(&id) = active.jobs.get(&job) else {
            tracing::warn!(%job, ?event, "report for an unknown job ignored");
            return Ok(None);
        };

        let reason = match event {
            ExecutionEvent::Started => {
                self.mark_running(id)?;
                return Ok(None);
            }
            ExecutionEvent::Completed { output } => {
                active.jobs.remove(&job);
                self.mark_running(id)?;
                active.extracting.insert(id);
                let task = extract(
                    Arc::clone(&self.extractor),
                    output,
                    self.extraction_timeout,
                );
                active
                    .extractions
                    .spawn(async move { (id, task.await) }.in_current_span());
                tracing::debug!(trial = %id, "extracting objective");
                return Ok(None);
            }
            ExecutionEvent::Failed { reason } => Error::Execution(reason).to_string(),
            ExecutionEvent::TimedOut => Error::Execution("timed out".to_string()).to_string(),
        };

        active.jobs.remove(&job);
        tracing::warn!(trial = %id, %reason, "trial failed");
        self.update(id, |r| r.fail(reason))?;
        self.observed(id, started)
    }

    fn on_extracted(
        &mut self,
        id: TrialId,
        result: Result<Extraction>,
        started: Instant,
    ) -> Result<Option<StopReason>> {
        match result {
            Ok(Extraction { objective, metrics }) if objective.is_finite() => {
                self.update(id, |r| r.complete(objective, metrics))?;
                tracing::info!(trial = %id, objective, "trial completed");
            }
            Ok(Extraction { objective, .. }) => {
                let reason =
                    Error::Extraction(format!("objective is not finite: {objective}")).to_string();
                tracing::warn!(trial = %id, %reason, "trial failed");
                self.update(id, |r| r.fail(reason))?;
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(trial = %id, %reason, "trial failed");
                self.update(id, |r| r.fail(reason))?;
            }
        }
        self.observed(id, started)
    }

    fn mark_running(&mut self, id: TrialId) -> Result<()> {
        if self.ledger[self.position(id)?].status() == TrialStatus::Dispatched {
            self.update(id, TrialRecord::start)?;
            tracing::debug!(trial = %id, "trial running");
        }
        Ok(())
    }

    /// Feed a newly completed or failed trial to the proposer and evaluate
    /// the stop policy.
    fn observed(&mut self, id: TrialId, started: Instant) -> Result<Option<StopReason>> {
        let record = self.ledger[self.position(id)?].clone();
        self.proposer.observe(core::slice::from_ref(&record));

        if self.is_candidate(&record) {
            if let Some(value) = record.objective() {
                self.objectives.push(value);
            }
            if self.consider_best(&record) {
                tracing::info!(trial = %id, value = ?record.objective(), "new best value");
            }
        }

        let reason = self.policy.check(&self.progress(started));
        if let Some(reason) = reason {
            tracing::info!(%reason, "stop condition reached");
        }
        Ok(reason)
    }

    /// Cancel every job and every pending extraction.
    fn cancel_all(&mut self, active: &mut Active) -> Result<()> {
        active.extractions.abort_all();
        let mut pending: Vec<(Option<JobHandle>, TrialId)> = active
            .jobs
            .drain()
            .map(|(job, id)| (Some(job), id))
            .chain(active.extracting.drain().map(|id| (None, id)))
            .collect();
        pending.sort_by_key(|&(_, id)| id);
        for (job, id) in pending {
            if let Some(job) = job {
                self.executor.cancel(job);
            }
            self.update(id, TrialRecord::cancel)?;
            tracing::info!(trial = %id, job = ?job, "trial cancelled");
        }
        Ok(())
    }

    /// Apply a transition to the in-memory record and persist it.
    fn update(
        &mut self,
        id: TrialId,
        transition: impl FnOnce(&mut TrialRecord) -> Result<()>,
    ) -> Result<()> {
        let i = self.position(id)?;
        transition(&mut self.ledger[i])?;
        self.store.append(&self.ledger[i])
    }

    fn progress(&self, started: Instant) -> Progress<'_> {
        let mut progress = Progress {
            observed: 0,
            in_flight: 0,
            elapsed: started.elapsed(),
            cost: 0.0,
            in_flight_cost: 0.0,
            objectives: &self.objectives,
            direction: self.direction,
        };
        for record in &self.ledger {
            let status = record.status();
            if status.is_observed() {
                progress.observed += 1;
                if record.was_dispatched() {
                    progress.cost += self.space.cost(record.point());
                }
            } else if status.is_in_flight() {
                progress.in_flight += 1;
                progress.in_flight_cost += self.space.cost(record.point());
            }
        }
        progress
    }

    fn count(&self, status: TrialStatus) -> usize {
        self.ledger.iter().filter(|r| r.status() == status).count()
    }
}

/// Run the extractor on a blocking thread, bounded by `limit`.
///
/// A timed-out extraction leaves its blocking thread to finish on its own.
async fn extract(
    extractor: Arc<dyn Extractor>,
    output: PathBuf,
    limit: Option<Duration>,
) -> Result<Extraction> {
    let task = tokio::task::spawn_blocking(move || extractor.extract(&output));
    let joined = match limit {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| Error::ExtractionTimeout)?,
        None => task.await,
    };
    joined
        .map_err(|e| Error::TaskError(e.to_string()))?
        .map_err(Error::Extraction)
}
