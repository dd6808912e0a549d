use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use picopt::stop::{StopPolicy, StopReason};
use picopt::storage::{read_journal, HistoryStore, MemoryStorage};
use picopt::trial::TrialRecord;
use picopt::{Driver, Error, TrialId, TrialStatus};

use crate::common::{
    point, space_xy, template_xy, Script, ScriptedExecutor, ScriptedProposer,
};

fn record(id: u64, status: TrialStatus) -> TrialRecord {
    let mut record = TrialRecord::proposed(TrialId(id), point(0.1 * id as f64, 1));
    if status == TrialStatus::Proposed {
        return record;
    }
    record.dispatch().unwrap();
    if status == TrialStatus::Dispatched {
        return record;
    }
    record.start().unwrap();
    match status {
        TrialStatus::Completed => record.complete(id as f64, BTreeMap::new()).unwrap(),
        TrialStatus::Failed => record.fail("exit code 1").unwrap(),
        _ => {}
    }
    record
}

/// The log of a process killed with 3 completed, 2 failed, trials 5 and 6
/// in flight and trial 7 proposed but never dispatched.
fn interrupted_log() -> Vec<TrialRecord> {
    vec![
        record(0, TrialStatus::Completed),
        record(1, TrialStatus::Completed),
        record(2, TrialStatus::Failed),
        record(3, TrialStatus::Completed),
        record(4, TrialStatus::Failed),
        record(5, TrialStatus::Running),
        record(6, TrialStatus::Dispatched),
        record(7, TrialStatus::Proposed),
    ]
}

#[tokio::test]
async fn test_resume_redispatches_in_flight_trials_without_reusing_ids() {
    let store = Arc::new(MemoryStorage::with_log(interrupted_log()));
    let executor = ScriptedExecutor::completing();
    let proposer = ScriptedProposer::constant(point(0.5, 5));
    let observed = proposer.observations();

    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(proposer)
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(10.0))
        .storage(Arc::clone(&store))
        .stop(StopPolicy::new().max_trials(8))
        .build()
        .unwrap();

    // Reconciled before anything runs.
    let ids: Vec<_> = observed.lock().iter().map(|r| r.id().0).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    // Trials 5 and 6 wait for a slot; their records are untouched until then.
    assert_eq!(driver.in_flight(), 0);
    assert_eq!(driver.pending_resubmits(), vec![TrialId(5), TrialId(6)]);
    assert_eq!(
        driver.trial(TrialId(5)).unwrap().status(),
        TrialStatus::Running
    );
    assert_eq!(
        driver.trial(TrialId(6)).unwrap().status(),
        TrialStatus::Dispatched
    );
    assert!(driver
        .history()
        .records()
        .iter()
        .all(|r| r.attempt() == 1));
    assert_eq!(
        driver.trial(TrialId(7)).unwrap().status(),
        TrialStatus::Cancelled
    );
    // Minimize: trial 0 completed with objective 0.0.
    assert_eq!(driver.best(), Some((TrialId(0), 0.0)));

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxTrials);
    assert_eq!(summary.proposed, 1);

    let submissions = executor.submissions();
    let attempts: Vec<_> = submissions.iter().map(|s| (s.trial.0, s.attempt)).collect();
    assert_eq!(attempts, vec![(5, 2), (6, 2), (8, 1)]);

    let history = driver.history();
    assert_eq!(history.len(), 9);
    assert_eq!(history.count(TrialStatus::Completed), 6);
    assert_eq!(history.count(TrialStatus::Failed), 2);
    assert_eq!(history.count(TrialStatus::Cancelled), 1);
    assert_eq!(history.get(TrialId(5)).unwrap().objective(), Some(10.0));

    // The store agrees with the driver.
    assert_eq!(store.load().unwrap().records(), history.records());
}

#[tokio::test]
async fn test_stop_before_run_keeps_resubmits_pending() {
    let store = Arc::new(MemoryStorage::with_log(interrupted_log()));
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .storage(Arc::clone(&store))
        .build()
        .unwrap();

    driver.stop_handle().stop();
    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::Requested);
    assert!(executor.submissions().is_empty());

    // Nothing was submitted, so nothing was recorded as dispatched.
    let snapshot = store.load().unwrap();
    for id in [5, 6] {
        let trial = snapshot.get(TrialId(id)).unwrap();
        assert!(trial.status().is_in_flight());
        assert_eq!(trial.attempt(), 1);
    }

    // A later driver resubmits them as the second attempt.
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .storage(Arc::clone(&store))
        .stop(StopPolicy::new().max_trials(7))
        .build()
        .unwrap();
    assert_eq!(driver.trial(TrialId(5)).unwrap().attempt(), 1);
    driver.run().await.unwrap();
    let attempts: Vec<_> = executor
        .submissions()
        .iter()
        .map(|s| (s.trial.0, s.attempt))
        .collect();
    assert_eq!(attempts, vec![(5, 2), (6, 2)]);
    assert_eq!(driver.trial(TrialId(5)).unwrap().attempt(), 2);
}

#[tokio::test]
async fn test_resubmits_respect_the_in_flight_budget() {
    let log: Vec<TrialRecord> = (0..3).map(|id| record(id, TrialStatus::Running)).collect();
    let store = Arc::new(MemoryStorage::with_log(log.clone()));
    let executor = ScriptedExecutor::completing().with_delay(Duration::from_millis(20));

    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .storage(Arc::clone(&store))
        .max_in_flight(1)
        .stop(StopPolicy::new().max_trials(3))
        .build()
        .unwrap();

    assert!(driver.in_flight() <= 1);
    assert_eq!(driver.pending_resubmits().len(), 3);
    assert_eq!(store.load().unwrap().records(), log.as_slice());

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxTrials);
    assert_eq!(summary.proposed, 0);
    assert_eq!(executor.max_active(), 1);
    let attempts: Vec<_> = executor
        .submissions()
        .iter()
        .map(|s| (s.trial.0, s.attempt))
        .collect();
    assert_eq!(attempts, vec![(0, 2), (1, 2), (2, 2)]);

    // Each trial was redispatched only once it had a slot, so the ledger
    // never showed more than one resubmitted trial in flight.
    let history = store.load().unwrap();
    assert_eq!(history.count(TrialStatus::Completed), 3);
    let mut spans: Vec<_> = history
        .records()
        .iter()
        .map(|r| {
            (
                r.entered(TrialStatus::Dispatched).unwrap(),
                r.entered(TrialStatus::Completed).unwrap(),
            )
        })
        .collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping trials: {pair:?}");
    }
}

#[tokio::test]
async fn test_journal_resume_continues_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let build = |trials: usize, executor: ScriptedExecutor| {
        Driver::builder()
            .space(space_xy())
            .template(template_xy())
            .proposer(ScriptedProposer::constant(point(0.5, 5)))
            .executor(executor)
            .extractor(|_: &Path| Ok::<_, String>(1.0))
            .journal(&path)
            .stop(StopPolicy::new().max_trials(trials))
            .build()
            .unwrap()
    };

    {
        let mut first = build(3, ScriptedExecutor::completing());
        first.run().await.unwrap();
    }

    let executor = ScriptedExecutor::completing();
    let mut second = build(5, executor.clone());
    assert_eq!(second.history().len(), 3);
    let summary = second.run().await.unwrap();
    assert_eq!(summary.proposed, 2);
    assert_eq!(executor.submitted_trials(), vec![3, 4]);

    let (_, snapshot) = read_journal(&path).unwrap();
    let ids: Vec<_> = snapshot.records().iter().map(|r| r.id().0).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    assert_eq!(snapshot.count(TrialStatus::Completed), 5);
}

#[tokio::test]
async fn test_interrupted_journal_run_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    // First process: trial 1 hangs and the run is stopped with no grace,
    // which cancels it. Trial 0 completes.
    {
        let executor = ScriptedExecutor::new(|req| {
            if req.trial_id == TrialId(1) {
                Script::Hang
            } else {
                Script::Complete
            }
        });
        let mut driver = Driver::builder()
            .space(space_xy())
            .template(template_xy())
            .proposer(ScriptedProposer::constant(point(0.5, 5)))
            .executor(executor)
            .extractor(|_: &Path| Ok::<_, String>(1.0))
            .journal(&path)
            .grace_period(std::time::Duration::ZERO)
            .stop(StopPolicy::new().max_trials(5))
            .build()
            .unwrap();
        let stop = driver.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            stop.stop();
        });
        let summary = driver.run().await.unwrap();
        assert_eq!(summary.reason, StopReason::Requested);
    }

    let (_, snapshot) = read_journal(&path).unwrap();
    assert_eq!(
        snapshot.get(TrialId(1)).unwrap().status(),
        TrialStatus::Cancelled
    );

    // Cancelled trials are not counted against the budget.
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .journal(&path)
        .stop(StopPolicy::new().max_trials(3))
        .build()
        .unwrap();
    driver.run().await.unwrap();
    assert_eq!(executor.submitted_trials(), vec![2, 3]);
}

#[test]
fn test_second_driver_on_same_journal_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let build = || {
        Driver::builder()
            .space(space_xy())
            .template(template_xy())
            .executor(ScriptedExecutor::completing())
            .extractor(|_: &Path| Ok::<_, String>(1.0))
            .journal(&path)
            .build()
    };

    let first = build().unwrap();
    let err = build().unwrap_err();
    assert!(matches!(err, Error::LockConflict { .. }));
    assert!(!err.to_string().is_empty());

    drop(first);
    build().unwrap();
}

#[test]
fn test_history_for_other_space_or_direction_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    drop(
        Driver::builder()
            .space(space_xy())
            .template(template_xy())
            .executor(ScriptedExecutor::completing())
            .extractor(|_: &Path| Ok::<_, String>(1.0))
            .journal(&path)
            .build()
            .unwrap(),
    );

    let wider = picopt::parameter::SearchSpace::new(
        vec![
            picopt::parameter::VariableSpec::continuous("x", 0.0, 2.0),
            picopt::parameter::VariableSpec::integer("y", 0, 10),
        ],
        None,
    )
    .unwrap();
    let err = Driver::builder()
        .space(wider)
        .template(template_xy())
        .executor(ScriptedExecutor::completing())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .journal(&path)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::IncompatibleHistory { .. }));

    let err = Driver::builder()
        .maximize()
        .space(space_xy())
        .template(template_xy())
        .executor(ScriptedExecutor::completing())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .journal(&path)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::IncompatibleHistory { .. }));
}
