use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use picopt::proposer::RandomProposer;
use picopt::stop::{StopPolicy, StopReason};
use picopt::{Driver, TrialId, TrialStatus};

use crate::common::{
    point, space_xy, template_xy, trial_of, ScriptedExecutor, ScriptedProposer,
};

#[tokio::test]
async fn test_in_flight_budget_is_used_but_never_exceeded() {
    let executor = ScriptedExecutor::completing().with_delay(Duration::from_millis(20));
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .max_in_flight(3)
        .stop(StopPolicy::new().max_trials(10))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxTrials);
    assert_eq!(summary.completed, 10);
    assert_eq!(executor.max_active(), 3);
    // The trial budget counts in-flight trials, so nothing overshoots.
    assert_eq!(driver.history().len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_trials_get_unique_increasing_ids() {
    let executor = ScriptedExecutor::completing().with_delay(Duration::from_millis(5));
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(RandomProposer::with_seed(42))
        .executor(executor.clone())
        .extractor(|out: &Path| Ok::<_, String>(trial_of(out) as f64))
        .max_in_flight(4)
        .stop(StopPolicy::new().max_trials(25))
        .build()
        .unwrap();

    driver.run().await.unwrap();

    let history = driver.history();
    let ids: Vec<u64> = history.records().iter().map(|r| r.id().0).collect();
    assert_eq!(ids, (0..25).collect::<Vec<_>>());
    assert!(history
        .records()
        .iter()
        .all(|r| r.status() == TrialStatus::Completed));

    let submitted: BTreeSet<u64> = executor.submitted_trials().into_iter().collect();
    assert_eq!(submitted.len(), 25);
    assert!(executor.max_active() <= 4);
    assert_eq!(driver.in_flight(), 0);
}

#[tokio::test]
async fn test_every_submission_is_a_valid_rendered_point() {
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(RandomProposer::with_seed(7))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(0.0))
        .max_in_flight(2)
        .stop(StopPolicy::new().max_trials(12))
        .build()
        .unwrap();

    driver.run().await.unwrap();

    let history = driver.history();
    for submission in executor.submissions() {
        let record = history.get(submission.trial).unwrap();
        driver.space().validate(record.point()).unwrap();
        assert!(submission.artifact.starts_with("x = "));
        assert!(!submission.artifact.contains("{{"));
    }
}

#[tokio::test]
async fn test_equal_objectives_keep_the_earliest_trial_as_best() {
    // Trial 1 finishes well before trial 0 with the same objective.
    let executor = ScriptedExecutor::completing().with_delays(|req| {
        if req.trial_id == TrialId(0) {
            Duration::from_millis(300)
        } else {
            Duration::from_millis(10)
        }
    });
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor)
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .max_in_flight(2)
        .stop(StopPolicy::new().max_trials(2))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    let history = driver.history();
    let first = history.get(TrialId(0)).unwrap().entered(TrialStatus::Completed);
    let second = history.get(TrialId(1)).unwrap().entered(TrialStatus::Completed);
    assert!(second < first);

    assert_eq!(summary.best, Some((TrialId(0), 1.0)));
    assert_eq!(driver.best(), Some((TrialId(0), 1.0)));
    assert_eq!(history.best().unwrap().id(), TrialId(0));
}

#[tokio::test]
async fn test_slow_extraction_does_not_hold_up_other_trials() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|out: &Path| {
            if trial_of(out) == 0 {
                std::thread::sleep(Duration::from_millis(300));
            }
            Ok::<_, String>(1.0)
        })
        .max_in_flight(3)
        .stop(StopPolicy::new().max_trials(3))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.completed, 3);

    let history = driver.history();
    let done = |id| {
        history
            .get(TrialId(id))
            .unwrap()
            .entered(TrialStatus::Completed)
            .unwrap()
    };
    assert!(done(1) < done(0));
    assert!(done(2) < done(0));
}
