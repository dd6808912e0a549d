use std::path::Path;
use std::time::Duration;

use picopt::constraint::{OutcomeConstraint, ParameterConstraint};
use picopt::extraction::Extraction;
use picopt::stop::{StopPolicy, StopReason};
use picopt::{Driver, Error, TrialId, TrialStatus};

use crate::common::{
    point, space_xy, template_xy, trial_of, Script, ScriptedExecutor, ScriptedProposer,
};

#[tokio::test]
async fn test_extraction_failure_fails_only_that_trial() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|out: &Path| {
            if trial_of(out) == 1 {
                Err("diagnostics file is empty".to_string())
            } else {
                Ok(1.0)
            }
        })
        .stop(StopPolicy::new().max_trials(3))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxTrials);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);

    let failed = driver.trial(TrialId(1)).unwrap();
    assert_eq!(failed.status(), TrialStatus::Failed);
    assert_eq!(
        failed.failure(),
        Some("extraction failed: diagnostics file is empty")
    );
    assert_eq!(failed.objective(), None);
    // It ran before it failed.
    assert!(failed.entered(TrialStatus::Running).is_some());

    for id in [0, 2] {
        let record = driver.trial(TrialId(id)).unwrap();
        assert_eq!(record.status(), TrialStatus::Completed);
        assert_eq!(record.objective(), Some(1.0));
    }
}

#[tokio::test]
async fn test_execution_failures_are_recorded() {
    let executor = ScriptedExecutor::new(|req| match req.trial_id.0 {
        0 => Script::Fail("rank 3 exited with code 139"),
        1 => Script::TimeOut,
        _ => Script::Complete,
    });
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor)
        .extractor(|_: &Path| Ok::<_, String>(4.0))
        .stop(StopPolicy::new().max_trials(3))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.best, Some((TrialId(2), 4.0)));
    assert_eq!(
        driver.trial(TrialId(0)).unwrap().failure(),
        Some("execution failed: rank 3 exited with code 139")
    );
    assert_eq!(
        driver.trial(TrialId(1)).unwrap().failure(),
        Some("execution failed: timed out")
    );
}

#[tokio::test]
async fn test_rejected_submission_fails_without_a_slot() {
    let executor = ScriptedExecutor::new(|req| {
        if req.trial_id == TrialId(0) {
            Script::Reject
        } else {
            Script::Complete
        }
    });
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().max_trials(2))
        .build()
        .unwrap();

    driver.run().await.unwrap();

    let rejected = driver.trial(TrialId(0)).unwrap();
    assert_eq!(rejected.status(), TrialStatus::Failed);
    assert_eq!(rejected.failure(), Some("execution failed: no free workers"));
    assert!(!rejected.was_dispatched());
    assert_eq!(executor.submitted_trials(), vec![1]);
}

#[tokio::test]
async fn test_invalid_point_fails_without_submission() {
    let executor = ScriptedExecutor::completing();
    let proposer = ScriptedProposer::sequence(vec![point(2.0, 5), point(0.5, 5), point(0.5, 6)]);
    let observed = proposer.observations();
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(proposer)
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::ProposerExhausted);

    let invalid = driver.trial(TrialId(0)).unwrap();
    assert_eq!(invalid.status(), TrialStatus::Failed);
    assert!(invalid.failure().unwrap().contains("'x'"));
    assert_eq!(invalid.transitions().len(), 2);
    assert!(!invalid.was_dispatched());

    assert_eq!(executor.submitted_trials(), vec![1, 2]);
    // The proposer learns about the invalid point too.
    assert_eq!(observed.lock()[0].id(), TrialId(0));
}

#[tokio::test]
async fn test_extraction_timeout() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|_: &Path| {
            std::thread::sleep(Duration::from_millis(300));
            Ok::<_, String>(1.0)
        })
        .extraction_timeout(Duration::from_millis(20))
        .stop(StopPolicy::new().max_trials(1))
        .build()
        .unwrap();

    driver.run().await.unwrap();

    let record = driver.trial(TrialId(0)).unwrap();
    assert_eq!(record.status(), TrialStatus::Failed);
    assert_eq!(record.failure(), Some("extraction timeout"));
}

#[tokio::test]
async fn test_non_finite_objective_fails_the_trial() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|_: &Path| Ok::<_, String>(f64::NAN))
        .stop(StopPolicy::new().max_trials(1))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.best, None);

    let record = driver.trial(TrialId(0)).unwrap();
    assert_eq!(record.status(), TrialStatus::Failed);
    assert!(record.failure().unwrap().contains("not finite"));
}

#[tokio::test]
async fn test_failed_history_has_no_best() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::new(|_| Script::Fail("no license")))
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().max_trials(2))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.failed, 2);
    assert!(driver.history().best().is_err());
}

#[tokio::test]
async fn test_extractor_panic_fails_only_that_trial() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|out: &Path| {
            assert_ne!(trial_of(out), 0, "summary file truncated");
            Ok::<_, String>(2.0)
        })
        .stop(StopPolicy::new().max_trials(2))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxTrials);
    assert_eq!(summary.best, Some((TrialId(1), 2.0)));

    let record = driver.trial(TrialId(0)).unwrap();
    assert_eq!(record.status(), TrialStatus::Failed);
    assert!(record.failure().unwrap().starts_with("async task error: "));
}

#[tokio::test]
async fn test_fatal_submission_error_ends_the_run() {
    let executor = ScriptedExecutor::new(|req| {
        if req.trial_id == TrialId(1) {
            Script::RejectFatal
        } else {
            Script::Complete
        }
    });
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().max_trials(5))
        .build()
        .unwrap();

    let err = driver.run().await.unwrap_err();
    assert!(matches!(err, Error::Storage { ref reason, .. } if reason == "disk full"));
    assert!(err.is_fatal());

    assert_eq!(
        driver.trial(TrialId(0)).unwrap().status(),
        TrialStatus::Completed
    );
    // Not recorded as a trial failure; a resumed run picks it up again.
    let stuck = driver.trial(TrialId(1)).unwrap();
    assert_eq!(stuck.status(), TrialStatus::Proposed);
    assert_eq!(stuck.failure(), None);
    assert!(driver.trial(TrialId(2)).is_none());
    assert_eq!(executor.submitted_trials(), vec![0]);
}

#[tokio::test]
async fn test_constraint_violation_fails_before_submission() {
    let constraint: ParameterConstraint = "x <= 0.1 * y".parse().unwrap();
    let space = space_xy().with_constraints([constraint]).unwrap();
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space)
        .template(template_xy())
        .proposer(ScriptedProposer::sequence(vec![point(0.9, 1), point(0.05, 5)]))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 1);

    let infeasible = driver.trial(TrialId(0)).unwrap();
    assert_eq!(infeasible.status(), TrialStatus::Failed);
    assert!(infeasible.failure().unwrap().contains("x <= 0.1 * y"));
    assert!(!infeasible.was_dispatched());
    assert_eq!(executor.submitted_trials(), vec![1]);
}

#[tokio::test]
async fn test_outcome_violations_never_become_best() {
    let charge: OutcomeConstraint = "charge >= 10".parse().unwrap();
    let space = space_xy().with_outcome_constraints([charge]).unwrap();
    let mut driver = Driver::builder()
        .space(space)
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|out: &Path| {
            let (objective, charge) = match trial_of(out) {
                0 => (0.5, 4.0),
                1 => (2.0, 12.0),
                _ => (3.0, 30.0),
            };
            Ok::<_, String>(Extraction::new(objective).metric("charge", charge))
        })
        .stop(StopPolicy::new().max_trials(3))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.best, Some((TrialId(1), 2.0)));
    assert_eq!(driver.best(), Some((TrialId(1), 2.0)));

    let history = driver.history();
    assert_eq!(history.best().unwrap().id(), TrialId(1));
    // Still completed and visible, only not eligible.
    let violator = history.get(TrialId(0)).unwrap();
    assert_eq!(violator.status(), TrialStatus::Completed);
    assert!(!history.is_feasible(violator));
}
