use std::path::Path;
use std::time::Duration;

use picopt::stop::{StopPolicy, StopReason};
use picopt::{Driver, TrialStatus};

use crate::common::{point, space_xy, template_xy, Script, ScriptedExecutor, ScriptedProposer};

fn stop_after(handle: picopt::StopHandle, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        handle.stop();
    });
}

#[tokio::test]
async fn test_stop_cancels_stuck_trials_after_grace() {
    let executor = ScriptedExecutor::new(|_| Script::Hang);
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .max_in_flight(2)
        .grace_period(Duration::from_millis(50))
        .build()
        .unwrap();
    stop_after(driver.stop_handle(), Duration::from_millis(20));

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::Requested);
    assert_eq!(summary.cancelled, 2);
    assert_eq!(executor.cancelled().len(), 2);
    assert_eq!(driver.in_flight(), 0);

    let history = driver.history();
    for record in history.records() {
        assert_eq!(record.status(), TrialStatus::Cancelled);
        // It had started before it was cancelled.
        assert!(record.entered(TrialStatus::Running).is_some());
    }
}

#[tokio::test]
async fn test_stop_lets_in_flight_trials_finish_within_grace() {
    let executor = ScriptedExecutor::completing().with_delay(Duration::from_millis(60));
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .max_in_flight(2)
        .grace_period(Duration::from_secs(5))
        .build()
        .unwrap();
    stop_after(driver.stop_handle(), Duration::from_millis(10));

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::Requested);
    // No new proposals after the stop; both in-flight trials finish.
    assert_eq!(summary.proposed, 2);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.cancelled, 0);
    assert!(executor.cancelled().is_empty());
}

#[tokio::test]
async fn test_stop_request_is_cleared_after_run() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().max_trials(1))
        .build()
        .unwrap();
    let handle = driver.stop_handle();

    handle.stop();
    assert!(handle.is_stop_requested());
    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::Requested);
    assert_eq!(summary.proposed, 0);
    assert!(!handle.is_stop_requested());

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxTrials);
    assert_eq!(summary.proposed, 1);
}

#[tokio::test]
async fn test_no_improvement_stops_the_run() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().no_improvement(2, 0.0).max_trials(100))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::NoImprovement);
    assert_eq!(summary.completed, 3);
}

#[tokio::test]
async fn test_exhausted_time_budget_proposes_nothing() {
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().max_duration(Duration::ZERO))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxDuration);
    assert_eq!(summary.proposed, 0);
    assert!(executor.submissions().is_empty());
}

#[tokio::test]
async fn test_summary_reports_best() {
    let mut driver = Driver::builder()
        .space(space_xy())
        .template(template_xy())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(ScriptedExecutor::completing())
        .extractor(|_: &Path| Ok::<_, String>(2.5))
        .stop(StopPolicy::new().max_trials(2))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    let text = summary.to_string();
    assert!(text.starts_with("stopped: trial budget exhausted"), "{text}");
    assert!(text.ends_with("; best 2.5 (trial #0)"), "{text}");
}
