use std::path::Path;

use picopt::proposer::FidelityLadder;
use picopt::stop::{StopPolicy, StopReason};
use picopt::{Driver, TrialId, TrialStatus};

use crate::common::{
    point, space_xy_res, template_xy_res, trial_of, ScriptedExecutor, ScriptedProposer,
};

#[tokio::test]
async fn test_each_fidelity_level_is_its_own_trial() {
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy_res())
        .template(template_xy_res())
        .proposer(FidelityLadder::new(
            ScriptedProposer::constant(point(0.5, 5)),
            vec![0.2, 1.0],
        ))
        .executor(executor.clone())
        // The cheap run looks better, but only full fidelity counts.
        .extractor(|out: &Path| Ok::<_, String>(if trial_of(out) == 0 { 0.1 } else { 0.9 }))
        .stop(StopPolicy::new().max_trials(2))
        .build()
        .unwrap();

    driver.run().await.unwrap();

    let low = driver.trial(TrialId(0)).unwrap();
    let high = driver.trial(TrialId(1)).unwrap();
    assert_eq!(low.fidelity(), Some(0.2));
    assert_eq!(high.fidelity(), Some(1.0));
    assert!(low.point().same_location(high.point()));
    assert_eq!(low.status(), TrialStatus::Completed);
    assert_eq!(high.status(), TrialStatus::Completed);

    let submissions = executor.submissions();
    assert_eq!(submissions[0].fidelity, Some(0.2));
    assert!(submissions[0].artifact.ends_with("res = 0.2\n"));
    assert!(submissions[1].artifact.ends_with("res = 1.0\n"));

    let history = driver.history();
    assert_eq!(history.best().unwrap().id(), TrialId(1));
    assert_eq!(history.best_at(0.2).unwrap().id(), TrialId(0));
    assert_eq!(driver.best(), Some((TrialId(1), 0.9)));

    let levels = history.per_fidelity();
    assert_eq!(levels.len(), 2);
    assert_eq!(levels[0].fidelity, Some(0.2));
    assert_eq!(levels[0].completed, 1);
    assert_eq!(levels[1].best, Some((TrialId(1), 0.9)));
    assert!((history.total_cost() - 1.2).abs() < 1e-12);
}

#[tokio::test]
async fn test_cost_budget_stops_before_overspending() {
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy_res())
        .template(template_xy_res())
        .proposer(FidelityLadder::new(
            ScriptedProposer::constant(point(0.5, 5)),
            vec![0.2, 1.0],
        ))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().max_cost(1.3))
        .build()
        .unwrap();

    let summary = driver.run().await.unwrap();
    assert_eq!(summary.reason, StopReason::MaxCost);
    // 0.2 + 1.0 spent; another 0.2 would exceed 1.3.
    assert_eq!(executor.submitted_trials(), vec![0, 1]);
    assert!(driver.history().total_cost() <= 1.3);
}

#[tokio::test]
async fn test_missing_fidelity_defaults_to_target() {
    let executor = ScriptedExecutor::completing();
    let mut driver = Driver::builder()
        .space(space_xy_res())
        .template(template_xy_res())
        .proposer(ScriptedProposer::constant(point(0.5, 5)))
        .executor(executor.clone())
        .extractor(|_: &Path| Ok::<_, String>(1.0))
        .stop(StopPolicy::new().max_trials(1))
        .build()
        .unwrap();

    driver.run().await.unwrap();

    assert_eq!(driver.trial(TrialId(0)).unwrap().fidelity(), Some(1.0));
    assert_eq!(executor.submissions()[0].fidelity, Some(1.0));
    assert_eq!(driver.best(), Some((TrialId(0), 1.0)));
}
