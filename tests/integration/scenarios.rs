//! Reference scenarios for exit policies, phase ordering, closure gaps and
//! handler panics.

use tokio_util::sync::CancellationToken;

use wavegate::config::Config;
use wavegate::core::{CancelReason, ExitPolicy, TaskState};
use wavegate::orchestration::{
    ClosureVerifier, Entity, OverallStatus, Phase, PhaseStatus, Severity,
};

use crate::fixtures::{
    failing_task, logged_task, ok_task, orchestrator, panicking_task, runner, sleeping_task,
    state, task, CallLog,
};

fn fan_out(policy: ExitPolicy, log: &CallLog) -> Phase {
    Phase::with_tasks(
        "deploy",
        policy,
        [
            failing_task("A", "registry unreachable", log),
            logged_task("B", log).depends_on(["A"]),
            logged_task("C", log).depends_on(["A"]),
        ],
    )
    .unwrap()
}

/// Scenario 1: strict policy
/// Given A (no deps), B and C depending on A, and A failing
/// When the phase runs under RequireAllCompleted
/// Then the phase is Blocked and B and C are Cancelled without running
#[tokio::test]
async fn test_strict_failure_blocks_phase() {
    let log = CallLog::new();
    let summaries = runner(None)
        .run_phases(
            &CancellationToken::new(),
            vec![fan_out(ExitPolicy::RequireAllCompleted, &log)],
        )
        .await;

    let phase = &summaries[0];
    assert_eq!(phase.status, PhaseStatus::Blocked);
    assert_eq!(state(phase, "A"), TaskState::Failed);
    assert_eq!(state(phase, "B"), TaskState::Cancelled);
    assert_eq!(state(phase, "C"), TaskState::Cancelled);
    assert_eq!(task(phase, "B").cancel_reason, Some(CancelReason::UpstreamFailed));
    assert_eq!(log.calls(), vec!["A"]);
}

/// Scenario 2: lenient policy
/// Given the same graph under AllowPartialFailure
/// When A fails
/// Then B and C still run, the phase shows 1 failed and 2 completed, and
/// the run is PartialFailure
#[tokio::test]
async fn test_lenient_failure_continues() {
    let log = CallLog::new();
    let report = orchestrator(Config::default())
        .run(
            &CancellationToken::new(),
            vec![fan_out(ExitPolicy::AllowPartialFailure, &log)],
            None,
        )
        .await;

    let phase = &report.phases[0];
    assert_eq!(phase.status, PhaseStatus::PartialFailure);
    assert_eq!(phase.counts.failed, 1);
    assert_eq!(phase.counts.completed, 2);
    assert_eq!(report.overall_status, OverallStatus::PartialFailure);
    assert!(report
        .reasons
        .iter()
        .any(|r| r.contains("deploy/A") && r.contains("registry unreachable")));

    let mut calls = log.calls();
    calls.sort();
    assert_eq!(calls, vec!["A", "B", "C"]);
}

/// Scenario 3: phase ordering
/// Given two phases with no cross-phase edges, phase 1 all succeeding
/// When the run executes
/// Then phase 2 starts only after phase 1's summary is finalized
#[tokio::test]
async fn test_phases_run_strictly_in_order() {
    let first = Phase::with_tasks(
        "register",
        ExitPolicy::RequireAllCompleted,
        [sleeping_task("slow", 30), ok_task("fast")],
    )
    .unwrap();
    let second = Phase::with_tasks(
        "audit",
        ExitPolicy::RequireAllCompleted,
        [ok_task("check")],
    )
    .unwrap();

    let report = orchestrator(Config::default())
        .run(&CancellationToken::new(), vec![first, second], None)
        .await;

    assert_eq!(report.overall_status, OverallStatus::Success);
    let phase1 = report.phase("register").unwrap();
    let phase2 = report.phase("audit").unwrap();
    let phase1_end = phase1.ended_at.unwrap();
    assert!(phase2.started_at.unwrap() >= phase1_end);
    let slow_end = task(phase1, "slow").ended_at.unwrap();
    assert!(task(phase2, "check").started_at.unwrap() >= slow_end);
    assert!(phase1_end >= slow_end);
}

/// Scenario 4: closure gaps
/// Given ns-1 with {registered: true, validated: false}
/// When verifying against [registered, validated, monitored]
/// Then two gaps come back: validated (High) then monitored (Medium)
#[test]
fn test_closure_gaps_for_partial_entity() {
    let entity = Entity::new("ns-1")
        .with_stage("registered", true)
        .with_stage("validated", false);
    let required = vec![
        "registered".to_string(),
        "validated".to_string(),
        "monitored".to_string(),
    ];

    let gaps = ClosureVerifier::default().verify(&[entity], &required);

    assert_eq!(gaps.len(), 2);
    assert_eq!(gaps[0].entity_id, "ns-1");
    assert_eq!(gaps[0].missing_stage, "validated");
    assert_eq!(gaps[0].severity, Severity::High);
    assert_eq!(gaps[1].missing_stage, "monitored");
    assert_eq!(gaps[1].severity, Severity::Medium);
}

/// Scenario 5: panicking handler
/// Given a wave where one handler panics
/// When the wave runs
/// Then the panicking task is Failed with the panic message and its
/// siblings complete normally
#[tokio::test]
async fn test_panic_isolated_to_task() {
    let log = CallLog::new();
    let phase = Phase::with_tasks(
        "wave",
        ExitPolicy::AllowPartialFailure,
        [
            logged_task("before", &log),
            panicking_task("explodes", "index out of range in audit writer"),
            logged_task("after", &log),
        ],
    )
    .unwrap();

    let summaries = runner(None)
        .run_phases(&CancellationToken::new(), vec![phase])
        .await;

    let phase = &summaries[0];
    assert_eq!(phase.waves, 1);
    assert_eq!(state(phase, "explodes"), TaskState::Failed);
    let error = task(phase, "explodes").error.clone().unwrap();
    assert!(error.contains("index out of range in audit writer"));
    assert_eq!(state(phase, "before"), TaskState::Completed);
    assert_eq!(state(phase, "after"), TaskState::Completed);
    assert_eq!(log.calls().len(), 2);
}
