//! Structural errors detected before any handler runs.

use tokio_util::sync::CancellationToken;

use wavegate::config::Config;
use wavegate::core::{CancelReason, ExitPolicy, TaskGraph, TaskState};
use wavegate::error::Error;
use wavegate::orchestration::{OverallStatus, Phase, PhaseStatus, SkipReason};

use crate::fixtures::{logged_task, ok_task, orchestrator, runner, state, task, CallLog};

/// Test: Cycle listing
/// Given a -> b -> c -> a plus an acyclic tail d -> a
/// When the graph is validated
/// Then CyclicDependency lists exactly a, b and c
#[test]
fn test_cycle_lists_members_only() {
    let graph = TaskGraph::from_defs(
        ExitPolicy::RequireAllCompleted,
        [
            ok_task("a").depends_on(["c"]),
            ok_task("b").depends_on(["a"]),
            ok_task("c").depends_on(["b"]),
            ok_task("d").depends_on(["a"]),
        ],
    )
    .unwrap();

    match graph.validate() {
        Err(Error::CyclicDependency { ids }) => assert_eq!(ids, vec!["a", "b", "c"]),
        other => panic!("expected CyclicDependency, got {other:?}"),
    }
}

/// Test: No handler runs on a cyclic phase
/// Given a phase with a two-task cycle and an independent task
/// When the phase runs
/// Then nothing is invoked, the phase is Blocked and every task Cancelled
#[tokio::test]
async fn test_cyclic_phase_invokes_nothing() {
    let log = CallLog::new();
    let phase = Phase::with_tasks(
        "loop",
        ExitPolicy::RequireAllCompleted,
        [
            logged_task("x", &log).depends_on(["y"]),
            logged_task("y", &log).depends_on(["x"]),
            logged_task("free", &log),
        ],
    )
    .unwrap();

    let summaries = runner(None)
        .run_phases(&CancellationToken::new(), vec![phase])
        .await;

    let summary = &summaries[0];
    assert!(log.is_empty());
    assert_eq!(summary.status, PhaseStatus::Blocked);
    assert_eq!(summary.waves, 0);
    assert!(summary
        .structural_error
        .as_deref()
        .unwrap()
        .contains("x, y"));
    assert_eq!(state(summary, "free"), TaskState::Cancelled);
    assert_eq!(
        task(summary, "free").cancel_reason,
        Some(CancelReason::UnmetOrCyclicDependency)
    );
}

/// Test: Self-loop
/// Given a task that depends on itself
/// When the graph is validated
/// Then it is reported as a cycle of one
#[test]
fn test_self_loop_is_cycle() {
    let graph = TaskGraph::from_defs(
        ExitPolicy::AllowPartialFailure,
        [ok_task("me").depends_on(["me"]), ok_task("other")],
    )
    .unwrap();

    match graph.validate() {
        Err(Error::CyclicDependency { ids }) => assert_eq!(ids, vec!["me"]),
        other => panic!("expected CyclicDependency, got {other:?}"),
    }
}

/// Test: Disabled task breaks a cycle
/// Given a cycle whose only closing edge comes from a disabled task
/// When the graph is validated
/// Then there is no structural error
#[test]
fn test_disabled_task_breaks_cycle() {
    let graph = TaskGraph::from_defs(
        ExitPolicy::AllowPartialFailure,
        [
            ok_task("a").depends_on(["b"]),
            ok_task("b").depends_on(["a"]).enabled(false),
        ],
    )
    .unwrap();
    assert!(graph.validate().is_ok());
}

/// Test: Unknown dependency
/// Given a task naming a dependency outside its phase
/// When the phase runs
/// Then the phase is Blocked with UnknownDependency and nothing runs
#[tokio::test]
async fn test_unknown_dependency_blocks_phase() {
    let log = CallLog::new();
    let phase = Phase::with_tasks(
        "orphans",
        ExitPolicy::AllowPartialFailure,
        [logged_task("child", &log).depends_on(["ghost"])],
    )
    .unwrap();

    let summaries = runner(None)
        .run_phases(&CancellationToken::new(), vec![phase])
        .await;

    assert!(log.is_empty());
    let error = summaries[0].structural_error.as_deref().unwrap();
    assert!(error.contains("child") && error.contains("ghost"));
    assert_eq!(summaries[0].status, PhaseStatus::Blocked);
}

/// Test: Duplicate ids
/// Given two tasks with the same id
/// When the phase is built
/// Then DuplicateTask is returned
#[test]
fn test_duplicate_id_rejected() {
    let result = Phase::with_tasks(
        "dup",
        ExitPolicy::RequireAllCompleted,
        [ok_task("same"), ok_task("same")],
    );
    match result {
        Err(e) => {
            assert!(matches!(e, Error::DuplicateTask(ref id) if id == "same"));
            assert!(e.is_structural());
        }
        Ok(_) => panic!("expected DuplicateTask"),
    }
}

/// Test: Structural error halts a strict run
/// Given a cyclic strict phase followed by a healthy phase
/// When the run executes
/// Then the second phase is skipped and the run is Blocked
#[tokio::test]
async fn test_structural_error_skips_later_phases() {
    let broken = Phase::with_tasks(
        "broken",
        ExitPolicy::RequireAllCompleted,
        [ok_task("a").depends_on(["b"]), ok_task("b").depends_on(["a"])],
    )
    .unwrap();
    let healthy = Phase::with_tasks(
        "healthy",
        ExitPolicy::RequireAllCompleted,
        [ok_task("fine")],
    )
    .unwrap();

    let report = orchestrator(Config::default())
        .run(&CancellationToken::new(), vec![broken, healthy], None)
        .await;

    assert_eq!(report.overall_status, OverallStatus::Blocked);
    let healthy = report.phase("healthy").unwrap();
    assert_eq!(healthy.status, PhaseStatus::NotStarted);
    assert_eq!(healthy.skip_reason, Some(SkipReason::SkippedDueToUpstreamBlock));
    assert!(report.reasons.iter().any(|r| r.contains("Cyclic dependency")));
}
