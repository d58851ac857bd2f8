//! Dependency ordering, termination and bounded concurrency.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wavegate::core::{ExitPolicy, RunId, TaskDef, TaskState};
use wavegate::orchestration::{
    Executor, Phase, PhaseRunner, PhaseStatus, PhaseSummary, SchedulerEvent, WaveScheduler,
};

use crate::fixtures::{
    failing_task, ids, ok_task, runner, sleeping_task, state, task, CallLog, ConcurrencyProbe,
};

async fn run_one(phase: Phase, max_concurrency: Option<usize>) -> PhaseSummary {
    runner(max_concurrency)
        .run_phases(&CancellationToken::new(), vec![phase])
        .await
        .remove(0)
}

fn assert_after(summary: &PhaseSummary, dependent: &str, dependency: &str) {
    let started = task(summary, dependent).started_at.unwrap();
    let ended = task(summary, dependency).ended_at.unwrap();
    assert!(
        started >= ended,
        "{dependent} started at {started} before {dependency} ended at {ended}"
    );
}

/// Test: Wave ordering on a diamond
/// Given a -> (b, c) -> d
/// When the phase runs
/// Then every task starts after each of its dependencies ended
#[tokio::test]
async fn test_diamond_respects_dependencies() {
    let phase = Phase::with_tasks(
        "diamond",
        ExitPolicy::RequireAllCompleted,
        [
            sleeping_task("a", 10),
            sleeping_task("b", 20).depends_on(["a"]),
            sleeping_task("c", 5).depends_on(["a"]),
            ok_task("d").depends_on(["b", "c"]),
        ],
    )
    .unwrap();

    let summary = run_one(phase, None).await;

    assert_eq!(summary.status, PhaseStatus::Success);
    assert_eq!(summary.waves, 3);
    assert_after(&summary, "b", "a");
    assert_after(&summary, "c", "a");
    assert_after(&summary, "d", "b");
    assert_after(&summary, "d", "c");
}

/// Test: Wave ordering under partial failure
/// Given a failing dependency under AllowPartialFailure
/// When the dependent runs
/// Then it still starts after the failed dependency ended
#[tokio::test]
async fn test_dependent_of_failure_runs_after_it() {
    let log = CallLog::new();
    let phase = Phase::with_tasks(
        "lenient",
        ExitPolicy::AllowPartialFailure,
        [
            failing_task("flaky", "exit 1", &log),
            ok_task("report").depends_on(["flaky"]),
        ],
    )
    .unwrap();

    let summary = run_one(phase, None).await;
    assert_eq!(state(&summary, "report"), TaskState::Completed);
    assert_after(&summary, "report", "flaky");
}

fn acyclic_shapes(log: &CallLog) -> Vec<Vec<TaskDef>> {
    vec![
        (0..6).map(|i| ok_task(&format!("t{i}"))).collect(),
        vec![
            ok_task("a"),
            failing_task("b", "boom", log).depends_on(["a"]),
            ok_task("c").depends_on(["b"]),
            ok_task("d").depends_on(["c"]),
        ],
        vec![
            ok_task("root"),
            failing_task("left", "boom", log).depends_on(["root"]),
            ok_task("right").depends_on(["root"]),
            ok_task("join").depends_on(["left", "right"]),
            ok_task("island"),
            ok_task("off").enabled(false),
            ok_task("after-off").depends_on(["off"]),
        ],
    ]
}

/// Test: Termination on acyclic graphs
/// Given several acyclic shapes with failures sprinkled in
/// When each is drained under both policies
/// Then no task is left pending or running
#[tokio::test]
async fn test_acyclic_graphs_terminate() {
    for policy in [ExitPolicy::RequireAllCompleted, ExitPolicy::AllowPartialFailure] {
        let log = CallLog::new();
        for defs in acyclic_shapes(&log) {
            let phase = Phase::with_tasks("shape", policy, defs).unwrap();
            let summary = run_one(phase, Some(2)).await;

            assert!(summary.status.is_resolved());
            assert_eq!(summary.counts.pending, 0, "{policy}: {:?}", summary.tasks);
            assert_eq!(summary.counts.running, 0);
            assert!(summary.tasks.iter().all(|t| t.state.is_terminal()));
        }
    }
}

/// Test: Disabled dependency under the strict policy
/// Given a task depending on a disabled task
/// When the phase runs under RequireAllCompleted
/// Then the disabled task is Skipped and its dependent Cancelled
#[tokio::test]
async fn test_disabled_dependency_strict() {
    let phase = Phase::with_tasks(
        "strict",
        ExitPolicy::RequireAllCompleted,
        [ok_task("off").enabled(false), ok_task("needs-off").depends_on(["off"])],
    )
    .unwrap();

    let summary = run_one(phase, None).await;
    assert_eq!(state(&summary, "off"), TaskState::Skipped);
    assert_eq!(state(&summary, "needs-off"), TaskState::Cancelled);
    assert_eq!(summary.status, PhaseStatus::Blocked);
    assert!(summary.stuck);
}

/// Test: Disabled dependency under the lenient policy
/// Given the same graph under AllowPartialFailure
/// When the phase runs
/// Then the dependent runs because Skipped satisfies it
#[tokio::test]
async fn test_disabled_dependency_lenient() {
    let phase = Phase::with_tasks(
        "lenient",
        ExitPolicy::AllowPartialFailure,
        [ok_task("off").enabled(false), ok_task("needs-off").depends_on(["off"])],
    )
    .unwrap();

    let summary = run_one(phase, None).await;
    assert_eq!(state(&summary, "needs-off"), TaskState::Completed);
    assert_eq!(summary.status, PhaseStatus::Success);
}

/// Test: Bounded concurrency
/// Given 8 independent tasks and max_concurrency 3
/// When the wave runs
/// Then at most 3 handlers are ever in flight
#[tokio::test]
async fn test_max_concurrency_bounds_wave() {
    let probe = ConcurrencyProbe::new();
    let phase = Phase::with_tasks(
        "wide",
        ExitPolicy::RequireAllCompleted,
        (0..8).map(|i| probe.task(&format!("t{i}"), 20)),
    )
    .unwrap();

    let summary = run_one(phase, Some(3)).await;

    assert_eq!(summary.counts.completed, 8);
    assert_eq!(summary.waves, 1);
    assert!(probe.peak() <= 3, "peak was {}", probe.peak());
    assert!(probe.peak() >= 2);
}

/// Test: Unbounded wave
/// Given 5 independent tasks and no concurrency limit
/// When the wave runs
/// Then all 5 run at once
#[tokio::test]
async fn test_unbounded_wave_runs_all_at_once() {
    let probe = ConcurrencyProbe::new();
    let phase = Phase::with_tasks(
        "wide",
        ExitPolicy::RequireAllCompleted,
        (0..5).map(|i| probe.task(&format!("t{i}"), 50)),
    )
    .unwrap();

    run_one(phase, None).await;
    assert_eq!(probe.peak(), 5);
}

/// Test: Scheduler events
/// Given a two-level chain
/// When the phase runs with an event channel
/// Then one WaveStarted per level is emitted, in order
#[tokio::test]
async fn test_wave_events_follow_levels() {
    let (tx, mut rx) = mpsc::channel(64);
    let phase = Phase::with_tasks(
        "chain",
        ExitPolicy::RequireAllCompleted,
        [ok_task("a"), ok_task("b"), ok_task("c").depends_on(["a", "b"])],
    )
    .unwrap();

    let phase_runner = PhaseRunner::new(
        WaveScheduler::new(RunId::new(), Executor::default(), None).with_events(tx),
    );
    phase_runner.run_phases(&CancellationToken::new(), vec![phase]).await;
    drop(phase_runner);

    let mut waves = Vec::new();
    while let Some(event) = rx.recv().await {
        if let SchedulerEvent::WaveStarted { wave, tasks, .. } = event {
            waves.push((wave, tasks));
        }
    }
    assert_eq!(waves, vec![(1, ids(&["a", "b"])), (2, ids(&["c"]))]);
}
