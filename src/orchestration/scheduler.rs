//! Wave scheduler for one phase's task graph.
//!
//! The WaveScheduler drains a TaskGraph: it dispatches every ready task
//! through a bounded pool, waits for the whole wave, folds the outcomes back
//! into the graph, and repeats until nothing is pending. Wave boundaries are
//! barriers, so a task never starts before all of its dependencies are
//! terminal.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{CancelReason, RunId, TaskContext, TaskGraph, TaskId, TaskState};
use crate::orchestration::executor::Executor;

/// Events emitted by the scheduler for task lifecycle changes.
///
/// These let external components (progress output, tests) follow a run
/// without polling the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// A wave of ready tasks is about to be dispatched.
    WaveStarted {
        phase: String,
        wave: usize,
        tasks: Vec<TaskId>,
    },
    /// A task was marked running and handed to the pool.
    TaskStarted { phase: String, task_id: TaskId },
    /// A task finished with the given state.
    TaskFinished {
        phase: String,
        task_id: TaskId,
        state: TaskState,
    },
    /// Nothing was ready while tasks were still pending.
    PhaseStuck {
        phase: String,
        cancelled: Vec<TaskId>,
    },
}

/// How draining a graph ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Number of waves dispatched.
    pub waves: usize,
    /// Structural error found before the first wave; nothing ran.
    pub structural_error: Option<String>,
    /// The graph got stuck and its pending tasks were cancelled.
    pub stuck: bool,
    /// Dispatch stopped early because of cancellation or the phase deadline.
    pub interrupted: Option<CancelReason>,
}

/// Dispatches ready tasks wave by wave.
#[derive(Debug, Clone)]
pub struct WaveScheduler {
    run_id: RunId,
    executor: Executor,
    /// `None` means unbounded.
    max_concurrency: Option<usize>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl WaveScheduler {
    pub fn new(run_id: RunId, executor: Executor, max_concurrency: Option<usize>) -> Self {
        Self {
            run_id,
            executor,
            max_concurrency: max_concurrency.map(|n| n.max(1)),
            event_tx: None,
        }
    }

    /// Emit lifecycle events on `tx`. Events are dropped when the channel
    /// is full so a slow consumer never stalls scheduling.
    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Drain `graph` until no task is pending.
    ///
    /// `cancel` is the run-level token. A `phase_timeout` starts a deadline
    /// for the whole phase; once it passes no new wave is dispatched and
    /// in-flight tasks see their context token fire.
    pub async fn run(
        &self,
        phase: &str,
        graph: &mut TaskGraph,
        cancel: &CancellationToken,
        phase_timeout: Option<Duration>,
    ) -> DrainOutcome {
        let mut outcome = DrainOutcome::default();

        let skipped = graph.skip_disabled();
        if !skipped.is_empty() {
            debug!(phase, count = skipped.len(), "WaveScheduler::run: skipped disabled tasks");
        }

        if let Err(e) = graph.validate() {
            warn!(phase, error = %e, "WaveScheduler::run: structural error, nothing will run");
            graph.cancel_pending(CancelReason::UnmetOrCyclicDependency);
            outcome.structural_error = Some(e.to_string());
            return outcome;
        }

        let deadline = phase_timeout.map(|t| Instant::now() + t);
        let phase_token = cancel.child_token();
        let timer = deadline.map(|d| {
            let token = phase_token.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(d).await;
                token.cancel();
            })
        });

        loop {
            if graph.pending_count() == 0 {
                break;
            }
            let expired = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
            if phase_token.is_cancelled() || expired {
                let reason = if cancel.is_cancelled() {
                    CancelReason::RunCancelled
                } else {
                    CancelReason::PhaseTimeout
                };
                let cancelled = graph.cancel_pending(reason);
                info!(
                    phase,
                    %reason,
                    cancelled = cancelled.len(),
                    "WaveScheduler::run: dispatch stopped"
                );
                outcome.interrupted = Some(reason);
                break;
            }

            let ready = graph.ready_tasks();
            if ready.is_empty() {
                let cancelled = graph.cancel_stuck();
                warn!(
                    phase,
                    cancelled = cancelled.len(),
                    "WaveScheduler::run: graph stuck, cancelling pending tasks"
                );
                outcome.stuck = true;
                self.emit(SchedulerEvent::PhaseStuck {
                    phase: phase.to_string(),
                    cancelled: cancelled.into_iter().map(|(id, _)| id).collect(),
                });
                break;
            }

            outcome.waves += 1;
            self.run_wave(phase, graph, &ready, &phase_token, deadline, outcome.waves)
                .await;
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        debug!(phase, waves = outcome.waves, "WaveScheduler::run: drained");
        outcome
    }

    /// Dispatch one wave and wait for all of it.
    async fn run_wave(
        &self,
        phase: &str,
        graph: &mut TaskGraph,
        ready: &[TaskId],
        token: &CancellationToken,
        deadline: Option<Instant>,
        wave: usize,
    ) {
        info!(phase, wave, tasks = ready.len(), "WaveScheduler::run_wave: dispatching");
        self.emit(SchedulerEvent::WaveStarted {
            phase: phase.to_string(),
            wave,
            tasks: ready.to_vec(),
        });

        let permits = self.max_concurrency.unwrap_or(Semaphore::MAX_PERMITS);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut in_flight = FuturesUnordered::new();

        for id in ready {
            // Running before invocation so a repeated ready_tasks() call
            // cannot hand the same task out twice.
            if let Err(e) = graph.mark_running(id) {
                warn!(phase, task = %id, error = %e, "WaveScheduler::run_wave: not dispatchable");
                continue;
            }
            let Some(def) = graph.get_task(id).map(|t| t.def.clone()) else {
                continue;
            };

            let ctx = TaskContext::new(self.run_id, phase, id.clone(), def.params.clone())
                .with_cancel(token.clone());
            let semaphore = Arc::clone(&semaphore);
            let executor = self.executor.clone();

            self.emit(SchedulerEvent::TaskStarted {
                phase: phase.to_string(),
                task_id: id.clone(),
            });

            in_flight.push(async move {
                // Tasks beyond the bound wait here.
                let _permit = semaphore.acquire_owned().await;
                let outcome = executor.run(ctx, &def, deadline).await;
                (def.id, outcome)
            });
        }

        while let Some((id, result)) = in_flight.next().await {
            let state = result.state;
            if state == TaskState::Failed {
                warn!(
                    phase,
                    task = %id,
                    error = result.error.as_deref().unwrap_or(""),
                    "WaveScheduler::run_wave: task failed"
                );
            }
            if let Err(e) = graph.mark_result(&id, result) {
                warn!(phase, task = %id, error = %e, "WaveScheduler::run_wave: result rejected");
                continue;
            }
            self.emit(SchedulerEvent::TaskFinished {
                phase: phase.to_string(),
                task_id: id,
                state,
            });
        }
    }
}
