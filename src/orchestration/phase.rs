//! Ordered phases and the runner that executes them.
//!
//! Each phase owns its own TaskGraph and an exit policy. Phases run strictly
//! in sequence; a `RequireAllCompleted` phase that resolves `Blocked` stops
//! the run and every later phase is recorded as not started.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{CancelReason, ExitPolicy, TaskCounts, TaskDef, TaskGraph, TaskRecord};
use crate::error::{Error, Result};
use crate::orchestration::scheduler::{DrainOutcome, WaveScheduler};

/// Lifecycle of a phase.
///
/// `NotStarted -> Running -> Success | PartialFailure | Blocked`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    NotStarted,
    Running,
    Success,
    PartialFailure,
    Blocked,
}

impl PhaseStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Success | PhaseStatus::PartialFailure | PhaseStatus::Blocked
        )
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::NotStarted => write!(f, "not_started"),
            PhaseStatus::Running => write!(f, "running"),
            PhaseStatus::Success => write!(f, "success"),
            PhaseStatus::PartialFailure => write!(f, "partial_failure"),
            PhaseStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Why a phase never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    SkippedDueToUpstreamBlock,
    RunCancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SkippedDueToUpstreamBlock => write!(f, "skipped_due_to_upstream_block"),
            SkipReason::RunCancelled => write!(f, "run_cancelled"),
        }
    }
}

/// A named stage owning one task graph.
#[derive(Debug)]
pub struct Phase {
    name: String,
    graph: TaskGraph,
    timeout: Option<Duration>,
    status: PhaseStatus,
}

impl Phase {
    pub fn new(name: impl Into<String>, exit_policy: ExitPolicy) -> Self {
        Self {
            name: name.into(),
            graph: TaskGraph::new(exit_policy),
            timeout: None,
            status: PhaseStatus::NotStarted,
        }
    }

    /// Build a phase from task definitions.
    ///
    /// # Errors
    /// `DuplicateTask` if two definitions share an id.
    pub fn with_tasks(
        name: impl Into<String>,
        exit_policy: ExitPolicy,
        defs: impl IntoIterator<Item = TaskDef>,
    ) -> Result<Self> {
        let mut phase = Self::new(name, exit_policy);
        for def in defs {
            phase.add_task(def)?;
        }
        Ok(phase)
    }

    pub fn add_task(&mut self, def: TaskDef) -> Result<()> {
        self.graph.add_task(def)
    }

    /// Deadline for the whole phase.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit_policy(&self) -> ExitPolicy {
        self.graph.policy()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Check if a transition to the target status is valid.
    pub fn can_transition(&self, target: PhaseStatus) -> bool {
        matches!(
            (self.status, target),
            (PhaseStatus::NotStarted, PhaseStatus::Running)
                | (PhaseStatus::Running, PhaseStatus::Success)
                | (PhaseStatus::Running, PhaseStatus::PartialFailure)
                | (PhaseStatus::Running, PhaseStatus::Blocked)
        )
    }

    pub fn transition(&mut self, target: PhaseStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Summary of the phase as it stands, without draining it.
    fn idle_summary(&self, skip_reason: Option<SkipReason>) -> PhaseSummary {
        PhaseSummary {
            name: self.name.clone(),
            status: self.status,
            exit_policy: self.exit_policy(),
            counts: self.graph.counts(),
            waves: 0,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            structural_error: None,
            stuck: false,
            interrupted: None,
            skip_reason,
            tasks: self.graph.records(),
        }
    }
}

/// Resolved status of a drained phase.
pub fn resolve_status(policy: ExitPolicy, drain: &DrainOutcome, counts: &TaskCounts) -> PhaseStatus {
    if drain.structural_error.is_some() || drain.stuck {
        return PhaseStatus::Blocked;
    }
    if counts.failures() > 0 {
        return match policy {
            ExitPolicy::RequireAllCompleted => PhaseStatus::Blocked,
            ExitPolicy::AllowPartialFailure => PhaseStatus::PartialFailure,
        };
    }
    PhaseStatus::Success
}

/// Immutable record of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSummary {
    pub name: String,
    pub status: PhaseStatus,
    pub exit_policy: ExitPolicy,
    pub counts: TaskCounts,
    pub waves: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structural_error: Option<String>,
    pub stuck: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted: Option<CancelReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    pub tasks: Vec<TaskRecord>,
}

impl PhaseSummary {
    pub fn task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id.as_str() == id)
    }
}

/// Runs phases in order through a WaveScheduler.
#[derive(Debug, Clone)]
pub struct PhaseRunner {
    scheduler: WaveScheduler,
    /// Used for phases without their own timeout.
    default_phase_timeout: Option<Duration>,
}

impl PhaseRunner {
    pub fn new(scheduler: WaveScheduler) -> Self {
        Self {
            scheduler,
            default_phase_timeout: None,
        }
    }

    pub fn with_phase_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_phase_timeout = timeout;
        self
    }

    pub fn scheduler(&self) -> &WaveScheduler {
        &self.scheduler
    }

    /// Execute phases strictly in order.
    ///
    /// Returns one summary per phase, in input order, including phases that
    /// never started.
    pub async fn run_phases(&self, cancel: &CancellationToken, phases: Vec<Phase>) -> Vec<PhaseSummary> {
        let mut summaries = Vec::with_capacity(phases.len());
        let mut halt: Option<SkipReason> = None;

        for mut phase in phases {
            if halt.is_none() && cancel.is_cancelled() {
                info!(phase = phase.name(), "PhaseRunner::run_phases: run cancelled");
                halt = Some(SkipReason::RunCancelled);
            }
            if let Some(reason) = halt {
                summaries.push(phase.idle_summary(Some(reason)));
                continue;
            }

            let summary = self.run_phase(cancel, &mut phase).await;
            // A blocked lenient phase (structural error, stuck graph) only
            // blocks itself.
            if summary.status == PhaseStatus::Blocked
                && summary.exit_policy == ExitPolicy::RequireAllCompleted
            {
                warn!(
                    phase = phase.name(),
                    "PhaseRunner::run_phases: phase blocked, skipping remaining phases"
                );
                halt = Some(SkipReason::SkippedDueToUpstreamBlock);
            }
            summaries.push(summary);
        }

        summaries
    }

    /// Drain one phase and resolve its status.
    pub async fn run_phase(&self, cancel: &CancellationToken, phase: &mut Phase) -> PhaseSummary {
        let started_at = Utc::now();
        if let Err(e) = phase.transition(PhaseStatus::Running) {
            warn!(phase = phase.name(), error = %e, "PhaseRunner::run_phase: already run");
            return phase.idle_summary(None);
        }
        info!(
            phase = phase.name(),
            tasks = phase.graph.task_count(),
            policy = %phase.exit_policy(),
            "PhaseRunner::run_phase: starting"
        );

        let timeout = phase.timeout.or(self.default_phase_timeout);
        let drain = self
            .scheduler
            .run(&phase.name, &mut phase.graph, cancel, timeout)
            .await;

        let counts = phase.graph.counts();
        let status = resolve_status(phase.exit_policy(), &drain, &counts);
        if let Err(e) = phase.transition(status) {
            warn!(phase = phase.name(), error = %e, "PhaseRunner::run_phase: status not recorded");
        }
        let ended_at = Utc::now();

        info!(
            phase = phase.name(),
            %status,
            completed = counts.completed,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "PhaseRunner::run_phase: resolved"
        );

        PhaseSummary {
            name: phase.name.clone(),
            status,
            exit_policy: phase.exit_policy(),
            counts,
            waves: drain.waves,
            started_at: Some(started_at),
            ended_at: Some(ended_at),
            duration_ms: (ended_at - started_at).num_milliseconds().try_into().ok(),
            structural_error: drain.structural_error,
            stuck: drain.stuck,
            interrupted: drain.interrupted,
            skip_reason: None,
            tasks: phase.graph.records(),
        }
    }
}
