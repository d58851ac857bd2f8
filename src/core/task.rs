//! Task data model for the phase graphs.
//!
//! Tasks are the atomic units of work. Each task carries the handler that
//! performs it, its declared dependencies, and the execution record the
//! scheduler fills in as it moves through its lifecycle.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::TaskContext;

/// Identifier of a task, unique within its graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&String> for TaskId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

impl From<&TaskId> for TaskId {
    fn from(id: &TaskId) -> Self {
        id.clone()
    }
}

/// Task state in its lifecycle.
///
/// `Pending -> Running -> Completed | Failed`, or straight from `Pending`
/// to `Skipped` (disabled) or `Cancelled` (never dispatched).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskState {
    /// A state from which the task will not transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Skipped | TaskState::Cancelled
        )
    }

    /// States that degrade a phase.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Skipped => write!(f, "skipped"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a task was cancelled without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Nothing was ready while the task was still pending.
    UnmetOrCyclicDependency,
    /// A dependency ended in a state that cannot satisfy it.
    UpstreamFailed,
    /// The caller cancelled the run.
    RunCancelled,
    /// The phase deadline passed before the task was dispatched.
    PhaseTimeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UnmetOrCyclicDependency => write!(f, "unmet_or_cyclic_dependency"),
            CancelReason::UpstreamFailed => write!(f, "upstream_failed"),
            CancelReason::RunCancelled => write!(f, "run_cancelled"),
            CancelReason::PhaseTimeout => write!(f, "phase_timeout"),
        }
    }
}

/// Capability invoked to perform a task.
pub type TaskHandler =
    Arc<dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure into a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> TaskHandler
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Caller-supplied definition of a task.
#[derive(Clone)]
pub struct TaskDef {
    pub id: TaskId,
    pub dependencies: BTreeSet<TaskId>,
    pub enabled: bool,
    pub handler: TaskHandler,
    /// Arbitrary parameters handed to the handler through its context.
    pub params: Value,
    /// Per-task timeout, clamped to the phase deadline.
    pub timeout: Option<Duration>,
}

impl TaskDef {
    /// Define an enabled task with no dependencies.
    pub fn new<F, Fut>(id: impl Into<TaskId>, handler: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::from_handler(id, handler_fn(handler))
    }

    pub fn from_handler(id: impl Into<TaskId>, handler: TaskHandler) -> Self {
        Self {
            id: id.into(),
            dependencies: BTreeSet::new(),
            enabled: true,
            handler,
            params: Value::Null,
            timeout: None,
        }
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for TaskDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDef")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// What the executor observed while running one task.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// `Completed` or `Failed`.
    pub state: TaskState,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
}

/// A task inside a graph: its definition plus its execution record.
#[derive(Clone)]
pub struct Task {
    pub def: TaskDef,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cancel_reason: Option<CancelReason>,
}

impl Task {
    pub fn new(def: TaskDef) -> Self {
        Self {
            def,
            state: TaskState::Pending,
            started_at: None,
            ended_at: None,
            duration: None,
            result: None,
            error: None,
            cancel_reason: None,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.def.id
    }

    pub fn dependencies(&self) -> &BTreeSet<TaskId> {
        &self.def.dependencies
    }

    pub fn is_enabled(&self) -> bool {
        self.def.enabled
    }

    /// Transition to Running.
    pub fn start(&mut self) {
        self.state = TaskState::Running;
    }

    /// Record the executor's outcome.
    pub fn finish(&mut self, outcome: ExecutionOutcome) {
        self.state = outcome.state;
        self.result = outcome.result;
        self.error = outcome.error;
        self.started_at = Some(outcome.started_at);
        self.ended_at = Some(outcome.ended_at);
        self.duration = Some(outcome.duration);
    }

    /// Mark the task skipped (disabled tasks never run).
    pub fn skip(&mut self) {
        self.state = TaskState::Skipped;
    }

    /// Cancel a task that was never dispatched.
    pub fn cancel(&mut self, reason: CancelReason) {
        self.state = TaskState::Cancelled;
        self.cancel_reason = Some(reason);
        self.error = Some(reason.to_string());
    }

    /// Serializable snapshot of this task.
    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            id: self.def.id.clone(),
            dependencies: self.def.dependencies.iter().cloned().collect(),
            enabled: self.def.enabled,
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration.map(|d| d.as_millis() as u64),
            result: self.result.clone(),
            error: self.error.clone(),
            cancel_reason: self.cancel_reason,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.def.id)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

/// Immutable per-task entry of a phase summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: TaskId,
    pub dependencies: Vec<TaskId>,
    pub enabled: bool,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
}
