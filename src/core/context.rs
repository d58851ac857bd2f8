//! Per-run identity and the context handed to task handlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::task::TaskId;

/// Unique identifier for one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What a handler sees of the orchestrator.
///
/// Handlers never get access to the graph. The cancellation token fires
/// when the caller cancels the run or the phase deadline passes; handlers
/// may observe it to stop early.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub run_id: RunId,
    pub phase: String,
    pub task_id: TaskId,
    pub params: Value,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(run_id: RunId, phase: &str, task_id: TaskId, params: Value) -> Self {
        Self {
            run_id,
            phase: phase.to_string(),
            task_id,
            params,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// String parameter lookup.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
