//! Core domain models for wavegate orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: tasks, the per-phase task graph, and the context
//! handed to task handlers.

pub mod context;
pub mod graph;
pub mod task;

pub use context::{RunId, TaskContext};
pub use graph::{ExitPolicy, TaskCounts, TaskGraph};
pub use task::{
    handler_fn, CancelReason, ExecutionOutcome, Task, TaskDef, TaskHandler, TaskId, TaskRecord,
    TaskState,
};
