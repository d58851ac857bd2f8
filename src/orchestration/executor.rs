//! Safe-call wrapper around a single task handler.
//!
//! The handler runs on its own tokio task so a panic surfaces as a
//! `JoinError` instead of unwinding into the scheduler. Timeouts abort the
//! handler's task and report `Error::Timeout`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::core::{ExecutionOutcome, TaskContext, TaskDef, TaskState};
use crate::error::{Error, Result};

/// Invokes task handlers and times them.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    /// Applied to tasks that do not set their own timeout.
    default_timeout: Option<Duration>,
}

impl Executor {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self { default_timeout }
    }

    /// Timeout for `def`, clamped to what is left before `deadline`.
    pub fn effective_timeout(&self, def: &TaskDef, deadline: Option<Instant>) -> Option<Duration> {
        let own = def.timeout.or(self.default_timeout);
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match (own, remaining) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run one task's handler to completion, failure, panic or timeout.
    ///
    /// Never returns an error: every failure mode is folded into a
    /// `Failed` outcome carrying the message.
    pub async fn run(&self, ctx: TaskContext, def: &TaskDef, deadline: Option<Instant>) -> ExecutionOutcome {
        let limit = self.effective_timeout(def, deadline);
        let task_id = ctx.task_id.clone();
        debug!(task = %task_id, ?limit, "Executor::run: invoking handler");

        let started_at = Utc::now();
        let clock = Instant::now();
        let result = invoke(ctx, def, limit).await;
        let duration = clock.elapsed();
        let ended_at = Utc::now();

        match result {
            Ok(value) => {
                debug!(task = %task_id, ?duration, "Executor::run: completed");
                ExecutionOutcome {
                    state: TaskState::Completed,
                    result: Some(value),
                    error: None,
                    started_at,
                    ended_at,
                    duration,
                }
            }
            Err(e) => {
                debug!(task = %task_id, ?duration, error = %e, "Executor::run: failed");
                ExecutionOutcome {
                    state: TaskState::Failed,
                    result: None,
                    error: Some(e.to_string()),
                    started_at,
                    ended_at,
                    duration,
                }
            }
        }
    }
}

async fn invoke(ctx: TaskContext, def: &TaskDef, limit: Option<Duration>) -> Result<Value> {
    let handler = Arc::clone(&def.handler);
    // The handler is called inside the spawned task so that a panic while
    // building its future is caught as well.
    let mut join = tokio::spawn(async move { handler(ctx).await });

    let joined = match limit {
        Some(limit) => match timeout(limit, &mut join).await {
            Ok(joined) => joined,
            Err(_) => {
                join.abort();
                return Err(Error::Timeout(limit));
            }
        },
        None => (&mut join).await,
    };

    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Handler(format!("{e:#}"))),
        Err(join_err) if join_err.is_panic() => {
            Err(Error::Panicked(panic_message(join_err.into_panic())))
        }
        Err(join_err) => Err(Error::TaskJoin(join_err.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
