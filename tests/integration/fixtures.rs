//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Task definitions with canned behaviour (succeed, fail, panic, sleep)
//! - A shared call log to observe which handlers ran
//! - A concurrency probe recording the peak number of running handlers
//! - Runners and orchestrators with test-friendly defaults

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::{json, Value};
use tempfile::TempDir;

use wavegate::config::Config;
use wavegate::core::{RunId, TaskDef, TaskId, TaskRecord, TaskState};
use wavegate::orchestration::{
    EngineRegistry, Executor, Orchestrator, PhaseRunner, PhaseSummary, WaveScheduler,
};

/// Names of handlers in the order they were invoked.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str) {
        self.calls.lock().unwrap().push(id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().unwrap().is_empty()
    }
}

/// Tracks how many probed handlers run at once.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// A task that holds a slot for `ms` milliseconds.
    pub fn task(&self, id: &str, ms: u64) -> TaskDef {
        let probe = self.clone();
        TaskDef::new(id, move |_ctx| {
            let probe = probe.clone();
            async move {
                let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
                probe.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                probe.current.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
    }
}

/// A task that succeeds and returns its own id.
pub fn ok_task(id: &str) -> TaskDef {
    let name = id.to_string();
    TaskDef::new(id, move |_ctx| {
        let name = name.clone();
        async move { Ok(json!(name)) }
    })
}

/// A task that records itself in `log` and succeeds.
pub fn logged_task(id: &str, log: &CallLog) -> TaskDef {
    let name = id.to_string();
    let log = log.clone();
    TaskDef::new(id, move |_ctx| {
        log.record(&name);
        async { Ok(Value::Null) }
    })
}

/// A task that records itself in `log` and then fails with `message`.
pub fn failing_task(id: &str, message: &str, log: &CallLog) -> TaskDef {
    let name = id.to_string();
    let message = message.to_string();
    let log = log.clone();
    TaskDef::new(id, move |_ctx| {
        log.record(&name);
        let message = message.clone();
        async move { Err::<Value, _>(anyhow!(message)) }
    })
}

/// A task whose handler panics with `message`.
pub fn panicking_task(id: &str, message: &str) -> TaskDef {
    let message = message.to_string();
    TaskDef::new(id, move |_ctx| {
        let message = message.clone();
        async move {
            if !message.is_empty() {
                panic!("{message}");
            }
            Ok(Value::Null)
        }
    })
}

/// A task that sleeps for `ms` milliseconds and succeeds.
pub fn sleeping_task(id: &str, ms: u64) -> TaskDef {
    TaskDef::new(id, move |_ctx| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(Value::Null)
    })
}

/// A task that waits until its context is cancelled.
pub fn cancellable_task(id: &str) -> TaskDef {
    TaskDef::new(id, |ctx| async move {
        ctx.cancel.cancelled().await;
        Err::<Value, _>(anyhow!("stopped by cancellation"))
    })
}

/// Runner over a fresh run id.
pub fn runner(max_concurrency: Option<usize>) -> PhaseRunner {
    PhaseRunner::new(WaveScheduler::new(
        RunId::new(),
        Executor::default(),
        max_concurrency,
    ))
}

pub fn orchestrator(config: Config) -> Orchestrator {
    Orchestrator::new(config, EngineRegistry::new())
}

pub fn task<'a>(summary: &'a PhaseSummary, id: &str) -> &'a TaskRecord {
    summary
        .task(id)
        .unwrap_or_else(|| panic!("task {id} missing from phase {}", summary.name))
}

pub fn state(summary: &PhaseSummary, id: &str) -> TaskState {
    task(summary, id).state
}

pub fn ids(ids: &[&str]) -> Vec<TaskId> {
    ids.iter().map(|id| TaskId::new(*id)).collect()
}

/// A temporary directory holding a plan file.
pub struct PlanDir {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl PlanDir {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        Self { temp_dir, path }
    }

    /// Write `plan.toml` and return its path.
    pub fn write_plan(&self, text: &str) -> PathBuf {
        self.write("plan.toml", text)
    }

    pub fn write(&self, name: &str, text: &str) -> PathBuf {
        let path = self.path.join(name);
        std::fs::write(&path, text).expect("Failed to write file");
        path
    }

    pub fn exists(&self, name: &str) -> bool {
        Path::new(&self.path).join(name).exists()
    }
}
