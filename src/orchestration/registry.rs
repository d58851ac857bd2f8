//! Typed registry of pluggable engines.
//!
//! Engines are registered at startup under a name and version and resolved
//! by name when a phase needs them. A resolved engine is adapted into an
//! ordinary task handler, so the scheduler never knows the difference.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::core::{TaskContext, TaskHandler};
use crate::error::{Error, Result};

/// A capability that can be executed as a task.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

type EngineFn = dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Engine backed by an async closure.
pub struct FnEngine {
    name: String,
    version: String,
    f: Box<EngineFn>,
}

impl FnEngine {
    pub fn new<F, Fut>(name: impl Into<String>, version: impl Into<String>, f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            version: version.into(),
            f: Box::new(move |ctx| f(ctx).boxed()),
        }
    }
}

#[async_trait]
impl Engine for FnEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        (self.f)(ctx).await
    }
}

/// Engines by name, each name holding its versions in registration order.
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Vec<Arc<dyn Engine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine.
    ///
    /// # Errors
    /// `DuplicateEngine` if the same name and version are already present.
    pub fn register(&mut self, engine: Arc<dyn Engine>) -> Result<()> {
        let versions = self.engines.entry(engine.name().to_string()).or_default();
        if versions.iter().any(|e| e.version() == engine.version()) {
            return Err(Error::DuplicateEngine {
                name: engine.name().to_string(),
                version: engine.version().to_string(),
            });
        }
        debug!(
            name = engine.name(),
            version = engine.version(),
            "EngineRegistry::register"
        );
        versions.push(engine);
        Ok(())
    }

    /// Resolve an engine by name.
    ///
    /// Without a version the most recently registered one wins.
    pub fn resolve(&self, name: &str, version: Option<&str>) -> Option<Arc<dyn Engine>> {
        let versions = self.engines.get(name)?;
        match version {
            Some(v) => versions.iter().find(|e| e.version() == v).cloned(),
            None => versions.last().cloned(),
        }
    }

    /// Adapt a registered engine into a task handler.
    pub fn handler(&self, name: &str, version: Option<&str>) -> Result<TaskHandler> {
        let engine = self.resolve(name, version).ok_or_else(|| {
            Error::EngineNotFound(match version {
                Some(v) => format!("{name}@{v}"),
                None => name.to_string(),
            })
        })?;
        Ok(engine_handler(engine))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.engines.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}

fn engine_handler(engine: Arc<dyn Engine>) -> TaskHandler {
    Arc::new(move |ctx| {
        let engine = Arc::clone(&engine);
        async move { engine.execute(ctx).await }.boxed()
    })
}
