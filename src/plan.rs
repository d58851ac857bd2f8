//! TOML run plans.
//!
//! A plan lists phases of shell-command tasks, an optional `[orchestrator]`
//! table that overrides the user config, and an optional `[closure]` table
//! with entity stage records and per-stage remediation commands.
//!
//! ```toml
//! [orchestrator]
//! max_concurrency = 4
//!
//! [[phases]]
//! name = "register"
//! exit_policy = "require_all_completed"
//!
//! [[phases.tasks]]
//! id = "schema"
//! command = "./register.sh schema"
//!
//! [[phases.tasks]]
//! id = "audit"
//! command = "./audit.sh"
//! depends_on = ["schema"]
//!
//! [closure]
//! required_stages = ["registered", "validated", "monitored"]
//! records_file = "records.json"
//!
//! [closure.remediation]
//! validated = "./validate.sh {entity}"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::{CommandEngine, ShellCommand};
use crate::config::Config;
use crate::core::{ExitPolicy, TaskDef, TaskGraph};
use crate::error::{Error, Result};
use crate::orchestration::{ClosureInput, Entity, EngineRegistry, Phase, StageKind, StageRecords};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub orchestrator: Config,
    #[serde(default)]
    pub phases: Vec<PhasePlan>,
    pub closure: Option<ClosurePlan>,
    /// Directory relative paths and commands resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasePlan {
    pub name: String,
    #[serde(default)]
    pub exit_policy: ExitPolicy,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub tasks: Vec<TaskPlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClosurePlan {
    pub required_stages: Vec<String>,
    /// Inline records; merged over `records_file`.
    #[serde(default)]
    pub entities: StageRecords,
    /// JSON file of `entity_id -> { stage: bool }`.
    pub records_file: Option<String>,
    /// Stage name to remediation command template.
    #[serde(default)]
    pub remediation: BTreeMap<String, String>,
    #[serde(default)]
    pub stage_kinds: BTreeMap<String, StageKind>,
}

/// Structural check result for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCheck {
    pub name: String,
    pub tasks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Plan::load");
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let plan = Self::from_toml(&fs::read_to_string(path)?, base_dir)?;
        debug!(phases = plan.phases.len(), "Plan loaded");
        Ok(plan)
    }

    /// Parse a plan whose relative paths resolve against `base_dir`.
    pub fn from_toml(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut plan: Plan = toml::from_str(text)?;
        plan.base_dir = base_dir.into();
        plan.orchestrator.resolve_report_dir(&plan.base_dir);
        plan.validate()?;
        Ok(plan)
    }

    /// Checks that need no graph: names present and unique.
    pub fn validate(&self) -> Result<()> {
        self.orchestrator.validate()?;
        let mut names = std::collections::HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return Err(Error::Validation("phase name must not be empty".to_string()));
            }
            if !names.insert(phase.name.as_str()) {
                return Err(Error::Validation(format!("duplicate phase name: {}", phase.name)));
            }
            if let Some(task) = phase.tasks.iter().find(|t| t.id.trim().is_empty()) {
                return Err(Error::Validation(format!(
                    "phase {}: task id must not be empty (command `{}`)",
                    phase.name, task.command
                )));
            }
        }
        Ok(())
    }

    fn task_def(&self, task: &TaskPlan) -> TaskDef {
        let handler = ShellCommand::new(&task.command, &self.base_dir)
            .with_env(task.env.clone())
            .into_handler();
        let mut def = TaskDef::from_handler(task.id.as_str(), handler)
            .depends_on(task.depends_on.iter().map(String::as_str))
            .enabled(task.enabled);
        if let Some(secs) = task.timeout_secs {
            def = def.with_timeout(Duration::from_secs(secs));
        }
        def
    }

    /// Phases ready to hand to the orchestrator.
    ///
    /// # Errors
    /// `DuplicateTask` if a phase declares the same task id twice.
    pub fn build_phases(&self) -> Result<Vec<Phase>> {
        self.phases
            .iter()
            .map(|p| -> Result<Phase> {
                let mut phase = Phase::with_tasks(
                    p.name.as_str(),
                    p.exit_policy,
                    p.tasks.iter().map(|t| self.task_def(t)),
                )?;
                if let Some(secs) = p.timeout_secs {
                    phase = phase.with_timeout(Duration::from_secs(secs));
                }
                Ok(phase)
            })
            .collect()
    }

    /// Structural validation of every phase graph. Nothing runs.
    pub fn check(&self) -> Vec<PhaseCheck> {
        self.phases
            .iter()
            .map(|p| {
                let error = TaskGraph::from_defs(p.exit_policy, p.tasks.iter().map(|t| self.task_def(t)))
                    .and_then(|graph| graph.validate())
                    .err()
                    .map(|e| e.to_string());
                PhaseCheck {
                    name: p.name.clone(),
                    tasks: p.tasks.len(),
                    error,
                }
            })
            .collect()
    }

    /// Entity records and required stages, if the plan has a closure table.
    pub fn closure_input(&self) -> Result<Option<ClosureInput>> {
        let Some(closure) = &self.closure else {
            return Ok(None);
        };
        let mut records = match &closure.records_file {
            Some(file) => {
                let path = self.base_dir.join(file);
                debug!(path = %path.display(), "Plan::closure_input: loading records");
                serde_json::from_str::<StageRecords>(&fs::read_to_string(path)?)?
            }
            None => StageRecords::new(),
        };
        for (entity, stages) in &closure.entities {
            records
                .entry(entity.clone())
                .or_default()
                .extend(stages.iter().map(|(k, v)| (k.clone(), *v)));
        }
        Ok(Some(ClosureInput::new(
            Entity::from_records(records),
            closure.required_stages.clone(),
        )))
    }

    /// Command engines for the closure remediation table.
    pub fn registry(&self) -> Result<EngineRegistry> {
        let mut registry = EngineRegistry::new();
        if let Some(closure) = &self.closure {
            for (stage, command) in &closure.remediation {
                let template = ShellCommand::new(command, &self.base_dir);
                registry.register(Arc::new(CommandEngine::new(stage, template)))?;
            }
        }
        Ok(registry)
    }

    pub fn stage_kinds(&self) -> impl Iterator<Item = (&String, &StageKind)> {
        self.closure.iter().flat_map(|c| c.stage_kinds.iter())
    }
}
