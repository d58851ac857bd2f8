//! Closure verification over entity stage records.
//!
//! After the phases have run, every tracked entity must have passed through
//! each required stage. A missing or `false` record is a gap; there is no
//! path by which an absent record counts as done.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{handler_fn, ExitPolicy, TaskDef, TaskHandler, TaskId, TaskState};
use crate::orchestration::phase::{Phase, PhaseRunner, PhaseSummary};
use crate::orchestration::registry::EngineRegistry;

/// Name of the synthetic phase built by `remediate`.
pub const REMEDIATION_PHASE: &str = "closure-remediation";

/// `entity_id -> { stage: done }`
pub type StageRecords = BTreeMap<String, BTreeMap<String, bool>>;

/// Gap severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    /// Whether a remaining gap of this severity degrades the run.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "Critical"),
            Severity::High => write!(f, "High"),
            Severity::Medium => write!(f, "Medium"),
            Severity::Low => write!(f, "Low"),
        }
    }
}

/// Classification of a required stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Foundational,
    Verification,
    Observability,
    Other,
}

impl StageKind {
    pub fn severity(&self) -> Severity {
        match self {
            StageKind::Foundational => Severity::Critical,
            StageKind::Verification => Severity::High,
            StageKind::Observability => Severity::Medium,
            StageKind::Other => Severity::Low,
        }
    }

    fn suggested_action(&self, entity: &str, stage: &str) -> String {
        match self {
            StageKind::Foundational => {
                format!("Complete '{stage}' for {entity} before any downstream stage")
            }
            StageKind::Verification => format!("Run '{stage}' checks for {entity}"),
            StageKind::Observability => format!("Enable '{stage}' coverage for {entity}"),
            StageKind::Other => format!("Complete '{stage}' for {entity}"),
        }
    }
}

/// A tracked entity and its stage completion records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub stages: BTreeMap<String, bool>,
}

impl Entity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stages: BTreeMap::new(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>, done: bool) -> Self {
        self.stages.insert(stage.into(), done);
        self
    }

    /// Entities from a record map, ordered by id.
    pub fn from_records(records: StageRecords) -> Vec<Entity> {
        records
            .into_iter()
            .map(|(id, stages)| Entity { id, stages })
            .collect()
    }
}

/// One missing stage for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureGap {
    pub entity_id: String,
    pub missing_stage: String,
    pub severity: Severity,
    pub description: String,
    pub suggested_action: String,
}

impl ClosureGap {
    fn key(&self) -> (&str, &str) {
        (&self.entity_id, &self.missing_stage)
    }
}

fn gap_order(a: &ClosureGap, b: &ClosureGap) -> Ordering {
    a.severity
        .cmp(&b.severity)
        .then_with(|| a.entity_id.cmp(&b.entity_id))
        .then_with(|| a.missing_stage.cmp(&b.missing_stage))
}

/// Difference between two closure passes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GapDelta {
    pub resolved: Vec<ClosureGap>,
    pub introduced: Vec<ClosureGap>,
    pub persisting: Vec<ClosureGap>,
}

impl GapDelta {
    /// Compare gaps by entity and stage.
    pub fn between(prior: &[ClosureGap], current: &[ClosureGap]) -> Self {
        let prior_keys: HashSet<_> = prior.iter().map(ClosureGap::key).collect();
        let current_keys: HashSet<_> = current.iter().map(ClosureGap::key).collect();

        Self {
            resolved: prior
                .iter()
                .filter(|g| !current_keys.contains(&g.key()))
                .cloned()
                .collect(),
            introduced: current
                .iter()
                .filter(|g| !prior_keys.contains(&g.key()))
                .cloned()
                .collect(),
            persisting: current
                .iter()
                .filter(|g| prior_keys.contains(&g.key()))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.introduced.is_empty()
    }
}

/// Entities and the stages each must have reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureInput {
    pub entities: Vec<Entity>,
    pub required_stages: Vec<String>,
}

impl ClosureInput {
    pub fn new(entities: Vec<Entity>, required_stages: Vec<String>) -> Self {
        Self {
            entities,
            required_stages,
        }
    }
}

/// A ranked remediation step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationStep {
    pub rank: usize,
    pub entity_id: String,
    pub stage: String,
    pub severity: Severity,
    pub action: String,
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationResult {
    pub auto_fix: bool,
    pub plan: Vec<RemediationStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<ClosureGap>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<GapDelta>,
    /// Entity records after remediation.
    #[serde(skip)]
    pub entities: Vec<Entity>,
}

impl RemediationResult {
    /// Gaps left standing after this pass.
    pub fn remaining<'a>(&'a self, before: &'a [ClosureGap]) -> &'a [ClosureGap] {
        self.after.as_deref().unwrap_or(before)
    }
}

/// Checks entity records against required stages.
#[derive(Debug, Clone)]
pub struct ClosureVerifier {
    stage_kinds: HashMap<String, StageKind>,
    registry: Arc<EngineRegistry>,
}

impl Default for ClosureVerifier {
    fn default() -> Self {
        Self::new(Arc::new(EngineRegistry::default()))
    }
}

impl ClosureVerifier {
    /// Verifier with the default stage kinds, resolving remediation engines
    /// from `registry`.
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        let stage_kinds = HashMap::from([
            ("registered".to_string(), StageKind::Foundational),
            ("validated".to_string(), StageKind::Verification),
            ("monitored".to_string(), StageKind::Observability),
        ]);
        Self {
            stage_kinds,
            registry,
        }
    }

    pub fn with_stage_kind(mut self, stage: impl Into<String>, kind: StageKind) -> Self {
        self.stage_kinds.insert(stage.into(), kind);
        self
    }

    pub fn stage_kind(&self, stage: &str) -> StageKind {
        self.stage_kinds
            .get(stage)
            .copied()
            .unwrap_or(StageKind::Other)
    }

    /// Every (entity, required stage) pair that is not recorded as done.
    ///
    /// Sorted by severity, then entity id, then stage, so identical input
    /// always yields an identical list.
    pub fn verify(&self, entities: &[Entity], required_stages: &[String]) -> Vec<ClosureGap> {
        let mut gaps = Vec::new();
        let mut seen = HashSet::new();
        let stages: Vec<&String> = required_stages
            .iter()
            .filter(|s| seen.insert(s.as_str()))
            .collect();

        for entity in entities {
            for stage in &stages {
                let description = match entity.stages.get(stage.as_str()) {
                    Some(true) => continue,
                    Some(false) => format!("{} has '{stage}' recorded as incomplete", entity.id),
                    None => format!("{} has no '{stage}' record", entity.id),
                };
                let kind = self.stage_kind(stage);
                gaps.push(ClosureGap {
                    entity_id: entity.id.clone(),
                    missing_stage: stage.to_string(),
                    severity: kind.severity(),
                    description,
                    suggested_action: kind.suggested_action(&entity.id, stage),
                });
            }
        }

        gaps.sort_by(gap_order);
        debug!(
            entities = entities.len(),
            gaps = gaps.len(),
            "ClosureVerifier::verify"
        );
        gaps
    }

    /// Ranked plan for `gaps`, most severe first.
    pub fn plan(&self, gaps: &[ClosureGap]) -> Vec<RemediationStep> {
        let mut ranked = gaps.to_vec();
        ranked.sort_by(gap_order);
        ranked
            .into_iter()
            .enumerate()
            .map(|(i, gap)| RemediationStep {
                rank: i + 1,
                task_id: remediation_task_id(&gap.entity_id, &gap.missing_stage),
                entity_id: gap.entity_id,
                stage: gap.missing_stage,
                severity: gap.severity,
                action: gap.suggested_action,
            })
            .collect()
    }

    /// Produce a remediation plan and, with `auto_fix`, run it.
    ///
    /// Auto-fix runs one synthetic phase with a task per gap, chained per
    /// entity in required-stage order. Stages whose task completed are
    /// marked done on a copy of the records, which are then verified again.
    /// Without `auto_fix` nothing runs and nothing is modified.
    pub async fn remediate(
        &self,
        runner: &PhaseRunner,
        cancel: &CancellationToken,
        input: &ClosureInput,
        gaps: &[ClosureGap],
        auto_fix: bool,
    ) -> RemediationResult {
        let plan = self.plan(gaps);
        if !auto_fix || plan.is_empty() {
            return RemediationResult {
                auto_fix,
                plan,
                phase: None,
                after: None,
                delta: None,
                entities: input.entities.clone(),
            };
        }

        let mut phase = match self.remediation_phase(&plan, &input.required_stages) {
            Ok(phase) => phase,
            Err(e) => {
                // Only reachable when the same gap is passed twice.
                warn!(error = %e, "ClosureVerifier::remediate: could not build phase");
                return RemediationResult {
                    auto_fix,
                    plan,
                    phase: None,
                    after: None,
                    delta: None,
                    entities: input.entities.clone(),
                };
            }
        };
        info!(tasks = plan.len(), "ClosureVerifier::remediate: running remediation phase");
        let summary = runner.run_phase(cancel, &mut phase).await;

        let targets: HashMap<&TaskId, &RemediationStep> =
            plan.iter().map(|step| (&step.task_id, step)).collect();
        let mut entities = input.entities.clone();
        for record in summary.tasks.iter().filter(|t| t.state == TaskState::Completed) {
            let Some(step) = targets.get(&record.id) else {
                continue;
            };
            if let Some(entity) = entities.iter_mut().find(|e| e.id == step.entity_id) {
                entity.stages.insert(step.stage.clone(), true);
            }
        }

        let after = self.verify(&entities, &input.required_stages);
        let delta = GapDelta::between(gaps, &after);
        info!(
            resolved = delta.resolved.len(),
            remaining = after.len(),
            "ClosureVerifier::remediate: second pass"
        );

        RemediationResult {
            auto_fix,
            plan,
            phase: Some(summary),
            after: Some(after),
            delta: Some(delta),
            entities,
        }
    }

    fn remediation_phase(
        &self,
        plan: &[RemediationStep],
        required_stages: &[String],
    ) -> crate::error::Result<Phase> {
        let stage_rank = |stage: &str| {
            required_stages
                .iter()
                .position(|s| s == stage)
                .unwrap_or(usize::MAX)
        };

        let mut by_entity: BTreeMap<&str, Vec<&RemediationStep>> = BTreeMap::new();
        for step in plan {
            by_entity.entry(step.entity_id.as_str()).or_default().push(step);
        }

        let mut phase = Phase::new(REMEDIATION_PHASE, ExitPolicy::AllowPartialFailure);
        for steps in by_entity.values_mut() {
            steps.sort_by(|a, b| {
                stage_rank(&a.stage)
                    .cmp(&stage_rank(&b.stage))
                    .then_with(|| a.stage.cmp(&b.stage))
            });
            let mut previous: Option<&TaskId> = None;
            for step in steps.iter() {
                let handler = self.stage_handler(&step.stage);
                let mut def = TaskDef::from_handler(step.task_id.clone(), handler)
                    .with_params(json!({ "entity": step.entity_id, "stage": step.stage }));
                if let Some(prev) = previous {
                    def = def.depends_on([prev.clone()]);
                }
                phase.add_task(def)?;
                previous = Some(&step.task_id);
            }
        }
        Ok(phase)
    }

    fn stage_handler(&self, stage: &str) -> TaskHandler {
        match self.registry.handler(stage, None) {
            Ok(handler) => handler,
            Err(e) => {
                let message = e.to_string();
                handler_fn(move |_ctx| {
                    let message = message.clone();
                    async move { Err(anyhow!(message)) }
                })
            }
        }
    }
}

pub fn remediation_task_id(entity: &str, stage: &str) -> TaskId {
    TaskId::new(format!("remediate:{entity}:{stage}"))
}
