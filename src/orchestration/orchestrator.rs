//! One orchestration run from phases to report.
//!
//! An `Orchestrator` is built explicitly for each run and passed wherever
//! it is needed. Two orchestrators share nothing, so independent runs can
//! proceed side by side.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::core::RunId;
use crate::orchestration::closure::{ClosureInput, ClosureVerifier, StageKind};
use crate::orchestration::executor::Executor;
use crate::orchestration::phase::{Phase, PhaseRunner};
use crate::orchestration::registry::EngineRegistry;
use crate::orchestration::report::{OrchestrationReport, Reporter, RunMeta};
use crate::orchestration::scheduler::{SchedulerEvent, WaveScheduler};

pub struct Orchestrator {
    config: Config,
    registry: Arc<EngineRegistry>,
    verifier: ClosureVerifier,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Orchestrator {
    pub fn new(config: Config, registry: EngineRegistry) -> Self {
        let registry = Arc::new(registry);
        Self {
            verifier: ClosureVerifier::new(Arc::clone(&registry)),
            config,
            registry,
            event_tx: None,
        }
    }

    /// Reclassify a closure stage.
    pub fn with_stage_kind(mut self, stage: impl Into<String>, kind: StageKind) -> Self {
        self.verifier = self.verifier.with_stage_kind(stage, kind);
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn verifier(&self) -> &ClosureVerifier {
        &self.verifier
    }

    fn runner(&self, run_id: RunId) -> PhaseRunner {
        let mut scheduler = WaveScheduler::new(
            run_id,
            Executor::new(self.config.task_timeout()),
            self.config.max_concurrency,
        );
        if let Some(tx) = &self.event_tx {
            scheduler = scheduler.with_events(tx.clone());
        }
        PhaseRunner::new(scheduler).with_phase_timeout(self.config.phase_timeout())
    }

    /// Run `phases`, verify closure and build the report.
    ///
    /// With `closure` set, remaining gaps get a ranked remediation plan;
    /// with `auto_fix` configured the plan is also executed and the report
    /// carries the gaps left after the second pass.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        phases: Vec<Phase>,
        closure: Option<ClosureInput>,
    ) -> OrchestrationReport {
        let run_id = RunId::new();
        let meta = RunMeta::start(run_id);
        info!(run = %run_id.short(), phases = phases.len(), "Orchestrator::run: starting");

        let runner = self.runner(run_id);
        let summaries = runner.run_phases(cancel, phases).await;

        let (gaps, remediation) = match closure {
            None => (Vec::new(), None),
            Some(input) => {
                let before = self.verifier.verify(&input.entities, &input.required_stages);
                if before.is_empty() {
                    (before, None)
                } else {
                    let result = self
                        .verifier
                        .remediate(&runner, cancel, &input, &before, self.config.auto_fix())
                        .await;
                    let remaining = result.remaining(&before).to_vec();
                    (remaining, Some(result))
                }
            }
        };

        let report = Reporter::build_with_remediation(summaries, gaps, remediation, meta.finish());
        info!(
            run = %run_id.short(),
            status = %report.overall_status,
            gaps = report.gaps.len(),
            duration_ms = report.duration_ms,
            "Orchestrator::run: finished"
        );
        report
    }
}
