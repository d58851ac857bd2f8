//! Orchestration layer for wavegate.
//!
//! Phases of task graphs are drained wave by wave through the executor,
//! closure is verified against entity stage records, and everything is
//! folded into one report per run.

pub mod closure;
pub mod executor;
pub mod orchestrator;
pub mod phase;
pub mod registry;
pub mod report;
pub mod scheduler;

pub use closure::{
    ClosureGap, ClosureInput, ClosureVerifier, Entity, GapDelta, RemediationResult,
    RemediationStep, Severity, StageKind, StageRecords, REMEDIATION_PHASE,
};
pub use executor::Executor;
pub use orchestrator::Orchestrator;
pub use phase::{Phase, PhaseRunner, PhaseStatus, PhaseSummary, SkipReason};
pub use registry::{Engine, EngineRegistry, FnEngine};
pub use report::{OrchestrationReport, OverallStatus, ReportWriter, Reporter, RunMeta};
pub use scheduler::{DrainOutcome, SchedulerEvent, WaveScheduler};
