//! Aggregation of one run into an immutable report.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{RunId, TaskState};
use crate::error::Result;
use crate::orchestration::closure::{ClosureGap, RemediationResult};
use crate::orchestration::phase::{PhaseStatus, PhaseSummary};

/// Name of the pointer file rewritten on every run.
pub const LATEST_REPORT: &str = "report-latest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Success,
    PartialFailure,
    Blocked,
}

impl OverallStatus {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            OverallStatus::Success => 0,
            OverallStatus::PartialFailure => 1,
            OverallStatus::Blocked => 2,
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverallStatus::Success => write!(f, "success"),
            OverallStatus::PartialFailure => write!(f, "partial_failure"),
            OverallStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Run identity and wall-clock bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMeta {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl RunMeta {
    pub fn start(run_id: RunId) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            started_at: now,
            ended_at: now,
        }
    }

    pub fn finish(mut self) -> Self {
        self.ended_at = Utc::now();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub overall_status: OverallStatus,
    pub phases: Vec<PhaseSummary>,
    pub gaps: Vec<ClosureGap>,
    /// One line per record that degraded the status.
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<RemediationResult>,
}

impl OrchestrationReport {
    pub fn phase(&self, name: &str) -> Option<&PhaseSummary> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Pure aggregation of phase summaries and gaps.
pub struct Reporter;

impl Reporter {
    pub fn build(phases: Vec<PhaseSummary>, gaps: Vec<ClosureGap>, meta: RunMeta) -> OrchestrationReport {
        Self::build_with_remediation(phases, gaps, None, meta)
    }

    /// `gaps` are the gaps left at the end of the run; the remediation
    /// block carries the plan and the before/after delta.
    pub fn build_with_remediation(
        phases: Vec<PhaseSummary>,
        gaps: Vec<ClosureGap>,
        remediation: Option<RemediationResult>,
        meta: RunMeta,
    ) -> OrchestrationReport {
        let (overall_status, reasons) = assess(&phases, &gaps);
        OrchestrationReport {
            run_id: meta.run_id,
            started_at: meta.started_at,
            ended_at: meta.ended_at,
            duration_ms: (meta.ended_at - meta.started_at)
                .num_milliseconds()
                .try_into()
                .unwrap_or(0),
            overall_status,
            phases,
            gaps,
            reasons,
            remediation,
        }
    }
}

/// Overall status and the reasons behind it.
fn assess(phases: &[PhaseSummary], gaps: &[ClosureGap]) -> (OverallStatus, Vec<String>) {
    let mut reasons = Vec::new();
    let mut blocked = false;

    for phase in phases {
        match phase.status {
            PhaseStatus::Blocked => {
                blocked = true;
                let why = if let Some(err) = &phase.structural_error {
                    err.clone()
                } else if phase.stuck {
                    "no ready tasks while tasks were pending".to_string()
                } else {
                    format!("{} task(s) did not complete", phase.counts.failures())
                };
                reasons.push(format!("phase '{}' blocked: {why}", phase.name));
            }
            PhaseStatus::NotStarted => {
                let why = phase
                    .skip_reason
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "not started".to_string());
                reasons.push(format!("phase '{}' skipped: {why}", phase.name));
                continue;
            }
            _ => {}
        }

        for task in &phase.tasks {
            match task.state {
                TaskState::Failed => reasons.push(format!(
                    "task '{}/{}' failed: {}",
                    phase.name,
                    task.id,
                    task.error.as_deref().unwrap_or("unknown error")
                )),
                TaskState::Cancelled => reasons.push(format!(
                    "task '{}/{}' cancelled: {}",
                    phase.name,
                    task.id,
                    task.cancel_reason
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "cancelled".to_string())
                )),
                _ => {}
            }
        }
    }

    for gap in gaps.iter().filter(|g| g.severity.is_blocking()) {
        reasons.push(format!(
            "{} gap: {} missing '{}'",
            gap.severity, gap.entity_id, gap.missing_stage
        ));
    }

    let status = if blocked {
        OverallStatus::Blocked
    } else if reasons.is_empty() {
        OverallStatus::Success
    } else {
        OverallStatus::PartialFailure
    };
    (status, reasons)
}

/// Writes reports as `report-<timestamp>.json` plus a latest pointer.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `report` and return the path of the timestamped file.
    pub fn write(&self, report: &OrchestrationReport) -> Result<PathBuf> {
        if !self.dir.exists() {
            debug!(dir = %self.dir.display(), "ReportWriter::write: creating report dir");
            fs::create_dir_all(&self.dir)?;
        }
        let json = report.to_json()?;
        let name = format!(
            "report-{}-{}.json",
            report.started_at.format("%Y%m%dT%H%M%SZ"),
            report.run_id.short()
        );
        let path = self.dir.join(name);
        fs::write(&path, &json)?;
        fs::write(self.dir.join(LATEST_REPORT), &json)?;
        debug!(path = %path.display(), "ReportWriter::write: saved");
        Ok(path)
    }
}
