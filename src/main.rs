use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wavegate::config::Config;
use wavegate::orchestration::{ClosureVerifier, Orchestrator, ReportWriter};
use wavegate::plan::Plan;
use wavegate::{Error, Result};

/// Wavegate - dependency-aware phased task orchestrator
#[derive(Parser, Debug)]
#[command(name = "wavegate")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WAVEGATE_DEBUG=1    Enable debug logging (alternative to --debug)\n    WAVEGATE_LOG=...    Log filter directive, overrides both")]
pub struct Cli {
    /// Enable debug logging on stderr
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run every phase of a plan and write the report
    Run {
        /// Path to the TOML plan
        plan: PathBuf,

        /// Maximum number of tasks running at once
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Directory for report files (default: ~/.wavegate/reports)
        #[arg(long)]
        report_dir: Option<PathBuf>,

        /// Execute remediation for closure gaps
        #[arg(long)]
        auto_fix: bool,
    },

    /// Check every phase graph for structural errors without running tasks
    Validate {
        /// Path to the TOML plan
        plan: PathBuf,
    },

    /// Verify closure of the plan's entity records and print ranked gaps
    Verify {
        /// Path to the TOML plan
        plan: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    wavegate::log::init_with_debug(cli.debug);

    let code = match cli.command {
        Command::Run {
            plan,
            max_concurrency,
            report_dir,
            auto_fix,
        } => {
            let overrides = Config {
                max_concurrency,
                report_dir: report_dir.map(|d| d.display().to_string()),
                auto_fix: auto_fix.then_some(true),
                ..Config::default()
            };
            run_plan(plan, overrides)?
        }
        Command::Validate { plan } => run_validate(plan)?,
        Command::Verify { plan } => run_verify(plan)?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Run a plan; the exit code follows the overall status.
fn run_plan(path: PathBuf, overrides: Config) -> Result<i32> {
    info!(plan = %path.display(), "Run command");
    let plan = Plan::load(&path)?;
    let config = Config::load()?.merge(&plan.orchestrator).merge(&overrides);
    config.validate()?;

    let phases = plan.build_phases()?;
    let closure = plan.closure_input()?;
    let mut orchestrator = Orchestrator::new(config.clone(), plan.registry()?);
    for (stage, kind) in plan.stage_kinds() {
        orchestrator = orchestrator.with_stage_kind(stage.clone(), *kind);
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                on_interrupt.cancel();
            }
        });
        orchestrator.run(&cancel, phases, closure).await
    });

    let writer = ReportWriter::new(config.report_dir()?);
    match writer.write(&report) {
        Ok(saved) => info!(path = %saved.display(), "Report written"),
        Err(e) => warn!(error = %e, "Failed to write report"),
    }

    println!("{}", report.to_json()?);
    Ok(report.overall_status.exit_code())
}

/// Structural validation only. Exit code 2 if any phase is invalid.
fn run_validate(path: PathBuf) -> Result<i32> {
    info!(plan = %path.display(), "Validate command");
    let plan = Plan::load(&path)?;
    let checks = plan.check();
    let valid = checks.iter().all(|c| c.error.is_none());

    let output = json!({
        "valid": valid,
        "phases": checks,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(if valid { 0 } else { 2 })
}

/// Closure verification only. Exit code 1 if any Critical or High gap remains.
fn run_verify(path: PathBuf) -> Result<i32> {
    info!(plan = %path.display(), "Verify command");
    let plan = Plan::load(&path)?;
    let input = plan
        .closure_input()?
        .ok_or_else(|| Error::Validation("plan has no [closure] table".to_string()))?;

    let mut verifier = ClosureVerifier::default();
    for (stage, kind) in plan.stage_kinds() {
        verifier = verifier.with_stage_kind(stage.clone(), *kind);
    }
    let gaps = verifier.verify(&input.entities, &input.required_stages);
    let remediation = verifier.plan(&gaps);
    let blocking = gaps.iter().any(|g| g.severity.is_blocking());

    let output = json!({
        "entities": input.entities.len(),
        "requiredStages": input.required_stages,
        "gaps": gaps,
        "plan": remediation,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(if blocking { 1 } else { 0 })
}
