//! Structured logging for wavegate.
//!
//! Log levels:
//! - ERROR: Failures that stop a run (config, IO)
//! - WARN: Blocked phases, stuck graphs, task failures
//! - INFO: Run, phase and wave lifecycle
//! - DEBUG: Per-task dispatch and completion
//! - TRACE: Ready-set computation
//!
//! Output goes to stderr so that stdout stays reserved for the JSON report.
//! Debug mode can be enabled with `--debug` flag or `WAVEGATE_DEBUG=1` env var.
//! `WAVEGATE_LOG` takes an `EnvFilter` directive and wins over both.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an explicit filter directive.
pub const LOG_ENV: &str = "WAVEGATE_LOG";

/// Environment variable enabling debug mode.
pub const DEBUG_ENV: &str = "WAVEGATE_DEBUG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "wavegate=debug,info"
    } else {
        "wavegate=info,warn"
    }
}
