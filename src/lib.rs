pub mod command;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod plan;

pub use error::{Error, Result};
pub use orchestration::{OrchestrationReport, Orchestrator, OverallStatus};
