use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Upper bound on tasks running at once; unbounded when unset.
    pub max_concurrency: Option<usize>,
    /// Default per-task timeout.
    pub task_timeout_secs: Option<u64>,
    /// Default per-phase deadline.
    pub phase_timeout_secs: Option<u64>,
    pub report_dir: Option<String>,
    /// Run remediation for closure gaps; unset means off.
    pub auto_fix: Option<bool>,
}

impl Config {
    pub fn wavegate_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".wavegate"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::wavegate_dir()?.join("wavegate.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_concurrency = ?config.max_concurrency,
            task_timeout_secs = ?config.task_timeout_secs,
            phase_timeout_secs = ?config.phase_timeout_secs,
            auto_fix = ?config.auto_fix,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.exists()) {
            debug!(dir = %dir.display(), "Creating wavegate directory");
            fs::create_dir_all(dir)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == Some(0) {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_secs == Some(0) || self.phase_timeout_secs == Some(0) {
            return Err(Error::Validation("timeouts must be at least 1 second".to_string()));
        }
        Ok(())
    }

    /// Layer `other` on top of `self`; set values in `other` win.
    pub fn merge(self, other: &Config) -> Config {
        Config {
            max_concurrency: other.max_concurrency.or(self.max_concurrency),
            task_timeout_secs: other.task_timeout_secs.or(self.task_timeout_secs),
            phase_timeout_secs: other.phase_timeout_secs.or(self.phase_timeout_secs),
            report_dir: other.report_dir.clone().or(self.report_dir),
            auto_fix: other.auto_fix.or(self.auto_fix),
        }
    }

    pub fn auto_fix(&self) -> bool {
        self.auto_fix.unwrap_or(false)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_secs.map(Duration::from_secs)
    }

    /// Anchor a relative `report_dir` at `base`; absolute and `~/` paths
    /// are left alone.
    pub fn resolve_report_dir(&mut self, base: &Path) {
        if let Some(dir) = self.report_dir.as_mut() {
            if !dir.starts_with('~') && Path::new(dir.as_str()).is_relative() {
                *dir = base.join(dir.as_str()).display().to_string();
            }
        }
    }

    pub fn report_dir(&self) -> Result<PathBuf> {
        match &self.report_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::wavegate_dir()?.join("reports")),
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
