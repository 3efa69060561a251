use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Scheduler configuration loaded from `~/.config/fetchq/config.toml`.
///
/// Concurrency ceilings are `None` by default, which means effectively
/// unbounded; set them to gate dispatch globally, per host, or per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum tasks dispatched at once across all hosts and groups.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    /// Maximum tasks dispatched at once per URL host.
    #[serde(default)]
    pub max_concurrent_per_host: Option<usize>,
    /// Maximum tasks dispatched at once per task group.
    #[serde(default)]
    pub max_concurrent_per_group: Option<usize>,
    /// Interval for the counter-reconciliation timer that recomputes ground
    /// truth from live workers (guards against lost completion signals).
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    /// Minimum spacing between forwarded progress updates per task
    /// (~2 per second by default; the first and terminal values always pass).
    #[serde(default = "default_progress_ms")]
    pub progress_interval_ms: u64,
}

fn default_reconcile_secs() -> u64 {
    10
}

fn default_progress_ms() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            max_concurrent_per_host: None,
            max_concurrent_per_group: None,
            reconcile_interval_secs: default_reconcile_secs(),
            progress_interval_ms: default_progress_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("fetchq")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SchedulerConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SchedulerConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SchedulerConfig = toml::from_str(&data)?;
    Ok(cfg)
}
