//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for per-task raw logs and session scratch space.
    pub data_dir: PathBuf,

    /// Wall-clock limit for a single worker session invocation.
    pub worker_timeout: Duration,

    /// Wall-clock limit for a single supervisor assessment cycle.
    pub supervisor_timeout: Duration,

    /// Default supervisor wake cadence when a task does not set its own.
    pub default_check_interval: Duration,

    /// When true, new tasks start in `proposed` and wait for approval.
    pub require_approval: bool,

    /// How long a controller gets to wind down before being aborted.
    pub stop_grace: Duration,

    /// Worker controller subprocess poll cadence.
    pub poll_interval: Duration,

    pub watchdog: WatchdogConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            worker_timeout: Duration::from_secs(600),
            supervisor_timeout: Duration::from_secs(120),
            default_check_interval: Duration::from_secs(120),
            require_approval: false,
            stop_grace: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            watchdog: WatchdogConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Watchdog sweep thresholds.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// How often the watchdog scans active tasks.
    pub sweep_interval: Duration,

    /// Idle time before a warning is recorded and the worker is nudged.
    pub warn_after: Duration,

    /// Idle time before the worker is force-restarted.
    pub restart_after: Duration,

    /// Minimum task age before staleness checks apply.
    pub grace: Duration,

    /// Restarts allowed before the task is failed outright.
    pub max_restarts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            warn_after: Duration::from_secs(300),
            restart_after: Duration::from_secs(900),
            grace: Duration::from_secs(60),
            max_restarts: 2,
        }
    }
}

/// Scheduler sweep cadence.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often due jobs are scanned for.
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
        }
    }
}
