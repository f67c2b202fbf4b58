use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the probes producer daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Producer socket of the tracing service.
    #[serde(default = "default_socket")]
    pub socket: String,

    /// Self-protection watchdog configuration.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Shared-memory size hint sent on connect. Default: 1MiB.
    #[serde(default = "default_shm_size_hint")]
    pub shm_size_hint_bytes: usize,

    /// Shared-memory page size hint sent on connect. Default: 32KiB.
    #[serde(default = "default_shm_page_size_hint")]
    pub shm_page_size_hint_bytes: usize,
}

/// Self-protection watchdog configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Cadence of the resource sampler. Default: 30s.
    #[serde(default = "default_polling_interval", with = "humantime_serde")]
    pub polling_interval: Duration,

    /// CPU usage limit as a percentage (0 disables). Default: 75.
    #[serde(default = "default_cpu_limit_percentage")]
    pub cpu_limit_percentage: u32,

    /// Window over which the CPU limit is evaluated. Default: 30s.
    #[serde(default = "default_limit_window", with = "humantime_serde")]
    pub cpu_limit_window: Duration,

    /// Absolute resident-memory limit in bytes (0 derives the limit from
    /// the shared-memory size once tracing is set up). Default: 0.
    #[serde(default)]
    pub memory_limit_bytes: u64,

    /// Window over which the memory limit is evaluated. Default: 30s.
    #[serde(default = "default_limit_window", with = "humantime_serde")]
    pub memory_limit_window: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_socket() -> String {
    "/run/probekit/producer.sock".to_string()
}

fn default_shm_size_hint() -> usize {
    crate::service::SHM_SIZE_HINT_BYTES
}

fn default_shm_page_size_hint() -> usize {
    crate::service::SHM_PAGE_SIZE_HINT_BYTES
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_cpu_limit_percentage() -> u32 {
    75
}

fn default_limit_window() -> Duration {
    Duration::from_secs(30)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            socket: default_socket(),
            watchdog: WatchdogConfig::default(),
            shm_size_hint_bytes: default_shm_size_hint(),
            shm_page_size_hint_bytes: default_shm_page_size_hint(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            polling_interval: default_polling_interval(),
            cpu_limit_percentage: default_cpu_limit_percentage(),
            cpu_limit_window: default_limit_window(),
            memory_limit_bytes: 0,
            memory_limit_window: default_limit_window(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.socket.is_empty() {
            bail!("socket is required");
        }

        if self.shm_size_hint_bytes == 0 {
            bail!("shm_size_hint_bytes must be positive");
        }

        let wd = &self.watchdog;
        if wd.polling_interval.is_zero() {
            bail!("watchdog.polling_interval must be positive");
        }

        if wd.cpu_limit_percentage > 100 {
            bail!("watchdog.cpu_limit_percentage must be at most 100");
        }

        if wd.cpu_limit_percentage > 0 && !window_aligned(wd.cpu_limit_window, wd.polling_interval)
        {
            bail!("watchdog.cpu_limit_window must be a multiple of the polling interval");
        }

        if wd.memory_limit_bytes > 0
            && !window_aligned(wd.memory_limit_window, wd.polling_interval)
        {
            bail!("watchdog.memory_limit_window must be a multiple of the polling interval");
        }

        Ok(())
    }
}

impl WatchdogConfig {
    /// Program `watchdog` with these limits.
    ///
    /// The watchdog's polling interval must divide the configured windows;
    /// [`Config::validate`] enforces that against `polling_interval`.
    pub fn apply(&self, watchdog: &crate::watchdog::Watchdog) {
        watchdog.set_cpu_limit(
            self.cpu_limit_percentage,
            self.cpu_limit_window.as_millis() as u32,
        );
        if self.memory_limit_bytes > 0 {
            watchdog.set_memory_limit(
                self.memory_limit_bytes,
                self.memory_limit_window.as_millis() as u32,
            );
        }
    }
}

fn window_aligned(window: Duration, interval: Duration) -> bool {
    let window_ms = window.as_millis();
    let interval_ms = interval.as_millis();
    window_ms >= interval_ms && window_ms % interval_ms == 0
}

/// Per-instance configuration sent by the service alongside Setup.
///
/// The wire message is parsed by the transport; this is its decoded form.
/// Millisecond fields keep the units the service uses.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DataSourceConfig {
    /// Name of the data-source kind to instantiate.
    #[serde(default)]
    pub name: String,

    /// Shared-memory buffer the instance writes into.
    #[serde(default)]
    pub target_buffer: u32,

    /// Expected duration of the trace, 0 if open-ended.
    #[serde(default)]
    pub trace_duration_ms: u32,

    /// Session this instance belongs to. Always positive for valid setups.
    #[serde(default)]
    pub tracing_session_id: u64,

    /// Ftrace-specific configuration.
    #[serde(default)]
    pub ftrace: FtraceSourceConfig,

    /// Process-stats-specific configuration.
    #[serde(default)]
    pub process_stats: ProcessStatsSourceConfig,

    /// Inode-map-specific configuration.
    #[serde(default)]
    pub inode_file: InodeFileSourceConfig,
}

/// Ftrace data-source configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FtraceSourceConfig {
    /// Kernel events to enable (e.g. "sched/sched_switch").
    #[serde(default)]
    pub events: Vec<String>,

    /// Kernel per-cpu buffer size in KiB (0 keeps the kernel default).
    #[serde(default)]
    pub buffer_size_kb: u32,
}

/// Process-stats data-source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessStatsSourceConfig {
    /// Dump processes on demand as peer sources discover them.
    #[serde(default = "default_true")]
    pub on_demand_dumps: bool,

    /// Dump every process visible in /proc when the source starts.
    #[serde(default)]
    pub scan_all_on_start: bool,
}

impl Default for ProcessStatsSourceConfig {
    fn default() -> Self {
        Self {
            on_demand_dumps: true,
            scan_all_on_start: false,
        }
    }
}

/// Inode-map data-source configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InodeFileSourceConfig {
    /// Additional mount points to resolve inodes against.
    #[serde(default)]
    pub scan_mount_points: Vec<String>,
}

fn default_true() -> bool {
    true
}
