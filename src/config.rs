//! Configuration: lifecycle policy settings and config/data file locations.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::evictor::MemoryEvictor;
use crate::core::memory::MemoryBudget;
use crate::core::scheduler::{PreloadPolicy, PreloadScheduler};

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "feedreel.json";
/// Default log file name inside the data directory
pub const LOG_FILE: &str = "feedreel.log";

/// Lifecycle policy. Every budget and window is tunable; none is a fixed contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    /// Max resident (Ready) decode sessions
    pub max_resident: usize,
    /// Max records kept in the feed before the farthest are destroyed
    pub max_records: usize,
    /// Failures before an item is permanently failed
    pub failure_threshold: u32,
    /// Bound on a single decode-session initialization
    pub init_timeout_ms: u64,
    /// Periodic eviction interval (0 = only on-demand passes)
    pub evict_interval_ms: u64,
    /// Fraction of the budgets an eviction pass shrinks to
    pub hysteresis: f64,
    /// Keep the focus neighbor resident during memory pressure
    pub protect_focus_neighbor: bool,
    /// Allow user-triggered retry of permanently failed items
    pub allow_manual_retry: bool,
    /// Decode worker threads (0 = auto)
    pub workers: usize,
    /// Explicit decode memory ceiling in MB (None = derive from system memory)
    pub memory_limit_mb: Option<u64>,
    /// Fraction of available memory used when deriving the ceiling
    pub mem_fraction: f64,
    /// Memory reserved for the rest of the app when deriving the ceiling
    pub reserve_gb: f64,
    /// Prefetch window on unmetered networks
    pub unmetered: PreloadPolicy,
    /// Prefetch window on metered networks
    pub metered: PreloadPolicy,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            max_resident: 100,
            max_records: 1000,
            failure_threshold: 3,
            init_timeout_ms: 10_000,
            evict_interval_ms: 30_000,
            hysteresis: 0.7,
            protect_focus_neighbor: true,
            allow_manual_retry: true,
            workers: 0,
            memory_limit_mb: None,
            mem_fraction: 0.5,
            reserve_gb: 1.0,
            unmetered: PreloadPolicy::unmetered(),
            metered: PreloadPolicy::metered(),
        }
    }
}

impl FeedSettings {
    /// Load settings from JSON. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let mut settings: Self = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        settings.validate();
        Ok(settings)
    }

    /// Write settings as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write settings: {}", path.display()))?;
        Ok(())
    }

    /// Clamp values that would make the lifecycle manager misbehave
    pub fn validate(&mut self) {
        if self.max_resident == 0 {
            warn!("max_resident must be at least 1, using 1");
            self.max_resident = 1;
        }
        if self.failure_threshold == 0 {
            warn!("failure_threshold must be at least 1, using 1");
            self.failure_threshold = 1;
        }
        if !(0.0..=1.0).contains(&self.hysteresis) {
            let clamped = self.hysteresis.clamp(0.0, 1.0);
            warn!("hysteresis {} out of range, using {}", self.hysteresis, clamped);
            self.hysteresis = clamped;
        }
        if self.max_records < self.max_resident {
            warn!(
                "max_records {} below max_resident {}, raising",
                self.max_records, self.max_resident
            );
            self.max_records = self.max_resident;
        }
        for policy in [&self.unmetered, &self.metered] {
            if policy.eager_count() > self.max_resident {
                warn!(
                    "Prefetch window {:?} exceeds max_resident {}, preloads will be refused",
                    policy, self.max_resident
                );
            }
        }
    }

    pub fn worker_threads(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            // Leave room for the UI thread
            (num_cpus::get() * 3 / 4).max(1)
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn evict_interval(&self) -> Option<Duration> {
        (self.evict_interval_ms > 0).then(|| Duration::from_millis(self.evict_interval_ms))
    }

    pub fn scheduler(&self) -> PreloadScheduler {
        PreloadScheduler::new(self.unmetered, self.metered)
    }

    pub fn evictor(&self) -> MemoryEvictor {
        MemoryEvictor::new(self.max_resident, self.hysteresis)
    }

    pub fn memory_budget(&self) -> MemoryBudget {
        match self.memory_limit_mb {
            Some(mb) => MemoryBudget::with_limit((mb as usize).saturating_mul(1024 * 1024)),
            None => MemoryBudget::from_system(self.mem_fraction, self.reserve_gb),
        }
    }
}

/// Overrides for default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI arg -> FEEDREEL_CONFIG_DIR -> None (platform defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var("FEEDREEL_CONFIG_DIR").ok().map(PathBuf::from));
        Self { config_dir }
    }

    /// Path to a configuration file
    ///
    /// Linux: ~/.config/feedreel/{name}, macOS: ~/Library/Application Support/feedreel/{name},
    /// Windows: %APPDATA%\feedreel\{name}
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.config_dir().join(name)
    }

    /// Path to a data file (logs)
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir().join(name)
    }

    /// Create config and data directories if missing
    pub fn ensure_dirs(&self) -> Result<()> {
        let config_dir = self.config_dir();
        let data_dir = self.data_dir();

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
        if data_dir != config_dir {
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        }
        Ok(())
    }

    fn config_dir(&self) -> PathBuf {
        self.resolve(dirs_next::config_dir)
    }

    fn data_dir(&self) -> PathBuf {
        self.resolve(dirs_next::data_dir)
    }

    fn resolve(&self, platform_dir: fn() -> Option<PathBuf>) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return dir.clone();
        }
        // Local folder wins if it already holds our files
        if let Ok(current_dir) = std::env::current_dir() {
            if has_local_files(&current_dir) {
                return current_dir;
            }
        }
        platform_dir()
            .map(|dir| dir.join("feedreel"))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn has_local_files(dir: &Path) -> bool {
    [SETTINGS_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}
