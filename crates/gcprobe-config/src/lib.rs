//! gcprobe settings.
//!
//! [`GcProbeConfig`] holds the workload shape, GC policy, timing and cluster
//! endpoints. [`ConfigLoader`] merges it from defaults, the user file,
//! `gcprobe.toml`, `gcprobe.local.toml` and `GCPROBE_*` environment variables;
//! the binary applies its flags last.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::{ConfigLoader, Layer};
pub use paths::{LOCAL_FILE, PROJECT_FILE, local_file, project_file, user_file};

/// Main gcprobe configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcProbeConfig {
    pub workload: WorkloadConfig,
    pub gc: GcConfig,
    pub timing: TimingConfig,
    pub cluster: ClusterConfig,
}

/// Shape of the lock workload injected each round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Number of key-space partitions (tables), one lock task each.
    pub region_count: usize,
    /// Locks written per partition per generation pass.
    pub lock_per_region: usize,
    /// Size of the lock-writing worker pool.
    pub workers: usize,
    /// Keys grouped into one prewrite by a lock task.
    pub keys_per_txn: usize,
    /// Keep writing the keys that spill past a region boundary instead of
    /// dropping them.
    pub carry_region_overflow: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            region_count: 200,
            lock_per_region: 10,
            workers: 10,
            keys_per_txn: 5,
            carry_region_overflow: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Ask the store for the physical ("green") lock resolution path.
    pub enable_green_gc: bool,
    /// GC trigger attempts on transient errors.
    pub max_attempts: u32,
    /// Consecutive rounds tolerated without the physical path being used.
    pub max_green_gc_misses: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enable_green_gc: false,
            max_attempts: 5,
            max_green_gc_misses: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause after main lock generation so locks reach every replica.
    pub settle_ms: u64,
    /// Dispatch interval of the main generation pass, in microseconds.
    pub main_pacing_us: u64,
    /// Dispatch interval of the generation racing GC.
    pub race_pacing_ms: u64,
    /// Lifetime of the race window.
    pub race_timeout_ms: u64,
    /// Sleep budget of one backoffer.
    pub backoff_budget_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: 5_000,
            main_pacing_us: 1,
            race_pacing_ms: 200,
            race_timeout_ms: 2_000,
            backoff_budget_ms: 60_000,
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn main_pacing(&self) -> Duration {
        Duration::from_micros(self.main_pacing_us)
    }

    pub fn race_pacing(&self) -> Duration {
        Duration::from_millis(self.race_pacing_ms)
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }
}

/// Where the cluster under test lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Talk to fixed localhost addresses instead of in-cluster service names.
    pub local_mode: bool,
    pub cluster_name: String,
    pub namespace: String,
    /// Database holding the partition tables.
    pub db_name: String,
    pub pd_port: u16,
    pub status_port: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            local_mode: false,
            cluster_name: "gcprobe".to_string(),
            namespace: "default".to_string(),
            db_name: "resolve_lock".to_string(),
            pd_port: 2379,
            status_port: 10080,
        }
    }
}

impl ClusterConfig {
    /// Address of the timestamp oracle.
    pub fn pd_addr(&self) -> String {
        if self.local_mode {
            format!("127.0.0.1:{}", self.pd_port)
        } else {
            format!(
                "{}-pd.{}.svc:{}",
                self.cluster_name, self.namespace, self.pd_port
            )
        }
    }

    /// Base URL of the SQL layer's status port (GC trigger, schema lookups).
    pub fn status_addr(&self) -> String {
        if self.local_mode {
            format!("http://127.0.0.1:{}", self.status_port)
        } else {
            format!(
                "http://{}-tidb.{}.svc:{}",
                self.cluster_name, self.namespace, self.status_port
            )
        }
    }
}

impl GcProbeConfig {
    /// Loads every layer, with `project_dir` holding the project files.
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Load a single TOML file on top of the built-in defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GcProbeConfig =
            toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(config.normalize())
    }

    /// Replaces zero-valued counts and intervals with their defaults.
    pub fn normalize(mut self) -> Self {
        let workload = WorkloadConfig::default();
        if self.workload.region_count == 0 {
            self.workload.region_count = workload.region_count;
        }
        if self.workload.lock_per_region == 0 {
            self.workload.lock_per_region = workload.lock_per_region;
        }
        if self.workload.workers == 0 {
            self.workload.workers = workload.workers;
        }
        if self.workload.keys_per_txn == 0 {
            self.workload.keys_per_txn = workload.keys_per_txn;
        }

        let gc = GcConfig::default();
        if self.gc.max_attempts == 0 {
            self.gc.max_attempts = gc.max_attempts;
        }
        if self.gc.max_green_gc_misses == 0 {
            self.gc.max_green_gc_misses = gc.max_green_gc_misses;
        }

        let timing = TimingConfig::default();
        if self.timing.main_pacing_us == 0 {
            self.timing.main_pacing_us = timing.main_pacing_us;
        }
        if self.timing.race_pacing_ms == 0 {
            self.timing.race_pacing_ms = timing.race_pacing_ms;
        }
        if self.timing.race_timeout_ms == 0 {
            self.timing.race_timeout_ms = timing.race_timeout_ms;
        }
        if self.timing.backoff_budget_ms == 0 {
            self.timing.backoff_budget_ms = timing.backoff_budget_ms;
        }
        self
    }

    /// Checks cross-field constraints that normalization cannot repair.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workload.lock_per_region > i64::MAX as usize / 2 {
            return Err(ConfigError::Invalid {
                field: "workload.lock_per_region",
                reason: format!("{} overflows the row handle space", self.workload.lock_per_region),
            });
        }
        if !self.cluster.local_mode
            && (self.cluster.cluster_name.is_empty() || self.cluster.namespace.is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "cluster",
                reason: "cluster_name and namespace are required outside local mode".to_string(),
            });
        }
        if self.cluster.db_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "cluster.db_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
