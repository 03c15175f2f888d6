//! Engine options derived from [`GcProbeConfig`].

use std::time::Duration;

use gcprobe_config::GcProbeConfig;

use crate::generator::GeneratorOptions;
use crate::writer::RegionOverflow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    pub generator: GeneratorOptions,
    pub overflow: RegionOverflow,
    pub use_green_gc: bool,
    pub max_gc_attempts: u32,
    /// Rounds in a row the physical path may be skipped before the run fails.
    pub max_green_gc_misses: u64,
    pub settle: Duration,
    pub main_pacing: Duration,
    pub race_pacing: Duration,
    pub race_timeout: Duration,
    pub backoff_budget_ms: u64,
    /// Stop cleanly after this many rounds. `None` runs until cancelled.
    pub max_rounds: Option<u64>,
}

impl ProbeOptions {
    pub fn from_config(config: &GcProbeConfig) -> Self {
        Self {
            generator: GeneratorOptions {
                lock_per_region: config.workload.lock_per_region,
                keys_per_txn: config.workload.keys_per_txn,
                workers: config.workload.workers,
            },
            overflow: if config.workload.carry_region_overflow {
                RegionOverflow::Carry
            } else {
                RegionOverflow::Truncate
            },
            use_green_gc: config.gc.enable_green_gc,
            max_gc_attempts: config.gc.max_attempts,
            max_green_gc_misses: config.gc.max_green_gc_misses,
            settle: config.timing.settle(),
            main_pacing: config.timing.main_pacing(),
            race_pacing: config.timing.race_pacing(),
            race_timeout: config.timing.race_timeout(),
            backoff_budget_ms: config.timing.backoff_budget_ms,
            max_rounds: None,
        }
    }

    pub fn with_max_rounds(mut self, rounds: u64) -> Self {
        self.max_rounds = Some(rounds);
        self
    }
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self::from_config(&GcProbeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_config() {
        let options = ProbeOptions::default();
        assert_eq!(options.generator.lock_per_region, 10);
        assert_eq!(options.generator.keys_per_txn, 5);
        assert_eq!(options.generator.workers, 10);
        assert_eq!(options.overflow, RegionOverflow::Truncate);
        assert!(!options.use_green_gc);
        assert_eq!(options.max_gc_attempts, 5);
        assert_eq!(options.max_green_gc_misses, 50);
        assert_eq!(options.settle, Duration::from_secs(5));
        assert_eq!(options.main_pacing, Duration::from_micros(1));
        assert_eq!(options.race_pacing, Duration::from_millis(200));
        assert_eq!(options.race_timeout, Duration::from_secs(2));
        assert_eq!(options.max_rounds, None);
    }

    #[test]
    fn test_overflow_policy_from_config() {
        let mut config = GcProbeConfig::default();
        config.workload.carry_region_overflow = true;
        config.gc.enable_green_gc = true;
        let options = ProbeOptions::from_config(&config).with_max_rounds(3);
        assert_eq!(options.overflow, RegionOverflow::Carry);
        assert!(options.use_green_gc);
        assert_eq!(options.max_rounds, Some(3));
    }
}
