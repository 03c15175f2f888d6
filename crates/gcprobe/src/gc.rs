//! GC driver.

use std::sync::Arc;

use gcprobe_kv::GcTrigger;
use gcprobe_types::Timestamp;
use tracing::{info, warn};

use crate::{Error, Result};

/// Attempts per GC trigger before giving up on transient failures.
pub const DEFAULT_GC_ATTEMPTS: u32 = 5;

pub struct GcDriver<G> {
    trigger: Arc<G>,
    use_green_gc: bool,
    max_attempts: u32,
}

impl<G: GcTrigger> GcDriver<G> {
    pub fn new(trigger: Arc<G>, use_green_gc: bool, max_attempts: u32) -> Self {
        Self {
            trigger,
            use_green_gc,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs lock resolution at `safe_point` and returns whether the physical
    /// path was used.
    ///
    /// Region unavailability and locks met during the scan are retried;
    /// anything else fails immediately.
    pub async fn run_gc(&self, safe_point: Timestamp) -> Result<bool> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .trigger
                .resolve_locks(safe_point, self.use_green_gc)
                .await
            {
                Ok(physical_used) => {
                    info!(%safe_point, physical_used, attempt, "gc finished");
                    return Ok(physical_used);
                }
                Err(err) if err.is_transient_gc() => {
                    warn!(%safe_point, attempt, error = %err, "gc failed, retrying");
                    if attempt >= self.max_attempts {
                        return Err(Error::GcFailed {
                            attempts: attempt,
                            safe_point,
                            source: err,
                        });
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcprobe_kv::{KvError, SimCluster, SimFaults};

    fn faulty(faults: SimFaults) -> Arc<SimCluster> {
        Arc::new(SimCluster::with_faults(faults))
    }

    #[tokio::test]
    async fn test_reports_physical_path() {
        let sim = faulty(SimFaults::default());
        let green = GcDriver::new(Arc::clone(&sim), true, 5);
        assert!(green.run_gc(Timestamp::new(1)).await.unwrap());

        let logical = GcDriver::new(Arc::clone(&sim), false, 5);
        assert!(!logical.run_gc(Timestamp::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_fallback_is_not_an_error() {
        let sim = faulty(SimFaults {
            physical_fallback: true,
            ..Default::default()
        });
        let used = GcDriver::new(sim, true, 5).run_gc(Timestamp::new(1)).await.unwrap();
        assert!(!used);
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let sim = faulty(SimFaults {
            gc_transient_errors: 4,
            ..Default::default()
        });
        let driver = GcDriver::new(Arc::clone(&sim), true, DEFAULT_GC_ATTEMPTS);
        assert!(driver.run_gc(Timestamp::new(1)).await.unwrap());
        assert_eq!(sim.stats().gc_runs, 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let sim = faulty(SimFaults {
            gc_transient_errors: 5,
            ..Default::default()
        });
        let driver = GcDriver::new(Arc::clone(&sim), true, DEFAULT_GC_ATTEMPTS);
        let err = driver.run_gc(Timestamp::new(7)).await.unwrap_err();
        match err {
            Error::GcFailed {
                attempts,
                safe_point,
                source,
            } => {
                assert_eq!(attempts, 5);
                assert_eq!(safe_point, Timestamp::new(7));
                assert!(matches!(source, KvError::RegionUnavailable(_)));
            }
            other => panic!("expected GcFailed, got {other:?}"),
        }
        assert_eq!(sim.stats().gc_runs, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let sim = faulty(SimFaults {
            gc_transient_errors: 0,
            gc_fatal_error: true,
            ..Default::default()
        });
        let err = GcDriver::new(sim, false, 5)
            .run_gc(Timestamp::new(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kv(KvError::Rpc(_))));
    }
}
