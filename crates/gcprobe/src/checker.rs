//! Consistency checker.
//!
//! After GC at `safe_point` every lock with `ts <= safe_point` should be gone,
//! except locks the harness wrote with timestamps below `safe_lock_ts`: those
//! are leftovers GC may legitimately skip, and the checker resolves them
//! itself. Any other surviving lock is unsafe.
//!
//! The scan walks the whole key space one region at a time. A full page
//! continues right after its last lock; a short page means the region is
//! exhausted and the cursor jumps to the region's end key. An empty end key
//! ends the scan.

use std::collections::BTreeMap;
use std::sync::Arc;

use gcprobe_kv::{BackoffKind, Backoffer, KvClient, ScanLockOutcome, ScanLockRequest};
use gcprobe_types::{Key, Lock, RegionLocation, Timestamp};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Locks requested per scan page.
pub const SCAN_LOCK_LIMIT: usize = 100;

/// What one full scan found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Locks at or below the safe point that GC should have handled, in key order.
    pub unsafe_locks: Vec<Lock>,
    /// Safe leftovers resolved by the checker.
    pub resolved: usize,
    pub pages: usize,
    pub regions: usize,
}

struct Page {
    region: RegionLocation,
    len: usize,
    last_key: Option<Key>,
}

pub struct ConsistencyChecker<K> {
    kv: Arc<K>,
    backoff_budget_ms: u64,
}

impl<K: KvClient> ConsistencyChecker<K> {
    pub fn new(kv: Arc<K>, backoff_budget_ms: u64) -> Self {
        Self {
            kv,
            backoff_budget_ms,
        }
    }

    /// Scans every lock with `ts <= safe_point`, resolves the ones below
    /// `safe_lock_ts` and collects the rest.
    ///
    /// If the scan fails after unsafe locks were already seen, the unsafe
    /// locks win and the error is logged.
    pub async fn check_data(
        &self,
        safe_point: Timestamp,
        safe_lock_ts: Timestamp,
    ) -> Result<CheckReport> {
        let mut unsafe_locks = BTreeMap::new();
        let mut report = CheckReport::default();

        let scanned = self
            .scan(safe_point, safe_lock_ts, &mut unsafe_locks, &mut report)
            .await;
        let unsafe_locks: Vec<Lock> = unsafe_locks.into_values().collect();
        match scanned {
            Ok(()) => {
                info!(
                    %safe_point,
                    %safe_lock_ts,
                    regions = report.regions,
                    pages = report.pages,
                    resolved = report.resolved,
                    unsafe_locks = unsafe_locks.len(),
                    "lock scan finished"
                );
                report.unsafe_locks = unsafe_locks;
                Ok(report)
            }
            Err(err) if !unsafe_locks.is_empty() => {
                warn!(%safe_point, error = %err, "lock scan aborted after finding unsafe locks");
                Err(Error::UnsafeLocks {
                    safe_point,
                    locks: unsafe_locks,
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn scan(
        &self,
        safe_point: Timestamp,
        safe_lock_ts: Timestamp,
        unsafe_locks: &mut BTreeMap<(Key, Timestamp), Lock>,
        report: &mut CheckReport,
    ) -> Result<()> {
        let mut key = Key::empty();
        loop {
            let page = self
                .scan_page(&key, safe_point, safe_lock_ts, unsafe_locks, report)
                .await?;
            report.pages += 1;

            key = match page.last_key {
                Some(last) if page.len >= SCAN_LOCK_LIMIT => last.next_key(),
                _ => {
                    report.regions += 1;
                    page.region.end_key
                }
            };
            if key.is_empty() {
                return Ok(());
            }
        }
    }

    /// Scans one page from `key`, resolving its safe locks before returning.
    /// A page whose resolution is incomplete is scanned again.
    async fn scan_page(
        &self,
        key: &Key,
        safe_point: Timestamp,
        safe_lock_ts: Timestamp,
        unsafe_locks: &mut BTreeMap<(Key, Timestamp), Lock>,
        report: &mut CheckReport,
    ) -> Result<Page> {
        let mut bo = Backoffer::new(self.backoff_budget_ms);
        loop {
            let region = self.kv.locate_key(key).await?;
            let request = ScanLockRequest {
                start_key: key.clone(),
                max_version: safe_point,
                limit: SCAN_LOCK_LIMIT,
            };
            let locks = match self.kv.scan_lock(&region, request).await? {
                ScanLockOutcome::Locks(locks) => locks,
                ScanLockOutcome::RegionError(msg) => {
                    bo.backoff(BackoffKind::RegionMiss, &msg).await?;
                    continue;
                }
            };

            let (safe, found_unsafe): (Vec<Lock>, Vec<Lock>) =
                locks.iter().cloned().partition(|l| l.ts < safe_lock_ts);
            for lock in found_unsafe {
                warn!(%lock, %safe_point, %safe_lock_ts, "unsafe lock");
                unsafe_locks.insert((lock.key.clone(), lock.ts), lock);
            }

            if !safe.is_empty() {
                if !self.kv.batch_resolve_locks(&region, &safe).await? {
                    debug!(%region, locks = safe.len(), "safe locks not resolved yet, rescanning");
                    bo.backoff(BackoffKind::TxnLock, "batch resolve incomplete")
                        .await?;
                    continue;
                }
                report.resolved += safe.len();
            }

            return Ok(Page {
                region,
                len: locks.len(),
                last_key: locks.last().map(|l| l.key.clone()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcprobe_kv::{KvError, SimCluster, SimFaults};
    use gcprobe_types::{RowHandle, TableId};

    fn lock(table: TableId, handle: i64, ts: u64) -> Lock {
        let key = Key::row(table, RowHandle::new(handle));
        Lock {
            key: key.clone(),
            primary: key,
            ts: Timestamp::new(ts),
            ttl_ms: 30_000,
        }
    }

    fn checker(sim: &Arc<SimCluster>) -> ConsistencyChecker<SimCluster> {
        ConsistencyChecker::new(Arc::clone(sim), 60_000)
    }

    #[tokio::test]
    async fn test_visits_every_region_once() {
        let sim = Arc::new(SimCluster::new());
        let tables: Vec<TableId> = (0..3)
            .map(|i| sim.create_table(&format!("t{i}")))
            .collect();

        let report = checker(&sim)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap();
        assert!(report.unsafe_locks.is_empty());
        assert_eq!(report.regions, sim.region_count());

        let mut expected = vec![Key::empty()];
        expected.extend(tables.iter().map(|t| Key::table_prefix(*t)));
        assert_eq!(sim.stats().scan_start_keys, expected);
    }

    #[tokio::test]
    async fn test_classifies_and_resolves() {
        let sim = Arc::new(SimCluster::new());
        let t0 = sim.create_table("t0");
        let t1 = sim.create_table("t1");
        sim.put_lock(lock(t0, 0, 10)); // safe
        sim.put_lock(lock(t0, 1, 60)); // unsafe
        sim.put_lock(lock(t1, 0, 49)); // safe
        sim.put_lock(lock(t1, 1, 50)); // unsafe: the boundary itself is unsafe
        sim.put_lock(lock(t1, 2, 101)); // above the safe point, ignored

        let report = checker(&sim)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap();

        assert_eq!(report.resolved, 2);
        let unsafe_ts: Vec<u64> = report.unsafe_locks.iter().map(|l| l.ts.as_u64()).collect();
        assert_eq!(unsafe_ts, vec![60, 50]);

        let left: Vec<u64> = sim.locks().iter().map(|l| l.ts.as_u64()).collect();
        assert_eq!(left, vec![60, 50, 101]);
    }

    #[tokio::test]
    async fn test_short_page_jumps_to_region_end() {
        let sim = Arc::new(SimCluster::new());
        let t0 = sim.create_table("t0");
        let t1 = sim.create_table("t1");
        for h in 0..3 {
            sim.put_lock(lock(t0, h, 1));
        }

        checker(&sim)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap();

        let starts = sim.stats().scan_start_keys;
        assert_eq!(
            starts,
            vec![Key::empty(), Key::table_prefix(t0), Key::table_prefix(t1)]
        );
    }

    #[tokio::test]
    async fn test_full_page_continues_after_last_lock() {
        let sim = Arc::new(SimCluster::new());
        let t0 = sim.create_table("t0");
        let t1 = sim.create_table("t1");
        for h in 0..150 {
            sim.put_lock(lock(t0, h, 1));
        }

        let report = checker(&sim)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap();
        assert_eq!(report.resolved, 150);
        assert_eq!(report.pages, 4);
        assert_eq!(report.regions, 3);

        let starts = sim.stats().scan_start_keys;
        let hundredth = Key::row(t0, RowHandle::new(99)).next_key();
        assert_eq!(
            starts,
            vec![
                Key::empty(),
                Key::table_prefix(t0),
                hundredth,
                Key::table_prefix(t1),
            ]
        );
        assert_eq!(sim.lock_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_after_failed_resolve_is_idempotent() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults {
            resolve_failures: 2,
            ..Default::default()
        }));
        let t0 = sim.create_table("t0");
        sim.put_lock(lock(t0, 0, 10));
        sim.put_lock(lock(t0, 1, 70));
        sim.put_lock(lock(t0, 2, 20));

        let report = checker(&sim)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap();

        assert_eq!(report.resolved, 2);
        assert_eq!(report.unsafe_locks.len(), 1);
        assert_eq!(report.unsafe_locks[0].ts, Timestamp::new(70));

        let prefix = Key::table_prefix(t0);
        let rescans = sim
            .stats()
            .scan_start_keys
            .iter()
            .filter(|k| **k == prefix)
            .count();
        assert_eq!(rescans, 3);
    }

    #[tokio::test]
    async fn test_retries_scan_region_errors() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults {
            scan_region_errors: 3,
            ..Default::default()
        }));
        let t0 = sim.create_table("t0");
        sim.put_lock(lock(t0, 0, 10));

        let report = checker(&sim)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.regions, 2);
    }

    #[tokio::test]
    async fn test_unsafe_locks_win_over_scan_failure() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults {
            resolve_failures: u32::MAX,
            ..Default::default()
        }));
        let t0 = sim.create_table("t0");
        sim.put_lock(lock(t0, 0, 10));
        sim.put_lock(lock(t0, 1, 70));

        // Budget below the first lock backoff step.
        let err = ConsistencyChecker::new(Arc::clone(&sim), 10)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap_err();
        match err {
            Error::UnsafeLocks { safe_point, locks } => {
                assert_eq!(safe_point, Timestamp::new(100));
                assert_eq!(locks.len(), 1);
            }
            other => panic!("expected UnsafeLocks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scan_failure_without_unsafe_locks_is_returned() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults {
            resolve_failures: u32::MAX,
            ..Default::default()
        }));
        let t0 = sim.create_table("t0");
        sim.put_lock(lock(t0, 0, 10));

        let err = ConsistencyChecker::new(Arc::clone(&sim), 10)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Kv(KvError::BackoffExhausted {
                kind: BackoffKind::TxnLock,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_scan_lock_key_error_is_fatal() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults {
            scan_lock_errors: 1,
            ..Default::default()
        }));
        let t0 = sim.create_table("t0");
        sim.put_lock(lock(t0, 0, 10));

        let err = checker(&sim)
            .check_data(Timestamp::new(100), Timestamp::new(50))
            .await
            .unwrap_err();
        match err {
            Error::Kv(KvError::ScanLock(msg)) => assert!(msg.contains("key error")),
            other => panic!("expected ScanLock, got {other:?}"),
        }
        assert_eq!(sim.stats().scans, 0);
        assert_eq!(sim.lock_count(), 1);
    }
}
