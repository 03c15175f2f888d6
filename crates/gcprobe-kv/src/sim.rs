//! In-memory cluster implementing every collaborator seam.
//!
//! [`SimCluster`] keeps a lock table ordered by key, splits the key space into
//! regions at table boundaries (plus any explicit split points), issues
//! strictly increasing timestamps and runs GC by resolving every lock at or
//! below the safe point. [`SimFaults`] injects the failures the harness has to
//! tolerate (or must report).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use gcprobe_types::{Key, LOGICAL_BITS, Lock, RegionId, RegionLocation, TableId, Timestamp};
use tracing::debug;

use crate::{
    GcTrigger, KeyError, KvClient, KvError, PrewriteOutcome, PrewriteRequest, Result,
    ScanLockOutcome, ScanLockRequest, SchemaResolver, TimestampOracle,
};

/// First id handed to a created table.
const FIRST_TABLE_ID: i64 = 100;

/// Failure injection knobs. Counters are consumed one per matching call.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// The next N timestamp requests fail transiently.
    pub oracle_failures: u32,
    /// Every timestamp request fails.
    pub oracle_down: bool,
    /// The next N prewrites answer with a region error.
    pub prewrite_region_errors: u32,
    /// The next N scan-locks answer with a region error.
    pub scan_region_errors: u32,
    /// The next N scan-locks fail outright with a key error.
    pub scan_lock_errors: u32,
    /// The next N prewrites report a write conflict on their primary key.
    pub conflict_prewrites: u32,
    /// The next N batch resolutions leave every lock in place.
    pub resolve_failures: u32,
    /// GC never reports the physical path.
    pub physical_fallback: bool,
    /// The next N GC triggers fail with region unavailability.
    pub gc_transient_errors: u32,
    /// Every GC trigger fails with a non-retriable error.
    pub gc_fatal_error: bool,
    /// GC reports success without resolving anything.
    pub leak_locks: bool,
}

/// Call counters for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub timestamps_issued: u64,
    pub prewrites: u64,
    pub locks_written: u64,
    pub scans: u64,
    /// Start key of every scan-lock, in call order.
    pub scan_start_keys: Vec<Key>,
    pub locks_resolved: u64,
    pub gc_runs: u64,
    pub physical_gc_runs: u64,
}

#[derive(Debug, Default)]
struct SimState {
    last_physical: u64,
    last_logical: u64,
    tables: HashMap<String, TableId>,
    next_table_id: i64,
    /// Region start keys other than the empty key.
    splits: BTreeSet<Key>,
    locks: BTreeMap<Key, Lock>,
    faults: SimFaults,
    stats: SimStats,
}

impl SimState {
    fn region_for(&self, key: &Key) -> RegionLocation {
        let start_key = self
            .splits
            .range::<Key, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .cloned()
            .unwrap_or_default();
        let end_key = self
            .splits
            .range::<Key, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .cloned()
            .unwrap_or_default();
        let index = self
            .splits
            .range::<Key, _>((Bound::Unbounded, Bound::Included(key)))
            .count();
        RegionLocation {
            id: RegionId::new(index as u64 + 1),
            start_key,
            end_key,
        }
    }

    /// Returns an error message if `region` no longer matches the routing table.
    fn stale_region(&self, region: &RegionLocation) -> Option<String> {
        let current = self.region_for(&region.start_key);
        if current == *region {
            None
        } else {
            Some(format!(
                "epoch not match: requested {region}, current {current}"
            ))
        }
    }

    fn next_ts(&mut self) -> (u64, u64) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if now > self.last_physical {
            self.last_physical = now;
            self.last_logical = 0;
        } else {
            self.last_logical += 1;
            if self.last_logical >= 1 << LOGICAL_BITS {
                self.last_physical += 1;
                self.last_logical = 0;
            }
        }
        self.stats.timestamps_issued += 1;
        (self.last_physical, self.last_logical)
    }
}

/// An in-memory multi-region transactional store.
#[derive(Debug)]
pub struct SimCluster {
    state: Mutex<SimState>,
}

impl SimCluster {
    pub fn new() -> Self {
        Self::with_faults(SimFaults::default())
    }

    pub fn with_faults(faults: SimFaults) -> Self {
        Self {
            state: Mutex::new(SimState {
                next_table_id: FIRST_TABLE_ID,
                faults,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adjusts fault injection while the cluster is in use.
    pub fn update_faults(&self, f: impl FnOnce(&mut SimFaults)) {
        f(&mut self.state().faults);
    }

    /// Creates `name` if it does not exist and splits off a region for it.
    pub fn create_table(&self, name: &str) -> TableId {
        let mut state = self.state();
        if let Some(id) = state.tables.get(name) {
            return *id;
        }
        let id = TableId::new(state.next_table_id);
        state.next_table_id += 1;
        state.tables.insert(name.to_string(), id);
        state.splits.insert(Key::table_prefix(id));
        debug!(table = name, %id, "created table");
        id
    }

    /// Adds a region boundary at `key`.
    pub fn split_at(&self, key: Key) {
        if !key.is_empty() {
            self.state().splits.insert(key);
        }
    }

    /// Writes a lock directly, bypassing prewrite checks.
    pub fn put_lock(&self, lock: Lock) {
        self.state().locks.insert(lock.key.clone(), lock);
    }

    /// Snapshot of every outstanding lock in key order.
    pub fn locks(&self) -> Vec<Lock> {
        self.state().locks.values().cloned().collect()
    }

    pub fn lock_count(&self) -> usize {
        self.state().locks.len()
    }

    pub fn stats(&self) -> SimStats {
        self.state().stats.clone()
    }

    /// Number of regions currently in the routing table.
    pub fn region_count(&self) -> usize {
        self.state().splits.len() + 1
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampOracle for SimCluster {
    async fn get_ts(&self) -> Result<(u64, u64)> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.faults.oracle_down {
            return Err(KvError::OracleUnavailable("connection refused".to_string()));
        }
        if state.faults.oracle_failures > 0 {
            state.faults.oracle_failures -= 1;
            return Err(KvError::OracleUnavailable("EOF".to_string()));
        }
        Ok(state.next_ts())
    }
}

impl KvClient for SimCluster {
    async fn locate_key(&self, key: &Key) -> Result<RegionLocation> {
        tokio::task::yield_now().await;
        Ok(self.state().region_for(key))
    }

    async fn prewrite(
        &self,
        region: &RegionLocation,
        request: PrewriteRequest,
    ) -> Result<PrewriteOutcome> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.faults.prewrite_region_errors > 0 {
            state.faults.prewrite_region_errors -= 1;
            return Ok(PrewriteOutcome::RegionError(format!(
                "not leader for {region}"
            )));
        }
        if let Some(msg) = state.stale_region(region) {
            return Ok(PrewriteOutcome::RegionError(msg));
        }
        if let Some(m) = request.mutations.iter().find(|m| !region.contains(&m.key)) {
            return Ok(PrewriteOutcome::RegionError(format!(
                "key {} is not in {region}",
                m.key
            )));
        }

        state.stats.prewrites += 1;
        if state.faults.conflict_prewrites > 0 {
            state.faults.conflict_prewrites -= 1;
            return Ok(PrewriteOutcome::Written {
                key_errors: vec![KeyError::WriteConflict {
                    key: request.primary.clone(),
                    start_ts: request.start_ts,
                    conflict_ts: Timestamp::new(request.start_ts.as_u64() + 1),
                }],
            });
        }

        let key_errors: Vec<KeyError> = request
            .mutations
            .iter()
            .filter_map(|m| state.locks.get(&m.key))
            .filter(|lock| lock.ts != request.start_ts)
            .map(|lock| KeyError::Locked(lock.clone()))
            .collect();
        if !key_errors.is_empty() {
            return Ok(PrewriteOutcome::Written { key_errors });
        }

        for mutation in &request.mutations {
            let lock = Lock {
                key: mutation.key.clone(),
                primary: request.primary.clone(),
                ts: request.start_ts,
                ttl_ms: request.lock_ttl_ms,
            };
            state.locks.insert(mutation.key.clone(), lock);
        }
        state.stats.locks_written += request.mutations.len() as u64;
        Ok(PrewriteOutcome::Written {
            key_errors: Vec::new(),
        })
    }

    async fn scan_lock(
        &self,
        region: &RegionLocation,
        request: ScanLockRequest,
    ) -> Result<ScanLockOutcome> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.faults.scan_region_errors > 0 {
            state.faults.scan_region_errors -= 1;
            return Ok(ScanLockOutcome::RegionError(format!(
                "not leader for {region}"
            )));
        }
        if let Some(msg) = state.stale_region(region) {
            return Ok(ScanLockOutcome::RegionError(msg));
        }
        if !region.contains(&request.start_key) {
            return Ok(ScanLockOutcome::RegionError(format!(
                "key {} is not in {region}",
                request.start_key
            )));
        }

        if state.faults.scan_lock_errors > 0 {
            state.faults.scan_lock_errors -= 1;
            return Err(KvError::ScanLock(format!(
                "key error at {} in {region}",
                request.start_key
            )));
        }

        state.stats.scans += 1;
        state.stats.scan_start_keys.push(request.start_key.clone());
        let locks = state
            .locks
            .range(request.start_key.clone()..)
            .map(|(_, lock)| lock)
            .take_while(|lock| region.contains(&lock.key))
            .filter(|lock| lock.ts <= request.max_version)
            .take(request.limit)
            .cloned()
            .collect();
        Ok(ScanLockOutcome::Locks(locks))
    }

    async fn batch_resolve_locks(&self, region: &RegionLocation, locks: &[Lock]) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if let Some(lock) = locks.iter().find(|l| !region.contains(&l.key)) {
            return Err(KvError::Region(format!(
                "lock on {} is not in {region}",
                lock.key
            )));
        }
        if state.faults.resolve_failures > 0 {
            state.faults.resolve_failures -= 1;
            return Ok(locks.is_empty());
        }
        for lock in locks {
            let matches = state
                .locks
                .get(&lock.key)
                .is_some_and(|current| current.ts == lock.ts);
            if matches {
                state.locks.remove(&lock.key);
                state.stats.locks_resolved += 1;
            }
        }
        Ok(true)
    }
}

impl GcTrigger for SimCluster {
    async fn resolve_locks(&self, safe_point: Timestamp, physical: bool) -> Result<bool> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.faults.gc_transient_errors > 0 {
            state.faults.gc_transient_errors -= 1;
            return Err(KvError::RegionUnavailable("region 1".to_string()));
        }
        if state.faults.gc_fatal_error {
            return Err(KvError::Rpc("gc worker is stopped".to_string()));
        }

        state.stats.gc_runs += 1;
        if !state.faults.leak_locks {
            let before = state.locks.len();
            state.locks.retain(|_, lock| lock.ts > safe_point);
            let resolved = (before - state.locks.len()) as u64;
            state.stats.locks_resolved += resolved;
            debug!(%safe_point, resolved, "sim gc resolved locks");
        }

        let physical_used = physical && !state.faults.physical_fallback;
        if physical_used {
            state.stats.physical_gc_runs += 1;
        }
        Ok(physical_used)
    }
}

impl SchemaResolver for SimCluster {
    async fn table_id(&self, _db: &str, table: &str) -> Result<TableId> {
        tokio::task::yield_now().await;
        Ok(self.create_table(table))
    }
}
