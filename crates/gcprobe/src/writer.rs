//! Lock writer.
//!
//! Writes locks by sending the first phase of a two-phase commit and never
//! the second, so every accepted key keeps a lock GC has to deal with. The
//! client library has no public prewrite, so the writer routes each request
//! itself: it locates the primary key's region and sends only the prefix of
//! the batch that region owns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gcprobe_kv::{
    BackoffKind, Backoffer, KvClient, KvError, Mutation, PrewriteOutcome, PrewriteRequest,
    TimestampOracle,
};
use gcprobe_types::{Key, RegionLocation, Timestamp};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Result;
use crate::tso::TimestampSource;

/// Upper bound on the key and value bytes of one prewrite.
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;

/// TTL carried by written locks.
pub const LOCK_TTL_MS: u64 = 30_000;

const LOCK_VALUE: &[u8] = b"v";

/// Where a lock's start timestamp comes from.
#[derive(Debug, Clone, Default)]
pub enum LockTsPolicy {
    /// A fresh timestamp from the oracle per prewrite.
    #[default]
    Oracle,
    /// A shared counter decremented once per prewrite. Every timestamp it
    /// yields is strictly below the value it was seeded with.
    Mock(Arc<AtomicU64>),
}

impl LockTsPolicy {
    pub fn mock_below(seed: Timestamp) -> Self {
        LockTsPolicy::Mock(Arc::new(AtomicU64::new(seed.as_u64())))
    }
}

/// What to do with keys of a batch that fall past the primary's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegionOverflow {
    /// Drop them; the call reports only the keys it wrote.
    #[default]
    Truncate,
    /// Route and write them in follow-up prewrites within the same call.
    Carry,
}

pub struct LockWriter<O, K> {
    kv: Arc<K>,
    ts: TimestampSource<O>,
    policy: LockTsPolicy,
    overflow: RegionOverflow,
    backoff_budget_ms: u64,
}

impl<O, K> Clone for LockWriter<O, K> {
    fn clone(&self) -> Self {
        Self {
            kv: Arc::clone(&self.kv),
            ts: self.ts.clone(),
            policy: self.policy.clone(),
            overflow: self.overflow,
            backoff_budget_ms: self.backoff_budget_ms,
        }
    }
}

impl<O: TimestampOracle, K: KvClient> LockWriter<O, K> {
    pub fn new(kv: Arc<K>, ts: TimestampSource<O>, backoff_budget_ms: u64) -> Self {
        Self {
            kv,
            ts,
            policy: LockTsPolicy::Oracle,
            overflow: RegionOverflow::Truncate,
            backoff_budget_ms,
        }
    }

    pub fn with_policy(mut self, policy: LockTsPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_overflow(mut self, overflow: RegionOverflow) -> Self {
        self.overflow = overflow;
        self
    }

    /// Writes locks on `keys` (ordered, first key is the primary) and returns
    /// how many were locked.
    ///
    /// A batch that reports any per-key error counts as zero locked. Region
    /// errors back off and retry the whole batch.
    pub async fn write_locks(&self, keys: &[Key], cancel: &CancellationToken) -> Result<usize> {
        let mut remaining = keys;
        let mut locked = 0;
        let mut bo = Backoffer::new(self.backoff_budget_ms);

        while let Some(primary) = remaining.first() {
            let region = self.kv.locate_key(primary).await?;

            let start_ts = self.lock_ts(cancel).await?;
            if start_ts.is_zero() {
                return Ok(locked);
            }

            let mutations = in_region_prefix(&region, remaining, MAX_BATCH_BYTES);
            let batch = mutations.len();
            if batch == 0 {
                return Ok(locked);
            }

            let request = PrewriteRequest {
                mutations,
                primary: primary.clone(),
                start_ts,
                lock_ttl_ms: LOCK_TTL_MS,
            };
            match self.kv.prewrite(&region, request).await? {
                PrewriteOutcome::RegionError(msg) => {
                    match bo.backoff_or_cancel(BackoffKind::RegionMiss, &msg, cancel).await {
                        Ok(()) => continue,
                        Err(KvError::Cancelled) => return Ok(locked),
                        Err(err) => return Err(err.into()),
                    }
                }
                PrewriteOutcome::Written { key_errors } if !key_errors.is_empty() => {
                    warn!(
                        %region,
                        %start_ts,
                        errors = ?key_errors,
                        "failed to write locks"
                    );
                }
                PrewriteOutcome::Written { .. } => locked += batch,
            }

            remaining = match self.overflow {
                RegionOverflow::Truncate => &[],
                RegionOverflow::Carry => &remaining[batch..],
            };
        }
        Ok(locked)
    }

    async fn lock_ts(&self, cancel: &CancellationToken) -> Result<Timestamp> {
        match &self.policy {
            LockTsPolicy::Oracle => self.ts.now(cancel).await,
            LockTsPolicy::Mock(counter) => Ok(counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .map_or(Timestamp::ZERO, |prev| Timestamp::new(prev - 1))),
        }
    }
}

/// Mutations for the longest prefix of `keys` inside `region` whose size
/// stays within `max_bytes`. The first key is always taken.
fn in_region_prefix(region: &RegionLocation, keys: &[Key], max_bytes: usize) -> Vec<Mutation> {
    let mut size = 0;
    let mut mutations = Vec::new();
    for key in keys {
        if !region.contains(key) {
            break;
        }
        let mutation = Mutation::put(key.clone(), LOCK_VALUE.to_vec());
        if !mutations.is_empty() && size + mutation.size() > max_bytes {
            break;
        }
        size += mutation.size();
        mutations.push(mutation);
    }
    mutations
}
