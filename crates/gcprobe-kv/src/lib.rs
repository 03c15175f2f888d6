//! Collaborator seams for gcprobe.
//!
//! The harness drives a live cluster through four capabilities, each a trait:
//! - [`TimestampOracle`]: hands out hybrid logical timestamps
//! - [`KvClient`]: region routing, prewrite, scan-lock and batch lock resolution
//! - [`GcTrigger`]: runs the store's lock resolution up to a safe point
//! - [`SchemaResolver`]: maps partition names to their numeric ids
//!
//! [`http`] implements the two status-port endpoints over HTTP. [`sim`]
//! implements every seam in memory, with fault knobs, so the engine can run
//! end to end without a cluster.

use std::future::Future;

use gcprobe_types::{Key, Lock, RegionLocation, TableId, Timestamp};

pub mod backoff;
pub mod error;
pub mod http;
pub mod request;
pub mod sim;

pub use backoff::{BackoffKind, Backoffer, DEFAULT_BUDGET_MS};
pub use error::{KvError, Result};
pub use http::{HttpGcTrigger, HttpSchemaResolver};
pub use request::{
    KeyError, Mutation, PrewriteOutcome, PrewriteRequest, ScanLockOutcome, ScanLockRequest,
};
pub use sim::{SimCluster, SimFaults, SimStats};

/// Source of transaction timestamps.
pub trait TimestampOracle: Send + Sync + 'static {
    /// Returns `(physical_ms, logical)`.
    fn get_ts(&self) -> impl Future<Output = Result<(u64, u64)>> + Send;
}

/// Low-level transactional KV access.
pub trait KvClient: Send + Sync + 'static {
    /// Finds the region currently owning `key`.
    fn locate_key(&self, key: &Key) -> impl Future<Output = Result<RegionLocation>> + Send;

    /// Sends a prewrite to `region`.
    fn prewrite(
        &self,
        region: &RegionLocation,
        request: PrewriteRequest,
    ) -> impl Future<Output = Result<PrewriteOutcome>> + Send;

    /// Scans `region` for locks.
    fn scan_lock(
        &self,
        region: &RegionLocation,
        request: ScanLockRequest,
    ) -> impl Future<Output = Result<ScanLockOutcome>> + Send;

    /// Resolves `locks`, all of which live in `region`. Returns false if some
    /// of them are still present afterwards.
    fn batch_resolve_locks(
        &self,
        region: &RegionLocation,
        locks: &[Lock],
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// The store's GC entry point.
pub trait GcTrigger: Send + Sync + 'static {
    /// Resolves locks up to `safe_point`. `physical` requests the physical
    /// ("green") strategy; the return value says whether it was used.
    fn resolve_locks(
        &self,
        safe_point: Timestamp,
        physical: bool,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// Partition name to id lookup.
pub trait SchemaResolver: Send + Sync + 'static {
    fn table_id(&self, db: &str, table: &str) -> impl Future<Output = Result<TableId>> + Send;
}
