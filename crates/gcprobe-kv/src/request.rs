//! Request and response shapes for the transactional KV seam.

use gcprobe_types::{Key, Lock, Timestamp};
use serde::{Deserialize, Serialize};

/// One key of a prewrite: a put of `value` at `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: Key,
    pub value: Vec<u8>,
}

impl Mutation {
    pub fn put(key: Key, value: Vec<u8>) -> Self {
        Self { key, value }
    }

    /// Bytes this mutation contributes to a request.
    pub fn size(&self) -> usize {
        self.key.len() + self.value.len()
    }
}

/// First phase of a two-phase commit. Never followed by a commit here, so
/// every accepted mutation leaves a lock behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrewriteRequest {
    pub mutations: Vec<Mutation>,
    pub primary: Key,
    pub start_ts: Timestamp,
    pub lock_ttl_ms: u64,
}

/// Per-key failure reported by a prewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyError {
    /// The key is already locked by another transaction.
    Locked(Lock),
    /// A newer write exists on the key.
    WriteConflict {
        key: Key,
        start_ts: Timestamp,
        conflict_ts: Timestamp,
    },
}

/// Response to a prewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrewriteOutcome {
    /// The region accepted the request; `key_errors` lists keys it refused.
    Written { key_errors: Vec<KeyError> },
    /// The request reached the wrong region or a stale epoch.
    RegionError(String),
}

/// Scan for locks in one region starting at `start_key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLockRequest {
    pub start_key: Key,
    /// Only locks with `ts <= max_version` are returned.
    pub max_version: Timestamp,
    pub limit: usize,
}

/// Response to a scan-lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanLockOutcome {
    /// Locks in ascending key order, at most `limit` of them.
    Locks(Vec<Lock>),
    RegionError(String),
}
