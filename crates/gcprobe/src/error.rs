//! Engine error types.
//!
//! Environment-transient failures never reach this type: they are retried
//! where they happen. Everything here ends the run.

use gcprobe_kv::KvError;
use gcprobe_types::{Lock, Timestamp};
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Collaborator failure that was not (or no longer) retriable.
    #[error("kv error: {0}")]
    Kv(#[from] KvError),

    /// GC kept failing with transient errors.
    #[error("failed to run GC {attempts} times at safe point {safe_point}: {source}")]
    GcFailed {
        attempts: u32,
        safe_point: Timestamp,
        #[source]
        source: KvError,
    },

    /// Green GC was requested but the physical path did not run for too long.
    #[error("green gc failed to run for over {rounds} rounds")]
    GreenGcNotUsed { rounds: u64 },

    /// Locks GC should have handled survived it.
    #[error("found {} unsafe locks after GC at safe point {safe_point}", .locks.len())]
    UnsafeLocks {
        safe_point: Timestamp,
        locks: Vec<Lock>,
    },

    /// Invariant broken inside the harness itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures of the store under test, as opposed to harness or
    /// environment failures.
    pub fn is_correctness_violation(&self) -> bool {
        matches!(
            self,
            Error::UnsafeLocks { .. } | Error::GreenGcNotUsed { .. }
        )
    }
}
