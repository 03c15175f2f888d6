//! # gcprobe: GC safety verification engine
//!
//! gcprobe checks, from outside the store, that lock resolution during GC
//! never drops a lock a transaction still depends on. Every round it writes
//! locks that are never committed, triggers GC at a safe point while more
//! locks keep arriving, then scans for locks GC should have handled.
//!
//! # Components
//!
//! - [`TimestampSource`]: oracle timestamps with bounded retry
//! - [`LockWriter`]: prewrite-only lock injection, routed per region
//! - [`LockGenerator`]: paced worker pool spreading lock tasks over partitions
//! - [`GcDriver`]: the GC trigger with transient-error retry
//! - [`ConsistencyChecker`]: paginated lock scan classifying leftovers
//! - [`RoundController`]: the round loop tying the above together
//!
//! Every collaborator is reached through a trait from [`gcprobe_kv`], so the
//! engine runs the same against a live cluster and against
//! [`gcprobe_kv::SimCluster`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gcprobe::{KeySpace, ProbeOptions, RoundController, RunReport};
//! use gcprobe_kv::SimCluster;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> gcprobe::Result<()> {
//! let sim = Arc::new(SimCluster::new());
//! let keyspace = KeySpace::resolve(sim.as_ref(), "resolve_lock", 5).await?;
//! let options = ProbeOptions::default().with_max_rounds(1);
//! let controller = RoundController::new(
//!     Arc::clone(&sim),
//!     Arc::clone(&sim),
//!     Arc::clone(&sim),
//!     &keyspace,
//!     options,
//! );
//!
//! let mut report = RunReport::new();
//! let result = controller.run(&CancellationToken::new(), &mut report).await;
//! report.finish(&result);
//! # Ok(())
//! # }
//! ```

pub mod checker;
pub mod error;
pub mod gc;
pub mod generator;
pub mod keyspace;
pub mod options;
pub mod report;
pub mod round;
pub mod tso;
pub mod writer;

pub use checker::{CheckReport, ConsistencyChecker, SCAN_LOCK_LIMIT};
pub use error::{Error, Result};
pub use gc::{DEFAULT_GC_ATTEMPTS, GcDriver};
pub use generator::{Generated, GeneratorOptions, LockGenerator, LockTask};
pub use keyspace::{KeySpace, table_name};
pub use options::ProbeOptions;
pub use report::{Outcome, RoundReport, RunReport, StopReason};
pub use round::{RoundController, RoundState};
pub use tso::TimestampSource;
pub use writer::{LOCK_TTL_MS, LockTsPolicy, LockWriter, MAX_BATCH_BYTES, RegionOverflow};
