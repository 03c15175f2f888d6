//! Timestamp source.
//!
//! Wraps the oracle with a bounded backoff. An oracle that stays unreachable
//! past the budget is treated as an unhealthy environment, not a bug in the
//! store: [`TimestampSource::now`] then returns [`Timestamp::ZERO`] and the
//! round controller ends the run cleanly.

use std::sync::Arc;

use gcprobe_kv::{BackoffKind, Backoffer, KvError, TimestampOracle};
use gcprobe_types::Timestamp;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Result;

pub struct TimestampSource<O> {
    oracle: Arc<O>,
    backoff_budget_ms: u64,
}

impl<O> Clone for TimestampSource<O> {
    fn clone(&self) -> Self {
        Self {
            oracle: Arc::clone(&self.oracle),
            backoff_budget_ms: self.backoff_budget_ms,
        }
    }
}

impl<O: TimestampOracle> TimestampSource<O> {
    pub fn new(oracle: Arc<O>, backoff_budget_ms: u64) -> Self {
        Self {
            oracle,
            backoff_budget_ms,
        }
    }

    /// Fetches a fresh timestamp, or [`Timestamp::ZERO`] if the oracle is
    /// gone or `cancel` fired while waiting on it.
    pub async fn now(&self, cancel: &CancellationToken) -> Result<Timestamp> {
        let mut bo = Backoffer::new(self.backoff_budget_ms);
        loop {
            match self.oracle.get_ts().await {
                Ok((physical, logical)) => return Ok(Timestamp::compose(physical, logical)),
                Err(err) if err.is_oracle_transient() => {
                    match bo.backoff_or_cancel(BackoffKind::PdRpc, &err, cancel).await {
                        Ok(()) => {}
                        Err(KvError::Cancelled) => return Ok(Timestamp::ZERO),
                        Err(exhausted) => {
                            warn!(error = %exhausted, "timestamp oracle did not recover in time");
                            return Ok(Timestamp::ZERO);
                        }
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
