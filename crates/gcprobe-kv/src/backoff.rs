//! Budgeted exponential backoff.
//!
//! A [`Backoffer`] is created per logical operation with a total sleep budget.
//! Each retriable failure calls [`Backoffer::backoff`] with the failure kind;
//! the sleep for a kind doubles on every attempt up to the kind's cap, with
//! "equal jitter" (half fixed, half random). Once the accumulated sleep would
//! exceed the budget the backoffer gives up and the caller propagates
//! [`KvError::BackoffExhausted`].

use std::collections::HashMap;
use std::fmt::Display;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{KvError, Result};

/// Default sleep budget for one operation.
pub const DEFAULT_BUDGET_MS: u64 = 60_000;

/// Failure classes with their own backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackoffKind {
    /// Timestamp oracle RPC failure.
    PdRpc,
    /// Stale region routing.
    RegionMiss,
    /// Locks that could not be resolved yet.
    TxnLock,
}

impl BackoffKind {
    fn base_ms(self) -> u64 {
        match self {
            BackoffKind::PdRpc => 500,
            BackoffKind::RegionMiss => 2,
            BackoffKind::TxnLock => 200,
        }
    }

    fn cap_ms(self) -> u64 {
        match self {
            BackoffKind::PdRpc => 3_000,
            BackoffKind::RegionMiss => 500,
            BackoffKind::TxnLock => 3_000,
        }
    }
}

impl Display for BackoffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackoffKind::PdRpc => "pdRPC",
            BackoffKind::RegionMiss => "regionMiss",
            BackoffKind::TxnLock => "txnLock",
        };
        f.write_str(name)
    }
}

/// Tracks sleep spent retrying one operation.
#[derive(Debug)]
pub struct Backoffer {
    budget_ms: u64,
    slept_ms: u64,
    attempts: HashMap<BackoffKind, u32>,
}

impl Backoffer {
    pub fn new(budget_ms: u64) -> Self {
        Self {
            budget_ms,
            slept_ms: 0,
            attempts: HashMap::new(),
        }
    }

    /// Total time slept so far.
    pub fn slept(&self) -> Duration {
        Duration::from_millis(self.slept_ms)
    }

    /// Sleeps before the next retry of a `kind` failure, or returns
    /// [`KvError::BackoffExhausted`] when the budget cannot cover it.
    pub async fn backoff(&mut self, kind: BackoffKind, cause: impl Display) -> Result<()> {
        let sleep_ms = self.reserve(kind, &cause)?;
        tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        self.slept_ms += sleep_ms;
        Ok(())
    }

    /// Like [`backoff`](Self::backoff), but gives up with
    /// [`KvError::Cancelled`] as soon as `cancel` fires.
    pub async fn backoff_or_cancel(
        &mut self,
        kind: BackoffKind,
        cause: impl Display,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(KvError::Cancelled);
        }
        let sleep_ms = self.reserve(kind, &cause)?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(KvError::Cancelled),
            () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                self.slept_ms += sleep_ms;
                Ok(())
            }
        }
    }

    fn reserve(&mut self, kind: BackoffKind, cause: &impl Display) -> Result<u64> {
        let sleep_ms = self.next_sleep_ms(kind);
        if self.slept_ms + sleep_ms > self.budget_ms {
            return Err(KvError::BackoffExhausted {
                kind,
                budget_ms: self.budget_ms,
                last: cause.to_string(),
            });
        }
        debug!(%kind, sleep_ms, slept_ms = self.slept_ms, %cause, "backing off");
        Ok(sleep_ms)
    }

    fn next_sleep_ms(&mut self, kind: BackoffKind) -> u64 {
        let attempt = self.attempts.entry(kind).or_insert(0);
        let exp = kind
            .base_ms()
            .saturating_mul(1u64 << (*attempt).min(20))
            .min(kind.cap_ms());
        *attempt += 1;
        let half = exp / 2;
        half + rand::thread_rng().gen_range(0..=half)
    }
}

impl Default for Backoffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_grows_and_caps() {
        let mut bo = Backoffer::new(DEFAULT_BUDGET_MS);
        let first = bo.next_sleep_ms(BackoffKind::RegionMiss);
        assert!((1..=2).contains(&first));

        let mut last = 0;
        for _ in 0..30 {
            last = bo.next_sleep_ms(BackoffKind::RegionMiss);
        }
        assert!((250..=500).contains(&last));
    }

    #[test]
    fn test_kinds_have_independent_curves() {
        let mut bo = Backoffer::new(DEFAULT_BUDGET_MS);
        for _ in 0..10 {
            bo.next_sleep_ms(BackoffKind::RegionMiss);
        }
        let pd = bo.next_sleep_ms(BackoffKind::PdRpc);
        assert!((250..=500).contains(&pd));
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let mut bo = Backoffer::new(100);
        let err = bo.backoff(BackoffKind::PdRpc, "eof").await.unwrap_err();
        match err {
            KvError::BackoffExhausted {
                kind,
                budget_ms,
                last,
            } => {
                assert_eq!(kind, BackoffKind::PdRpc);
                assert_eq!(budget_ms, 100);
                assert_eq!(last, "eof");
            }
            other => panic!("expected BackoffExhausted, got {other:?}"),
        }
        assert_eq!(bo.slept(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_backoff_sleeps_within_budget() {
        let mut bo = Backoffer::new(1_000);
        bo.backoff(BackoffKind::RegionMiss, "epoch not match")
            .await
            .unwrap();
        assert!(bo.slept() <= Duration::from_millis(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let mut bo = Backoffer::new(DEFAULT_BUDGET_MS);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        let err = bo
            .backoff_or_cancel(BackoffKind::TxnLock, "locked", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(bo.slept(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_sleep() {
        let mut bo = Backoffer::new(DEFAULT_BUDGET_MS);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = bo
            .backoff_or_cancel(BackoffKind::PdRpc, "eof", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KvError::Cancelled));
    }
}
