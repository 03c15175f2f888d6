//! Round controller.
//!
//! Each round:
//!
//! 1. takes a timestamp `ts`, which becomes the round's safe-lock boundary
//! 2. locks every partition with fresh oracle timestamps (all above `ts`)
//! 3. waits for the locks to settle on every replica
//! 4. opens the race window: a background generation writing locks with
//!    mock timestamps counting down from `ts`, at handles past the main ones
//! 5. takes the safe point, which postdates every main lock
//! 6. runs GC at the safe point
//! 7. closes the race window (cancel, then join)
//! 8. scans for locks GC left behind and fails on any unsafe one
//! 9. resets the round state

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use gcprobe_kv::{GcTrigger, KvClient, TimestampOracle};
use gcprobe_types::Timestamp;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checker::ConsistencyChecker;
use crate::gc::GcDriver;
use crate::generator::{Generated, LockGenerator};
use crate::keyspace::KeySpace;
use crate::options::ProbeOptions;
use crate::report::{RoundReport, RunReport, StopReason};
use crate::tso::TimestampSource;
use crate::writer::{LockTsPolicy, LockWriter};
use crate::{Error, Result};

/// State owned by the controller for the span of one round.
#[derive(Debug, Default)]
pub struct RoundState {
    /// First row handle locked by the current generation pass.
    pub handle_id: i64,
    pub safe_point: Timestamp,
    pub safe_lock_ts: Timestamp,
    /// Countdown shared with the race window's writers.
    pub mock_lock_ts: Arc<AtomicU64>,
}

impl RoundState {
    fn reset(&mut self) {
        self.handle_id = 0;
        self.safe_point = Timestamp::ZERO;
        self.safe_lock_ts = Timestamp::ZERO;
        self.mock_lock_ts.store(0, Ordering::SeqCst);
    }
}

/// Lock generation running alongside GC.
struct RaceWindow {
    cancel: CancellationToken,
    handle: JoinHandle<Generated>,
}

impl RaceWindow {
    /// Starts generating in the background. Dispatch stops when `timeout`
    /// elapses or the window is closed, whichever comes first.
    fn open<O: TimestampOracle, K: KvClient>(
        generator: LockGenerator<O, K>,
        handle_id: i64,
        pacing: Duration,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let deadline = async {
                tokio::select! {
                    () = time::sleep(timeout) => token.cancel(),
                    () = token.cancelled() => {}
                }
            };
            let generation = generator.generate(handle_id, pacing, &token);
            let (generated, ()) = tokio::join!(generation, deadline);
            generated
        });
        Self { cancel, handle }
    }

    /// Cancels dispatch and waits for every queued task to finish.
    async fn close(self) -> Generated {
        self.cancel.cancel();
        match self.handle.await {
            Ok(generated) => generated,
            Err(err) => Generated {
                locked: 0,
                error: Some(Error::Internal(format!("race window task failed: {err}"))),
            },
        }
    }
}

pub struct RoundController<O, K, G> {
    ts: TimestampSource<O>,
    generator: LockGenerator<O, K>,
    gc: GcDriver<G>,
    checker: ConsistencyChecker<K>,
    options: ProbeOptions,
}

impl<O, K, G> RoundController<O, K, G>
where
    O: TimestampOracle,
    K: KvClient,
    G: GcTrigger,
{
    pub fn new(
        oracle: Arc<O>,
        kv: Arc<K>,
        trigger: Arc<G>,
        keyspace: &KeySpace,
        options: ProbeOptions,
    ) -> Self {
        let budget = options.backoff_budget_ms;
        let ts = TimestampSource::new(oracle, budget);
        let writer = LockWriter::new(Arc::clone(&kv), ts.clone(), budget)
            .with_overflow(options.overflow);
        Self {
            generator: LockGenerator::new(writer, keyspace.tables(), options.generator),
            gc: GcDriver::new(trigger, options.use_green_gc, options.max_gc_attempts),
            checker: ConsistencyChecker::new(kv, budget),
            ts,
            options,
        }
    }

    /// Runs rounds until cancelled, the round limit is hit, the oracle goes
    /// away, or a round fails. Completed rounds are recorded in `report`.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<StopReason> {
        info!("start to test");
        let mut state = RoundState::default();
        let mut last_green: i64 = -1;

        let stop = loop {
            let round = report.rounds_completed;
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.options.max_rounds.is_some_and(|max| round >= max) {
                break StopReason::RoundLimit;
            }

            match self.round(round, &mut state, &mut last_green, cancel).await? {
                Some(summary) => report.record(summary),
                None => break StopReason::OracleDown,
            }
            state.reset();
        };
        info!(rounds = report.rounds_completed, ?stop, "test end");
        Ok(stop)
    }

    /// Runs one round. `None` means the oracle went away.
    async fn round(
        &self,
        round: u64,
        state: &mut RoundState,
        last_green: &mut i64,
        cancel: &CancellationToken,
    ) -> Result<Option<RoundReport>> {
        let ts = self.ts.now(cancel).await?;
        if ts.is_zero() {
            warn!("[round-{round}] timestamp oracle is unreachable, stopping");
            return Ok(None);
        }

        info!("[round-{round}] start to generate locks at ts({ts})");
        let main_locked = self
            .generator
            .generate(state.handle_id, self.options.main_pacing, cancel)
            .await
            .into_result()?;
        info!("[round-{round}] generated {main_locked} locks at ts({ts})");

        time::sleep(self.options.settle).await;

        info!("[round-{round}] start to async generate locks during GC");
        state.handle_id = self.options.generator.lock_per_region as i64;
        state.safe_lock_ts = ts;
        state.mock_lock_ts.store(ts.as_u64(), Ordering::SeqCst);
        let race = RaceWindow::open(
            self.generator
                .with_lock_ts(LockTsPolicy::Mock(Arc::clone(&state.mock_lock_ts))),
            state.handle_id,
            self.options.race_pacing,
            self.options.race_timeout,
            cancel,
        );

        let gc = self.gc_phase(round, state, last_green, cancel).await;

        let raced = race.close().await;
        if let Some(err) = &raced.error {
            warn!("[round-{round}] lock generation during GC failed: {err}");
        }
        info!("[round-{round}] async generated {} locks during GC", raced.locked);

        let physical_used = match gc? {
            Some(physical_used) => physical_used,
            None => return Ok(None),
        };

        info!("[round-{round}] start to check data at safePoint({})", state.safe_point);
        let check = self
            .checker
            .check_data(state.safe_point, state.safe_lock_ts)
            .await?;
        if !check.unsafe_locks.is_empty() {
            error!(
                "[round-{round}] found {} unsafe locks after GC at safePoint({})",
                check.unsafe_locks.len(),
                state.safe_point
            );
            return Err(Error::UnsafeLocks {
                safe_point: state.safe_point,
                locks: check.unsafe_locks,
            });
        }
        info!("[round-{round}] check data done at safePoint({})", state.safe_point);

        Ok(Some(RoundReport {
            round,
            start_ts: ts,
            safe_point: state.safe_point,
            main_locked,
            race_locked: raced.locked,
            physical_used,
            safe_locks_resolved: check.resolved,
        }))
    }

    /// Takes the safe point and runs GC at it, tracking how long the physical
    /// path has gone unused. `None` means the oracle went away.
    async fn gc_phase(
        &self,
        round: u64,
        state: &mut RoundState,
        last_green: &mut i64,
        cancel: &CancellationToken,
    ) -> Result<Option<bool>> {
        state.safe_point = self.ts.now(cancel).await?;
        if state.safe_point.is_zero() {
            warn!("[round-{round}] timestamp oracle is unreachable, stopping");
            return Ok(None);
        }

        info!("[round-{round}] start to GC at safePoint({})", state.safe_point);
        let physical_used = match self.gc.run_gc(state.safe_point).await {
            Ok(physical_used) => physical_used,
            Err(err) => {
                error!(
                    "[round-{round}] failed to run GC at safePoint({}): {err}",
                    state.safe_point
                );
                return Err(err);
            }
        };
        info!("[round-{round}] GC done at safePoint({})", state.safe_point);

        if physical_used {
            *last_green = round as i64;
        } else if self.options.use_green_gc {
            warn!(
                "[round-{round}] failed to resolve locks physically at safePoint({})",
                state.safe_point
            );
        }
        let misses = self.options.max_green_gc_misses;
        if self.options.use_green_gc && round as i64 - *last_green > misses as i64 {
            return Err(Error::GreenGcNotUsed { rounds: misses });
        }
        Ok(Some(physical_used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcprobe_kv::{SimCluster, SimFaults};

    #[test]
    fn test_reset_clears_every_field() {
        let mut state = RoundState {
            handle_id: 10,
            safe_point: Timestamp::new(5),
            safe_lock_ts: Timestamp::new(3),
            mock_lock_ts: Arc::new(AtomicU64::new(2)),
        };
        let shared = Arc::clone(&state.mock_lock_ts);
        state.reset();

        assert_eq!(state.handle_id, 0);
        assert!(state.safe_point.is_zero());
        assert!(state.safe_lock_ts.is_zero());
        assert_eq!(shared.load(Ordering::SeqCst), 0);
    }

    fn generator(sim: &Arc<SimCluster>, tables: usize) -> LockGenerator<SimCluster, SimCluster> {
        let ids: Vec<_> = (0..tables)
            .map(|i| sim.create_table(&format!("t{i}")))
            .collect();
        let ts = TimestampSource::new(Arc::clone(sim), 60_000);
        let writer = LockWriter::new(Arc::clone(sim), ts, 60_000);
        LockGenerator::new(
            writer,
            ids.into(),
            crate::GeneratorOptions {
                lock_per_region: 2,
                keys_per_txn: 5,
                workers: 2,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_window_stops_at_timeout() {
        let sim = Arc::new(SimCluster::new());
        let generator = generator(&sim, 10);
        let seed = Timestamp::new(1_000);

        let window = RaceWindow::open(
            generator.with_lock_ts(LockTsPolicy::mock_below(seed)),
            2,
            Duration::from_millis(200),
            Duration::from_millis(500),
            &CancellationToken::new(),
        );
        time::sleep(Duration::from_secs(5)).await;
        let generated = window.close().await;

        // Ticks at 0, 200 and 400ms dispatch before the 500ms deadline.
        assert!(generated.error.is_none());
        assert_eq!(generated.locked, 6);
        assert!(sim.locks().iter().all(|l| l.ts < seed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_window_close_joins_background_work() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults::default()));
        let generator = generator(&sim, 10);

        let window = RaceWindow::open(
            generator.with_lock_ts(LockTsPolicy::mock_below(Timestamp::new(1_000))),
            2,
            Duration::from_millis(200),
            Duration::from_secs(60),
            &CancellationToken::new(),
        );
        time::sleep(Duration::from_millis(300)).await;
        let generated = window.close().await;

        let locked_after_close = sim.lock_count();
        assert_eq!(generated.locked, locked_after_close);
        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sim.lock_count(), locked_after_close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_window_close_interrupts_region_retries() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults {
            prewrite_region_errors: u32::MAX,
            ..Default::default()
        }));
        let generator = generator(&sim, 10);

        let window = RaceWindow::open(
            generator.with_lock_ts(LockTsPolicy::mock_below(Timestamp::new(1_000))),
            2,
            Duration::from_millis(200),
            Duration::from_secs(2),
            &CancellationToken::new(),
        );
        let start = time::Instant::now();
        time::sleep(Duration::from_millis(50)).await;
        let generated = window.close().await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(generated.error.is_none());
        assert_eq!(generated.locked, 0);
        assert_eq!(sim.lock_count(), 0);
    }
}
