//! Lock generator.
//!
//! One task per partition, each locking `lock_per_region` consecutive row
//! handles. A fixed pool of workers pulls tasks from a shared queue while a
//! ticker paces how fast tasks are queued, so writes trickle in over time
//! instead of landing in one burst.

use std::sync::Arc;
use std::time::Duration;

use gcprobe_kv::{KvClient, TimestampOracle};
use gcprobe_types::{Key, RowHandle, TableId};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::writer::{LockTsPolicy, LockWriter};
use crate::{Error, Result};

/// Work item: lock `count` handles of `table` starting at `first_handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTask {
    pub table: TableId,
    pub first_handle: i64,
    pub count: usize,
}

impl LockTask {
    fn keys(&self) -> Vec<Key> {
        let first = RowHandle::new(self.first_handle);
        (0..self.count)
            .map(|i| Key::row(self.table, first.offset(i as i64)))
            .collect()
    }
}

/// Outcome of one generation pass. `locked` counts every key locked before
/// and after the first error; later errors are dropped.
#[derive(Debug, Default)]
pub struct Generated {
    pub locked: usize,
    pub error: Option<Error>,
}

impl Generated {
    fn absorb(&mut self, other: Generated) {
        self.locked += other.locked;
        if self.error.is_none() {
            self.error = other.error;
        }
    }

    pub fn into_result(self) -> Result<usize> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.locked),
        }
    }
}

/// Sizing of a generation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratorOptions {
    pub lock_per_region: usize,
    pub keys_per_txn: usize,
    pub workers: usize,
}

pub struct LockGenerator<O, K> {
    writer: LockWriter<O, K>,
    tables: Arc<[TableId]>,
    options: GeneratorOptions,
}

impl<O, K> Clone for LockGenerator<O, K> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
            tables: Arc::clone(&self.tables),
            options: self.options,
        }
    }
}

impl<O: TimestampOracle, K: KvClient> LockGenerator<O, K> {
    pub fn new(
        writer: LockWriter<O, K>,
        tables: Arc<[TableId]>,
        options: GeneratorOptions,
    ) -> Self {
        Self {
            writer,
            tables,
            options,
        }
    }

    /// A copy of this generator whose writes take timestamps from `policy`.
    pub fn with_lock_ts(&self, policy: LockTsPolicy) -> Self {
        Self {
            writer: self.writer.clone().with_policy(policy),
            ..self.clone()
        }
    }

    /// Locks `lock_per_region` handles from `handle_id` in every partition.
    ///
    /// Cancelling `cancel` stops queueing new tasks; tasks already queued
    /// still run and every worker is joined before this returns.
    pub async fn generate(
        &self,
        handle_id: i64,
        pacing: Duration,
        cancel: &CancellationToken,
    ) -> Generated {
        let workers = self.options.workers.max(1);
        let (task_tx, task_rx) = mpsc::channel::<LockTask>(self.tables.len().max(1));
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<Generated>(workers);

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let this = self.clone();
            let tasks = Arc::clone(&task_rx);
            let results = result_tx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let generated = this.work(worker, tasks, &cancel).await;
                // The receiver outlives every worker.
                let _ = results.send(generated).await;
            }));
        }
        drop(result_tx);

        // The first tick completes at once, so the first task goes out
        // without waiting a full pacing interval.
        let mut ticker = time::interval(pacing.max(Duration::from_micros(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut queued = 0usize;
        for table in self.tables.iter().copied() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let task = LockTask {
                table,
                first_handle: handle_id,
                count: self.options.lock_per_region,
            };
            if task_tx.send(task).await.is_err() {
                break;
            }
            queued += 1;
        }
        drop(task_tx);
        debug!(queued, total = self.tables.len(), "lock tasks queued");

        let mut total = Generated::default();
        while let Some(generated) = result_rx.recv().await {
            total.absorb(generated);
        }
        for handle in handles {
            if let Err(err) = handle.await {
                total.absorb(Generated {
                    locked: 0,
                    error: Some(Error::Internal(format!("lock worker failed: {err}"))),
                });
            }
        }
        total
    }

    async fn work(
        &self,
        worker: usize,
        tasks: Arc<Mutex<mpsc::Receiver<LockTask>>>,
        cancel: &CancellationToken,
    ) -> Generated {
        let mut generated = Generated::default();
        loop {
            let next = tasks.lock().await.recv().await;
            let Some(task) = next else {
                return generated;
            };
            match self.run_task(&task, cancel).await {
                Ok(locked) => generated.locked += locked,
                Err(err) => {
                    warn!(worker, table = %task.table, error = %err, "lock task failed");
                    generated.error = Some(err);
                    return generated;
                }
            }
        }
    }

    async fn run_task(&self, task: &LockTask, cancel: &CancellationToken) -> Result<usize> {
        let keys = task.keys();
        let mut locked = 0;
        for batch in keys.chunks(self.options.keys_per_txn.max(1)) {
            locked += self.writer.write_locks(batch, cancel).await?;
        }
        Ok(locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tso::TimestampSource;
    use gcprobe_kv::{KvError, SimCluster, SimFaults};

    fn generator(
        sim: &Arc<SimCluster>,
        tables: usize,
        options: GeneratorOptions,
        backoff_budget_ms: u64,
    ) -> LockGenerator<SimCluster, SimCluster> {
        let ids: Vec<TableId> = (0..tables)
            .map(|i| sim.create_table(&format!("t{i}")))
            .collect();
        let ts = TimestampSource::new(Arc::clone(sim), backoff_budget_ms);
        let writer = LockWriter::new(Arc::clone(sim), ts, backoff_budget_ms);
        LockGenerator::new(writer, ids.into(), options)
    }

    fn options(lock_per_region: usize, keys_per_txn: usize, workers: usize) -> GeneratorOptions {
        GeneratorOptions {
            lock_per_region,
            keys_per_txn,
            workers,
        }
    }

    #[tokio::test]
    async fn test_locks_every_handle() {
        // (tables, locks per table, workers, keys per txn)
        let cases = [(5, 3, 2, 5), (4, 12, 3, 5), (3, 7, 8, 2), (1, 1, 1, 1)];
        for (tables, locks, workers, per_txn) in cases {
            let sim = Arc::new(SimCluster::new());
            let generator = generator(&sim, tables, options(locks, per_txn, workers), 60_000);

            let generated = generator
                .generate(0, Duration::from_micros(1), &CancellationToken::new())
                .await;
            assert!(generated.error.is_none());
            assert_eq!(generated.locked, tables * locks);
            assert_eq!(sim.lock_count(), tables * locks);
        }
    }

    #[tokio::test]
    async fn test_handles_start_at_offset() {
        let sim = Arc::new(SimCluster::new());
        let generator = generator(&sim, 1, options(3, 5, 1), 60_000);
        generator
            .generate(10, Duration::from_micros(1), &CancellationToken::new())
            .await
            .into_result()
            .unwrap();

        let handles: Vec<i64> = sim
            .locks()
            .iter()
            .filter_map(|l| l.key.decode_row())
            .map(|(_, h)| h.into())
            .collect();
        assert_eq!(handles, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch_locks_nothing() {
        let sim = Arc::new(SimCluster::new());
        let generator = generator(&sim, 5, options(3, 5, 2), 60_000);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let generated = generator.generate(0, Duration::from_millis(1), &cancel).await;
        assert!(generated.error.is_none());
        assert_eq!(generated.locked, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_mid_dispatch_stops_queueing() {
        let sim = Arc::new(SimCluster::new());
        let generator = generator(&sim, 10, options(1, 5, 2), 60_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        // Ticks at 0, 100 and 200ms queue three tasks before the cancel.
        let generated = generator
            .generate(0, Duration::from_millis(100), &cancel)
            .await;
        assert!(generated.error.is_none());
        assert_eq!(generated.locked, 3);
        assert_eq!(sim.lock_count(), 3);
    }

    #[tokio::test]
    async fn test_worker_error_is_reported() {
        let sim = Arc::new(SimCluster::with_faults(SimFaults {
            prewrite_region_errors: u32::MAX,
            ..Default::default()
        }));
        let generator = generator(&sim, 2, options(2, 5, 2), 10);

        let err = generator
            .generate(0, Duration::from_micros(1), &CancellationToken::new())
            .await
            .into_result()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Kv(KvError::BackoffExhausted { .. })
        ));
        assert_eq!(sim.lock_count(), 0);
    }

    #[test]
    fn test_first_error_wins() {
        let mut total = Generated::default();
        total.absorb(Generated {
            locked: 4,
            error: None,
        });
        total.absorb(Generated {
            locked: 1,
            error: Some(Error::Internal("first".into())),
        });
        total.absorb(Generated {
            locked: 2,
            error: Some(Error::Internal("second".into())),
        });

        assert_eq!(total.locked, 7);
        match total.into_result() {
            Err(Error::Internal(msg)) => assert_eq!(msg, "first"),
            other => panic!("expected first error, got {other:?}"),
        }
    }
}
