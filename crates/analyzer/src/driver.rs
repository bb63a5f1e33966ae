//! Block-parallel task pool: a producer feeds block numbers into a
//! bounded work channel, workers replay every recorded transaction of
//! their block, and the main thread re-orders completed blocks through a
//! wait-map so the collector always observes ascending block numbers.
//!
//! Cancellation is cooperative: dropping the stop sender wakes every
//! `select!` and the scope join drains the threads.

use amdahl_core::{AmdahlError, AmdahlResult, Substate};
use amdahl_substate::SubstateStore;
use crossbeam_channel::{bounded, select};
use std::collections::HashMap;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use crate::replayer::trace_transaction;
use crate::report::{dependency_rows, redundancy_row, DependencyRow, RedundancyRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Dependency,
    Redundancy,
}

/// Which recorded transactions to leave out of the replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskFilter {
    pub skip_transfer_txs: bool,
    pub skip_call_txs: bool,
    pub skip_create_txs: bool,
}

impl TaskFilter {
    fn skips(&self, substate: &Substate) -> bool {
        match substate.message.to {
            Some(to) => {
                let has_code = substate
                    .input_alloc
                    .get(&to)
                    .is_some_and(|account| account.has_code());
                (self.skip_transfer_txs && !has_code) || (self.skip_call_txs && has_code)
            }
            None => self.skip_create_txs,
        }
    }
}

/// Per-transaction worker payload, tagged by trace kind.
#[derive(Debug)]
pub enum TxOutcome {
    Dependency(Vec<DependencyRow>),
    Redundancy(Option<RedundancyRow>),
    /// EVM-level failure: logged by the worker, nothing to report.
    Skipped,
}

pub struct BlockResult {
    pub block: u64,
    pub outcomes: Vec<TxOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub blocks: u64,
    pub txs: u64,
}

pub struct TaskPool<'a, S> {
    pub name: &'static str,
    pub kind: TraceKind,
    pub store: &'a S,
    pub first: u64,
    pub last: u64,
    pub workers: usize,
    pub filter: TaskFilter,
    pub output_dir: PathBuf,
}

impl<S: SubstateStore> TaskPool<'_, S> {
    /// Replay every non-filtered transaction of one block.
    fn execute_block(&self, block: u64) -> AmdahlResult<BlockResult> {
        let mut outcomes = Vec::new();
        for (tx, substate) in self.store.block_substates(block)? {
            if self.filter.skips(&substate) {
                continue;
            }
            let outcome = match trace_transaction(&substate) {
                Ok(output) => match self.kind {
                    TraceKind::Dependency => {
                        TxOutcome::Dependency(dependency_rows(block, tx, &output)?)
                    }
                    TraceKind::Redundancy => TxOutcome::Redundancy(redundancy_row(block, tx, &output)),
                },
                Err(err) if !err.is_fatal() => {
                    tracing::warn!(block, tx, error = %err, "transaction skipped");
                    TxOutcome::Skipped
                }
                Err(err) => return Err(err),
            };
            outcomes.push(outcome);
        }
        Ok(BlockResult { block, outcomes })
    }

    /// Write one block's rows to `<output-dir>/<block>`, truncating any
    /// previous run. The redundancy trace leaves blocks with no replayed
    /// transactions without a file.
    fn collect(&self, result: &BlockResult) -> AmdahlResult<()> {
        if self.kind == TraceKind::Redundancy && result.outcomes.is_empty() {
            return Ok(());
        }
        let path = self.output_dir.join(result.block.to_string());
        let mut file = BufWriter::new(std::fs::File::create(&path)?);
        for outcome in &result.outcomes {
            match outcome {
                TxOutcome::Dependency(rows) => {
                    for row in rows {
                        writeln!(file, "{row}")?;
                    }
                }
                TxOutcome::Redundancy(Some(row)) => writeln!(file, "{row}")?,
                TxOutcome::Redundancy(None) | TxOutcome::Skipped => {}
            }
        }
        file.flush()?;
        Ok(())
    }

    /// Run the whole block range and return the totals.
    pub fn execute(&self) -> AmdahlResult<PoolStats> {
        let start = Instant::now();
        let workers = self.workers.max(1);
        tracing::info!(
            name = self.name,
            first = self.first,
            last = self.last,
            workers,
            "starting task pool"
        );

        let (work_tx, work_rx) = bounded::<u64>(workers * 10);
        let (done_tx, done_rx) = bounded::<AmdahlResult<BlockResult>>(workers * 10);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let stats = std::thread::scope(|scope| -> AmdahlResult<PoolStats> {
            let pool = &*self;

            {
                let work_tx = work_tx.clone();
                let stop_rx = stop_rx.clone();
                let (first, last) = (pool.first, pool.last);
                scope.spawn(move || {
                    for block in first..=last {
                        select! {
                            send(work_tx, block) -> sent => {
                                if sent.is_err() {
                                    return;
                                }
                            }
                            recv(stop_rx) -> _ => return,
                        }
                    }
                });
            }

            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                let stop_rx = stop_rx.clone();
                scope.spawn(move || loop {
                    select! {
                        recv(work_rx) -> msg => {
                            let Ok(block) = msg else { return };
                            let result = pool.execute_block(block);
                            select! {
                                send(done_tx, result) -> sent => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                                recv(stop_rx) -> _ => return,
                            }
                        }
                        recv(stop_rx) -> _ => return,
                    }
                });
            }
            drop(work_tx);
            drop(done_tx);
            // Dropping this on any exit path (including errors) is the
            // stop signal the producer and workers select on.
            let _stop = stop_tx;

            let mut wait_map: HashMap<u64, BlockResult> = HashMap::new();
            let mut progress = Progress::new(start);
            let mut stats = PoolStats::default();
            let mut next = self.first;

            while next <= self.last {
                if let Some(result) = wait_map.remove(&next) {
                    stats.blocks += 1;
                    stats.txs += result.outcomes.len() as u64;
                    self.collect(&result)?;
                    progress.maybe_report(self.name, next, self.last, stats);
                    next += 1;
                    continue;
                }
                let result = done_rx.recv().map_err(|_| {
                    AmdahlError::Internal("workers exited before completing the range".into())
                })??;
                wait_map.insert(result.block, result);
            }
            Ok(stats)
        })?;

        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
        tracing::info!(
            name = self.name,
            blocks = stats.blocks,
            txs = stats.txs,
            blk_per_sec = format_args!("{:.2}", stats.blocks as f64 / elapsed),
            tx_per_sec = format_args!("{:.2}", stats.txs as f64 / elapsed),
            "task pool done"
        );
        Ok(stats)
    }
}

/// Throttled progress lines: denser block milestones require less
/// elapsed time between reports.
struct Progress {
    start: Instant,
    last_sec: f64,
    last_stats: PoolStats,
}

impl Progress {
    fn new(start: Instant) -> Self {
        Self {
            start,
            last_sec: 0.0,
            last_stats: PoolStats::default(),
        }
    }

    fn maybe_report(&mut self, name: &str, block: u64, last_block: u64, stats: PoolStats) {
        let sec = self.start.elapsed().as_secs_f64();
        let due = block == last_block
            || (block % 10_000 == 0 && sec > self.last_sec + 5.0)
            || (block % 1_000 == 0 && sec > self.last_sec + 10.0)
            || (block % 100 == 0 && sec > self.last_sec + 20.0)
            || (block % 10 == 0 && sec > self.last_sec + 40.0)
            || sec > self.last_sec + 60.0;
        if !due {
            return;
        }
        let window = (sec - self.last_sec).max(f64::EPSILON);
        tracing::info!(
            name,
            block,
            blk_per_sec =
                format_args!("{:.2}", (stats.blocks - self.last_stats.blocks) as f64 / window),
            tx_per_sec = format_args!("{:.2}", (stats.txs - self.last_stats.txs) as f64 / window),
            "progress"
        );
        self.last_sec = sec;
        self.last_stats = stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, U256};
    use amdahl_core::{SubstateAccount, SubstateEnv, SubstateMessage};
    use std::collections::BTreeMap;

    /// In-memory store with a fixed set of recorded blocks.
    struct MapStore {
        blocks: HashMap<u64, BTreeMap<usize, Substate>>,
        fail_on: Option<u64>,
    }

    impl SubstateStore for MapStore {
        fn block_substates(&self, block: u64) -> AmdahlResult<BTreeMap<usize, Substate>> {
            if self.fail_on == Some(block) {
                return Err(AmdahlError::SubstateAccess("exploded".into()));
            }
            Ok(self.blocks.get(&block).cloned().unwrap_or_default())
        }
    }

    fn transfer_substate() -> Substate {
        let from = Address::with_last_byte(1);
        let to = Address::with_last_byte(2);
        let mut input_alloc = BTreeMap::new();
        input_alloc.insert(
            from,
            SubstateAccount {
                balance: U256::from(10u64).pow(U256::from(18u64)),
                ..Default::default()
            },
        );
        input_alloc.insert(to, SubstateAccount::default());
        Substate {
            input_alloc,
            env: SubstateEnv {
                number: 1_000_000,
                gas_limit: 10_000_000,
                ..Default::default()
            },
            message: SubstateMessage {
                from,
                to: Some(to),
                gas: 21_000,
                value: U256::from(1u64),
                ..Default::default()
            },
        }
    }

    fn pool_over<'a>(store: &'a MapStore, dir: &std::path::Path, kind: TraceKind) -> TaskPool<'a, MapStore> {
        TaskPool {
            name: "test pool",
            kind,
            store,
            first: 10,
            last: 10,
            workers: 2,
            filter: TaskFilter::default(),
            output_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn single_block_range_writes_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MapStore {
            blocks: HashMap::from([(10, BTreeMap::from([(0, transfer_substate())]))]),
            fail_on: None,
        };
        let stats = pool_over(&store, dir.path(), TraceKind::Dependency)
            .execute()
            .unwrap();
        assert_eq!(stats, PoolStats { blocks: 1, txs: 1 });
        assert!(dir.path().join("10").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn redundancy_trace_skips_blocks_without_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let store = MapStore {
            blocks: HashMap::new(),
            fail_on: None,
        };
        let mut pool = pool_over(&store, dir.path(), TraceKind::Redundancy);
        pool.first = 5;
        pool.last = 8;
        let stats = pool.execute().unwrap();
        assert_eq!(stats.blocks, 4);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn multi_block_range_collects_every_block() {
        let dir = tempfile::tempdir().unwrap();
        let blocks: HashMap<u64, _> = (100..120)
            .map(|b| (b, BTreeMap::from([(0, transfer_substate())])))
            .collect();
        let store = MapStore { blocks, fail_on: None };
        let mut pool = pool_over(&store, dir.path(), TraceKind::Dependency);
        pool.first = 100;
        pool.last = 119;
        pool.workers = 4;
        let stats = pool.execute().unwrap();
        assert_eq!(stats.blocks, 20);
        for block in 100..120 {
            assert!(dir.path().join(block.to_string()).exists());
        }
    }

    #[test]
    fn worker_error_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = MapStore {
            blocks: HashMap::new(),
            fail_on: Some(13),
        };
        let mut pool = pool_over(&store, dir.path(), TraceKind::Dependency);
        pool.first = 10;
        pool.last = 20;
        assert!(pool.execute().is_err());
    }

    #[test]
    fn filters_drop_the_matching_transactions() {
        let substate = transfer_substate();

        let transfer_filter = TaskFilter {
            skip_transfer_txs: true,
            ..Default::default()
        };
        assert!(transfer_filter.skips(&substate));

        let call_filter = TaskFilter {
            skip_call_txs: true,
            ..Default::default()
        };
        assert!(!call_filter.skips(&substate));

        let mut create = substate.clone();
        create.message.to = None;
        let create_filter = TaskFilter {
            skip_create_txs: true,
            ..Default::default()
        };
        assert!(create_filter.skips(&create));
        assert!(!transfer_filter.skips(&create));
    }
}
