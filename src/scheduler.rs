// Stress scheduling: the cooperative stop signal, block-group
// partitioning and the worker loop that drives the pattern rotation.
//
// Blocks are assigned to workers statically, one contiguous group each,
// so for single-block patterns no two workers ever contend on a lock.
// The one cross-block operation, bulk copy, draws its pair from the whole
// pool and takes both locks in ascending block-id order, which rules out
// lock-order inversion between concurrent copies.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam::channel::Sender;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bandwidth;
use crate::config::TestConfig;
use crate::mem::MemoryBlock;
use crate::pattern::{self, Pattern, PatternCtx};
use crate::stats::{AlgorithmResult, StatsCollector};

/// Cooperative cancellation flag. Requesting is idempotent; workers poll
/// it at iteration boundaries and finish the step they are in.
#[derive(Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> StopSignal {
        StopSignal::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn observed(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a worker reports on its way out. The pass-level results are
/// already in the collector by then; the summary exists so Draining can
/// tell a clean exit from a wedged worker.
#[derive(Clone, Copy, Debug)]
pub struct WorkerSummary {
    pub worker: usize,
    pub cycles: u64,
    pub passes: u64,
    pub errors: u64,
}

/// Split `blocks` into one contiguous group per worker. Workers beyond
/// the block count get nothing and are not spawned.
pub fn partition(blocks: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.min(blocks);
    let mut groups = Vec::with_capacity(workers);
    if workers == 0 {
        return groups;
    }
    let base = blocks / workers;
    let extra = blocks % workers;
    let mut start = 0;
    for w in 0..workers {
        let len = base + usize::from(w < extra);
        groups.push(start..start + len);
        start += len;
    }
    groups
}

fn mix_seed(base: u64, worker: usize, cycle: u64) -> u64 {
    let mut x = base ^ (worker as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    x ^= cycle.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^ (x >> 33)
}

/// Drive the rotation over one block group until stop is observed.
/// Every completed pass re-anchors the block checksum so the final
/// verification compares against a known-good state.
pub fn worker_loop(
    worker: usize,
    blocks: &[Mutex<MemoryBlock>],
    group: Range<usize>,
    cfg: &TestConfig,
    stats: &StatsCollector,
    stop: &StopSignal,
    done: &Sender<WorkerSummary>,
) {
    let ctx = PatternCtx::new(cfg, stop);
    let mut summary = WorkerSummary {
        worker,
        cycles: 0,
        passes: 0,
        errors: 0,
    };

    'run: loop {
        for pattern in Pattern::ROTATION {
            if stop.observed() {
                break 'run;
            }
            if pattern.is_cross_block() {
                let mut rng = StdRng::seed_from_u64(mix_seed(cfg.seed, worker, summary.cycles));
                run_bulk_copy(blocks, &ctx, &mut rng, stats, &mut summary);
                continue;
            }
            for idx in group.clone() {
                if stop.observed() {
                    break 'run;
                }
                let mut block = blocks[idx].lock().unwrap();
                let started = Instant::now();
                let outcome = if pattern == Pattern::Bandwidth {
                    let run = bandwidth::run(block.backing_mut(), &ctx);
                    stats.record_bandwidth(&run);
                    run.outcome
                } else {
                    pattern::run(pattern, block.backing_mut(), &ctx)
                };
                block.reanchor();
                let result = AlgorithmResult {
                    pattern,
                    block: block.id,
                    outcome,
                    duration: started.elapsed(),
                };
                drop(block);
                stats.record(&result);
                summary.passes += 1;
                summary.errors += outcome.error_total();
            }
        }
        summary.cycles += 1;
    }

    debug!(
        "worker {} exiting after {} cycles, {} passes",
        worker, summary.cycles, summary.passes
    );
    // A dropped receiver means the controller already gave up on us.
    let _ = done.send(summary);
}

fn run_bulk_copy(
    blocks: &[Mutex<MemoryBlock>],
    ctx: &PatternCtx,
    rng: &mut StdRng,
    stats: &StatsCollector,
    summary: &mut WorkerSummary,
) {
    if blocks.len() < 2 {
        return;
    }
    let a = rng.gen_range(0..blocks.len());
    let mut b = rng.gen_range(0..blocks.len() - 1);
    if b >= a {
        b += 1;
    }
    let src_is_lo = rng.gen_bool(0.5);
    let (lo, hi) = (a.min(b), a.max(b));

    let started = Instant::now();
    let mut lo_guard = blocks[lo].lock().unwrap();
    let mut hi_guard = blocks[hi].lock().unwrap();
    let (src, dst) = if src_is_lo {
        (&mut lo_guard, &mut hi_guard)
    } else {
        (&mut hi_guard, &mut lo_guard)
    };

    let outcome = pattern::copy_and_verify(src.backing(), dst.backing_mut(), ctx.cap_words, rng);
    dst.reanchor();
    let dst_id = dst.id;
    drop(hi_guard);
    drop(lo_guard);

    let result = AlgorithmResult {
        pattern: Pattern::BulkCopy,
        block: dst_id,
        outcome,
        duration: started.elapsed(),
    };
    stats.record(&result);
    summary.passes += 1;
    summary.errors += outcome.error_total();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{allocate_blocks, HeapAlloc};
    use std::time::Duration;

    #[test]
    fn partition_covers_all_blocks_once() {
        for (blocks, workers) in [(7, 3), (4, 4), (3, 8), (1, 1), (0, 2)] {
            let groups = partition(blocks, workers);
            let covered: usize = groups.iter().map(|g| g.len()).sum();
            assert_eq!(covered, blocks);
            for pair in groups.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            assert!(groups.len() <= workers);
        }
    }

    #[test]
    fn stop_signal_is_shared_across_clones() {
        let stop = StopSignal::new();
        let other = stop.clone();
        assert!(!other.observed());
        stop.request();
        assert!(other.observed());
    }

    #[test]
    fn worker_exits_promptly_once_stopped() {
        let mut cfg = TestConfig::new(4 * 1024 * 1024, Duration::from_secs(1));
        cfg.min_floor_bytes = 1024 * 1024;
        cfg.pattern_cap_bytes = 32 * 1024;
        cfg.hammer_iterations = 1_000;
        cfg.row_spacings = vec![1024];

        let blocks = allocate_blocks(&HeapAlloc, &cfg).unwrap();
        let stats = StatsCollector::new();
        let stop = StopSignal::new();
        let (tx, rx) = crossbeam::channel::bounded(1);

        crossbeam::thread::scope(|s| {
            s.spawn(|_| {
                worker_loop(0, &blocks, 0..blocks.len(), &cfg, &stats, &stop, &tx);
            });
            std::thread::sleep(Duration::from_millis(50));
            stop.request();
            let summary = rx
                .recv_timeout(Duration::from_secs(5))
                .expect("worker did not drain in time");
            assert_eq!(summary.worker, 0);
        })
        .unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_errors(), 0);
        assert!(snapshot.total_passes() > 0);
    }

    #[test]
    fn summary_errors_match_collector_totals() {
        let mut cfg = TestConfig::new(2 * 1024 * 1024, Duration::from_secs(1));
        cfg.min_floor_bytes = 1024 * 1024;
        cfg.pattern_cap_bytes = 16 * 1024;
        cfg.hammer_iterations = 500;
        cfg.row_spacings = vec![1024];

        let blocks = allocate_blocks(&HeapAlloc, &cfg).unwrap();
        let stats = StatsCollector::new();
        let stop = StopSignal::new();
        let (tx, rx) = crossbeam::channel::bounded(1);

        crossbeam::thread::scope(|s| {
            s.spawn(|_| {
                worker_loop(0, &blocks, 0..blocks.len(), &cfg, &stats, &stop, &tx);
            });
            std::thread::sleep(Duration::from_millis(30));
            stop.request();
            let summary = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let snapshot = stats.snapshot();
            let pattern_total: u64 = snapshot
                .per_pattern
                .iter()
                .map(|p| p.errors + p.aliasing)
                .sum();
            assert_eq!(summary.errors, pattern_total);
        })
        .unwrap();
    }
}
