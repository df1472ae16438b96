// Run lifecycle: phase sequencing, the stress deadline, draining workers
// and the final verification sweep.
//
// Phases always advance in one direction. A run that gets past allocation
// always produces a report, even when interrupted early; the only Err
// path out of `run` is refusing to start (bad parameters or allocation
// below the floor).

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError};
use log::info;

use crate::checksum;
use crate::config::TestConfig;
use crate::ecc::{EccDelta, EccMonitor};
use crate::mem::{allocate_blocks, BlockAlloc, HeapAlloc, MemoryBlock};
use crate::scheduler::{self, StopSignal};
use crate::stats::{RunStatistics, StatsCollector};
use crate::StressError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Allocating,
    Stressing,
    Draining,
    Verifying,
    Reporting,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Allocating => "allocating",
            Phase::Stressing => "stressing",
            Phase::Draining => "draining",
            Phase::Verifying => "verifying",
            Phase::Reporting => "reporting",
        }
    }
}

fn enter(phase: Phase) {
    info!("phase: {}", phase.name());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
}

#[derive(Debug)]
pub struct RunReport {
    pub verdict: Verdict,
    pub stats: RunStatistics,
    pub blocks: usize,
    pub bytes_under_test: usize,
    pub elapsed: Duration,
    pub ecc: Option<EccDelta>,
}

impl RunReport {
    /// Pattern errors, aliasing, verification failures, plus any
    /// uncorrectable ECC events. Correctable ECC events stay out of the
    /// verdict; the hardware fixed those.
    pub fn total_errors(&self) -> u64 {
        let ue = self.ecc.map(|d| d.uncorrectable).unwrap_or(0);
        self.stats.total_errors() + ue
    }
}

/// Run the full lifecycle against heap memory.
pub fn run(cfg: &TestConfig, stop: &StopSignal) -> Result<RunReport, StressError> {
    run_with(cfg, &HeapAlloc, stop)
}

/// Run the full lifecycle against a caller-provided allocator.
pub fn run_with(
    cfg: &TestConfig,
    alloc: &dyn BlockAlloc,
    stop: &StopSignal,
) -> Result<RunReport, StressError> {
    enter(Phase::Idle);
    cfg.validate()?;

    enter(Phase::Allocating);
    let blocks = allocate_blocks(alloc, cfg).map_err(|err| {
        info!("terminal: aborted ({})", err);
        err
    })?;
    let bytes_under_test: usize = blocks.iter().map(|b| b.lock().unwrap().size_bytes()).sum();

    let ecc = cfg
        .edac_path
        .as_deref()
        .and_then(EccMonitor::probe);

    let stats = StatsCollector::new();
    let started = Instant::now();

    enter(Phase::Stressing);
    let groups = scheduler::partition(blocks.len(), cfg.workers);
    let (tx, rx) = channel::bounded(groups.len());

    crossbeam::thread::scope(|s| {
        for (worker, group) in groups.iter().cloned().enumerate() {
            let tx = tx.clone();
            let stats = &stats;
            let blocks = &blocks;
            let stop_ref = stop;
            s.spawn(move |_| {
                scheduler::worker_loop(worker, blocks, group, cfg, stats, stop_ref, &tx);
            });
        }
        drop(tx);

        let deadline = started + cfg.duration;
        loop {
            let now = Instant::now();
            if now >= deadline || stop.observed() {
                break;
            }
            let nap = cfg.progress_interval.min(deadline - now);
            std::thread::sleep(nap);
            let snapshot = stats.snapshot();
            let ops = snapshot.total_reads() + snapshot.total_writes();
            let errors = snapshot.total_errors();
            let rate = if ops > 0 {
                errors as f64 / ops as f64
            } else {
                0.0
            };
            info!(
                "progress: elapsed {:.0?}, remaining {:.0?}, ops {}, errors {} ({:.2e}/op)",
                started.elapsed(),
                deadline.saturating_duration_since(Instant::now()),
                ops,
                errors,
                rate
            );
        }

        enter(Phase::Draining);
        stop.request();
        drain(&rx, groups.len(), cfg.drain_timeout, &stats);
    })
    .map_err(|_| StressError::WorkerPanicked)?;

    let elapsed = started.elapsed();

    enter(Phase::Verifying);
    verify_blocks(&blocks, &stats);

    enter(Phase::Reporting);
    let ecc_delta = ecc.map(|m| m.delta());
    if let Some(delta) = ecc_delta {
        info!(
            "ECC delta: correctable {}, uncorrectable {}",
            delta.correctable, delta.uncorrectable
        );
    }

    let stats = stats.snapshot();
    let report = RunReport {
        verdict: Verdict::Passed,
        stats,
        blocks: blocks.len(),
        bytes_under_test,
        elapsed,
        ecc: ecc_delta,
    };
    let verdict = if report.total_errors() > 0 {
        Verdict::Failed
    } else {
        Verdict::Passed
    };
    let report = RunReport { verdict, ..report };

    info!(
        "run {:?}: {} blocks, {} bytes, {} passes, {} errors in {:.1?}",
        report.verdict,
        report.blocks,
        report.bytes_under_test,
        report.stats.total_passes(),
        report.total_errors(),
        report.elapsed
    );
    Ok(report)
}

/// Wait for every worker summary up to one shared deadline. A worker that
/// misses it is tallied, not waited on; its pass-level results are
/// already recorded.
fn drain(
    rx: &channel::Receiver<scheduler::WorkerSummary>,
    workers: usize,
    timeout: Duration,
    stats: &StatsCollector,
) {
    let deadline = Instant::now() + timeout;
    let mut reported = vec![false; workers];
    let mut received = 0;

    while received < workers {
        match rx.recv_deadline(deadline) {
            Ok(summary) => {
                info!(
                    "worker {} drained: {} cycles, {} passes, {} errors",
                    summary.worker, summary.cycles, summary.passes, summary.errors
                );
                if summary.worker < workers {
                    reported[summary.worker] = true;
                }
                received += 1;
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for (worker, done) in reported.iter().enumerate() {
        if !done {
            stats.note_worker_timeout(worker);
        }
    }
}

fn verify_blocks(blocks: &[Mutex<MemoryBlock>], stats: &StatsCollector) {
    for block in blocks {
        let block = block.lock().unwrap();
        if checksum::verify(&block) {
            stats.mark_verified(block.id);
        } else {
            stats.record_verification_failure(block.id);
        }
    }
}
