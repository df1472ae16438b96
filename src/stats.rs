// Run statistics: per-algorithm tallies, bandwidth aggregates and the
// verification bookkeeping the final report is built from.
//
// One collector is shared by every worker behind a mutex. Recording is a
// handful of integer adds per pattern pass, which is noise next to the
// pass itself, so a finer-grained scheme would buy nothing.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::bandwidth::{BandwidthRun, BandwidthTotals};
use crate::mem::BlockId;
use crate::pattern::{Pattern, PatternOutcome, PATTERN_KINDS};

/// One completed pattern pass against one block.
#[derive(Clone, Copy, Debug)]
pub struct AlgorithmResult {
    pub pattern: Pattern,
    pub block: BlockId,
    pub outcome: PatternOutcome,
    pub duration: Duration,
}

/// Accumulated tallies for one statistics bucket.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatternStats {
    pub passes: u64,
    pub errors: u64,
    pub aliasing: u64,
    pub reads: u64,
    pub writes: u64,
    pub bytes_tested: u64,
    pub busy: Duration,
}

impl PatternStats {
    fn add(&mut self, result: &AlgorithmResult) {
        self.passes += 1;
        self.errors += result.outcome.errors;
        self.aliasing += result.outcome.aliasing;
        self.reads += result.outcome.reads;
        self.writes += result.outcome.writes;
        self.bytes_tested += result.outcome.bytes_tested;
        self.busy += result.duration;
    }
}

/// Full picture of a run, snapshotted for reporting.
#[derive(Clone, Debug)]
pub struct RunStatistics {
    pub per_pattern: [PatternStats; PATTERN_KINDS],
    pub bandwidth: BandwidthTotals,
    pub verification_failures: u64,
    pub worker_timeouts: u64,
    pub last_verified: BTreeMap<BlockId, Instant>,
}

impl Default for RunStatistics {
    fn default() -> RunStatistics {
        RunStatistics {
            per_pattern: [PatternStats::default(); PATTERN_KINDS],
            bandwidth: BandwidthTotals::default(),
            verification_failures: 0,
            worker_timeouts: 0,
            last_verified: BTreeMap::new(),
        }
    }
}

impl RunStatistics {
    /// Every mismatching read counted anywhere in the run: pattern errors,
    /// aliasing hits and checksum verification failures.
    pub fn total_errors(&self) -> u64 {
        let pattern_total: u64 = self
            .per_pattern
            .iter()
            .map(|p| p.errors + p.aliasing)
            .sum();
        pattern_total + self.verification_failures
    }

    pub fn total_reads(&self) -> u64 {
        self.per_pattern.iter().map(|p| p.reads).sum()
    }

    pub fn total_writes(&self) -> u64 {
        self.per_pattern.iter().map(|p| p.writes).sum()
    }

    pub fn total_passes(&self) -> u64 {
        self.per_pattern.iter().map(|p| p.passes).sum()
    }
}

/// Thread-shared collector. Workers record through a shared reference;
/// the lifecycle controller snapshots at the end and during progress
/// logging.
#[derive(Default)]
pub struct StatsCollector {
    inner: Mutex<RunStatistics>,
}

impl StatsCollector {
    pub fn new() -> StatsCollector {
        StatsCollector::default()
    }

    pub fn record(&self, result: &AlgorithmResult) {
        let mut stats = self.inner.lock().unwrap();
        stats.per_pattern[result.pattern.index()].add(result);
    }

    pub fn record_bandwidth(&self, run: &BandwidthRun) {
        let mut stats = self.inner.lock().unwrap();
        stats.bandwidth.accumulate(run);
    }

    pub fn record_verification_failure(&self, block: BlockId) {
        let mut stats = self.inner.lock().unwrap();
        stats.verification_failures += 1;
        log::error!("block {} failed checksum verification", block);
    }

    pub fn mark_verified(&self, block: BlockId) {
        let mut stats = self.inner.lock().unwrap();
        stats.last_verified.insert(block, Instant::now());
    }

    pub fn note_worker_timeout(&self, worker: usize) {
        let mut stats = self.inner.lock().unwrap();
        stats.worker_timeouts += 1;
        log::warn!("worker {} missed the drain deadline", worker);
    }

    pub fn snapshot(&self) -> RunStatistics {
        self.inner.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(pattern: Pattern, errors: u64, aliasing: u64) -> AlgorithmResult {
        AlgorithmResult {
            pattern,
            block: 0,
            outcome: PatternOutcome {
                errors,
                aliasing,
                reads: 10,
                writes: 10,
                bytes_tested: 80,
            },
            duration: Duration::from_millis(1),
        }
    }

    #[test]
    fn totals_are_sums_of_buckets() {
        let collector = StatsCollector::new();
        collector.record(&result(Pattern::WalkingOnes, 3, 0));
        collector.record(&result(Pattern::AddressLine, 1, 2));
        collector.record(&result(Pattern::Solid(0xFF), 0, 0));
        collector.record_verification_failure(4);

        let stats = collector.snapshot();
        assert_eq!(stats.total_errors(), 3 + 1 + 2 + 1);
        assert_eq!(stats.total_passes(), 3);
        assert_eq!(stats.per_pattern[Pattern::WalkingOnes.index()].errors, 3);
        assert_eq!(stats.per_pattern[Pattern::AddressLine.index()].aliasing, 2);
    }

    #[test]
    fn solid_variants_share_one_bucket() {
        let collector = StatsCollector::new();
        collector.record(&result(Pattern::Solid(0x00), 1, 0));
        collector.record(&result(Pattern::Solid(0xAA), 1, 0));
        let stats = collector.snapshot();
        assert_eq!(stats.per_pattern[0].passes, 2);
        assert_eq!(stats.per_pattern[0].errors, 2);
    }

    #[test]
    fn verification_marks_are_per_block() {
        let collector = StatsCollector::new();
        collector.mark_verified(2);
        collector.mark_verified(0);
        let stats = collector.snapshot();
        assert_eq!(stats.last_verified.len(), 2);
        assert!(stats.last_verified.contains_key(&0));
    }
}
