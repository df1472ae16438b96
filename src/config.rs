// Run configuration and tunables.
//
// The invocation surface is deliberately small: the caller hands us a target
// byte count and a wall-clock duration, everything else has defaults. The
// per-algorithm sizing knobs (tested prefix cap, row-hammer spacing and
// iteration counts) are configuration rather than constants because the
// right values depend on the DRAM geometry of the part under test.

use std::path::PathBuf;
use std::time::Duration;

use crate::StressError;

/// Runs that cannot allocate at least this much memory are refused outright.
/// Testing less than this says nothing useful about a DRAM part.
pub const MIN_MEMORY_FLOOR: usize = 500 * 1024 * 1024;

/// Default cap on the tested prefix of a block for a single pattern pass.
/// Bounds per-cycle cost independent of block size.
pub const DEFAULT_PATTERN_CAP: usize = 1024 * 1024;

#[derive(Clone, Debug)]
pub struct TestConfig {
    /// Total bytes to allocate across all blocks.
    pub target_bytes: usize,
    /// Wall-clock length of the stress phase.
    pub duration: Duration,
    /// Worker thread count. Defaults to the number of available cores.
    pub workers: usize,
    /// Partial allocation down to this floor is accepted and logged;
    /// exhaustion below it aborts the run.
    pub min_floor_bytes: usize,
    /// Tested prefix of each block per pattern pass, in bytes.
    pub pattern_cap_bytes: usize,
    /// Aggressor read count per row spacing in the row-hammer probe.
    pub hammer_iterations: u32,
    /// How many hammer reads happen between stop-signal polls.
    pub hammer_poll_chunk: u32,
    /// Candidate DRAM row sizes for the row-hammer probe, in bytes.
    pub row_spacings: Vec<usize>,
    /// Base seed for every deterministic pseudorandom sequence in the run.
    pub seed: u64,
    /// How long Draining waits for each worker to report before its exit
    /// is tallied as a WorkerTimeout.
    pub drain_timeout: Duration,
    /// Cadence of progress log lines during the stress phase.
    pub progress_interval: Duration,
    /// EDAC sysfs root for ECC counter monitoring, if available.
    pub edac_path: Option<PathBuf>,
}

impl TestConfig {
    pub fn new(target_bytes: usize, duration: Duration) -> TestConfig {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        TestConfig {
            target_bytes,
            duration,
            workers,
            min_floor_bytes: MIN_MEMORY_FLOOR,
            pattern_cap_bytes: DEFAULT_PATTERN_CAP,
            hammer_iterations: 200_000,
            hammer_poll_chunk: 10_000,
            row_spacings: vec![8 * 1024, 16 * 1024, 32 * 1024],
            seed: 0x5EED_0F_DEAD_BEEF,
            drain_timeout: Duration::from_secs(10),
            progress_interval: Duration::from_secs(1),
            edac_path: Some(PathBuf::from("/sys/devices/system/edac")),
        }
    }

    /// Check the parameters before any memory is touched. A target below
    /// the floor is refused here so that zero operations are recorded.
    pub fn validate(&self) -> Result<(), StressError> {
        if self.target_bytes < self.min_floor_bytes {
            return Err(StressError::AllocationExhausted {
                wanted: self.target_bytes,
                got: 0,
                floor: self.min_floor_bytes,
            });
        }
        if self.duration.is_zero() {
            return Err(StressError::ZeroDuration);
        }
        if self.workers == 0 {
            return Err(StressError::NoWorkers);
        }
        if self.pattern_cap_bytes < crate::mem::WORD_BYTES {
            return Err(StressError::UnalignedSize(crate::mem::WORD_BYTES));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_below_floor_is_refused() {
        let cfg = TestConfig::new(MIN_MEMORY_FLOOR - 1, Duration::from_secs(1));
        match cfg.validate() {
            Err(StressError::AllocationExhausted { got, .. }) => assert_eq!(got, 0),
            other => panic!("expected AllocationExhausted, got {:?}", other),
        }
    }

    #[test]
    fn zero_duration_is_refused() {
        let cfg = TestConfig::new(MIN_MEMORY_FLOOR, Duration::ZERO);
        assert!(matches!(cfg.validate(), Err(StressError::ZeroDuration)));
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = TestConfig::new(MIN_MEMORY_FLOOR, Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }
}
