//! DRAM fault-detection and stress-validation engine.
//!
//! This crate allocates a large share of system memory, carves it into
//! independently lockable blocks, and drives a fixed rotation of
//! fault-detection algorithms over them from multiple worker threads for
//! a configured duration. Detection is count-based throughout: every
//! mismatching read is an error event, so a marginal part that flips one
//! bit an hour and a dead data line read apart in the report.
//!
//! The usual embedding looks like:
//!
//! ```no_run
//! use std::time::Duration;
//! use memstress::{lifecycle, StopSignal, TestConfig, Verdict};
//!
//! let cfg = TestConfig::new(2 * 1024 * 1024 * 1024, Duration::from_secs(600));
//! let stop = StopSignal::new();
//! let report = lifecycle::run(&cfg, &stop)?;
//! assert_eq!(report.verdict, Verdict::Passed);
//! # Ok::<(), memstress::StressError>(())
//! ```
//!
//! The `stop` handle can be cloned into a signal handler; workers observe
//! it at iteration boundaries and the run drains, verifies and reports
//! instead of being torn down mid-write.
//!
//! Memory is reached through the [`mem::Backing`] trait. Production runs
//! use volatile heap access; the trait exists so fault models (stuck
//! cells, aliased address lines) can stand in during tests.

pub mod bandwidth;
pub mod checksum;
pub mod config;
pub mod ecc;
pub mod lifecycle;
pub mod mem;
pub mod monitor;
pub mod pattern;
pub mod scheduler;
pub mod stats;

pub use config::TestConfig;
pub use lifecycle::{RunReport, Verdict};
pub use pattern::Pattern;
pub use scheduler::StopSignal;
pub use stats::RunStatistics;

use thiserror::Error;

/// Errors that prevent a run from starting or completing. Fault findings
/// are never errors; they are counts in the report.
#[derive(Debug, Error)]
pub enum StressError {
    /// Could not allocate at least the floor. `got` is what allocation
    /// reached before giving up.
    #[error("allocation exhausted: wanted {wanted} bytes, got {got}, floor {floor}")]
    AllocationExhausted {
        wanted: usize,
        got: usize,
        floor: usize,
    },

    #[error("stress duration must be nonzero")]
    ZeroDuration,

    #[error("worker count must be nonzero")]
    NoWorkers,

    #[error("size must be a multiple of {0} bytes")]
    UnalignedSize(usize),

    #[error("a worker thread panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
