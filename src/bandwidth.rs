// Bandwidth measurement as a rotation member.
//
// Three phases over the tested prefix: sequential write, sequential
// read-and-verify, and random access. The phases double as a light
// integrity check; every read is compared, and mismatches count toward
// the run's error total like any other pattern. Rates are reported per
// phase because a part that streams fine but collapses under random
// access is a real and distinct failure mode.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::mem::{Backing, WORD_BYTES};
use crate::pattern::{PatternCtx, PatternOutcome};

#[derive(Clone, Copy, Debug, Default)]
pub struct PhaseRate {
    pub bytes: u64,
    pub nanos: u64,
}

impl PhaseRate {
    pub fn mbps(&self) -> f64 {
        if self.nanos == 0 {
            return 0.0;
        }
        let secs = self.nanos as f64 / 1e9;
        (self.bytes as f64 / (1024.0 * 1024.0)) / secs
    }

    fn accumulate(&mut self, other: PhaseRate) {
        self.bytes += other.bytes;
        self.nanos += other.nanos;
    }
}

/// Per-phase aggregate across however many bandwidth passes ran.
#[derive(Clone, Copy, Debug, Default)]
pub struct BandwidthTotals {
    pub seq_write: PhaseRate,
    pub seq_read: PhaseRate,
    pub random: PhaseRate,
}

impl BandwidthTotals {
    pub fn accumulate(&mut self, run: &BandwidthRun) {
        self.seq_write.accumulate(run.seq_write);
        self.seq_read.accumulate(run.seq_read);
        self.random.accumulate(run.random);
    }
}

pub struct BandwidthRun {
    pub outcome: PatternOutcome,
    pub seq_write: PhaseRate,
    pub seq_read: PhaseRate,
    pub random: PhaseRate,
}

fn seq_value(idx: usize, seed: u64) -> u64 {
    (idx as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ seed
}

/// Drive all three phases against the block's tested prefix. Leaves the
/// prefix zero-filled like every other rotation member.
pub fn run(mem: &mut dyn Backing, ctx: &PatternCtx) -> BandwidthRun {
    let n = ctx.cap_words.min(mem.words());
    let mut outcome = PatternOutcome {
        bytes_tested: (n * WORD_BYTES) as u64,
        ..Default::default()
    };

    let started = Instant::now();
    for i in 0..n {
        mem.write_word(i, seq_value(i, ctx.seed));
    }
    let seq_write = PhaseRate {
        bytes: (n * WORD_BYTES) as u64,
        nanos: started.elapsed().as_nanos() as u64,
    };
    outcome.writes += n as u64;

    let started = Instant::now();
    for i in 0..n {
        if mem.read_word(i) != seq_value(i, ctx.seed) {
            outcome.errors += 1;
        }
    }
    let seq_read = PhaseRate {
        bytes: (n * WORD_BYTES) as u64,
        nanos: started.elapsed().as_nanos() as u64,
    };
    outcome.reads += n as u64;

    // Random phase: write-then-read per access, since random indices can
    // repeat and a deferred sweep would verify stale values.
    let accesses = n;
    let mut rng = StdRng::seed_from_u64(ctx.seed ^ 0xBAD_CAFE);
    let started = Instant::now();
    if n > 0 {
        for _ in 0..accesses {
            let idx = rng.gen_range(0..n);
            let val: u64 = rng.gen();
            mem.write_word(idx, val);
            if mem.read_word(idx) != val {
                outcome.errors += 1;
            }
        }
    }
    let random = PhaseRate {
        bytes: (accesses * 2 * WORD_BYTES) as u64,
        nanos: started.elapsed().as_nanos() as u64,
    };
    outcome.writes += accesses as u64;
    outcome.reads += accesses as u64;

    for i in 0..n {
        mem.write_word(i, 0);
    }
    outcome.writes += n as u64;

    BandwidthRun {
        outcome,
        seq_write,
        seq_read,
        random,
    }
}
