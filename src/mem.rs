// Memory region management: the Backing seam, block allocation in size
// tiers, page touching and checksum anchoring.
//
// The allocator is a black box that may hand back lazily-backed pages, so
// every page is written once immediately after allocation. Without the
// touch pass the first pattern sweep would be measuring the allocator's
// page-fault path instead of the memory.

use std::ptr;
use std::sync::Mutex;

use log::{info, warn};
use num_traits::PrimInt;

use crate::checksum;
use crate::config::TestConfig;
use crate::StressError;

pub const WORD_BYTES: usize = 8;
const PAGE_WORDS: usize = 4096 / WORD_BYTES;

/// Stable block identifier, unique for the test run.
pub type BlockId = u32;

/// The addressable-memory seam every pattern runs against. Word granular;
/// offsets are word indices, not byte addresses. Production backing is
/// heap memory read and written volatile; tests substitute fault-injecting
/// implementations behind the same trait.
pub trait Backing: Send {
    /// Number of u64 words in the region.
    fn words(&self) -> usize;

    fn read_word(&self, idx: usize) -> u64;

    fn write_word(&mut self, idx: usize, val: u64);

    fn size_bytes(&self) -> usize {
        self.words() * WORD_BYTES
    }
}

/// Black-box block allocator. Returns None when a region of the requested
/// size cannot be obtained; the region manager decides whether that is
/// fatal based on the allocation floor.
pub trait BlockAlloc: Sync {
    fn alloc(&self, words: usize) -> Option<Box<dyn Backing>>;
}

/// Heap-backed region. Reads and writes are volatile so the compiler
/// cannot collapse the write-then-verify sequences the patterns rely on.
pub struct HeapBacking {
    data: Vec<u64>,
}

impl HeapBacking {
    pub fn new(words: usize) -> Option<HeapBacking> {
        let mut data: Vec<u64> = Vec::new();
        if data.try_reserve_exact(words).is_err() {
            return None;
        }
        data.resize(words, 0);
        Some(HeapBacking { data })
    }
}

impl Backing for HeapBacking {
    fn words(&self) -> usize {
        self.data.len()
    }

    fn read_word(&self, idx: usize) -> u64 {
        unsafe { ptr::read_volatile(&self.data[idx]) }
    }

    fn write_word(&mut self, idx: usize, val: u64) {
        unsafe { ptr::write_volatile(&mut self.data[idx], val) }
    }
}

pub struct HeapAlloc;

impl BlockAlloc for HeapAlloc {
    fn alloc(&self, words: usize) -> Option<Box<dyn Backing>> {
        HeapBacking::new(words).map(|b| Box::new(b) as Box<dyn Backing>)
    }
}

/// One allocated, physically-touched contiguous range under test.
///
/// The baseline checksum is anchored once, before any pattern runs. After
/// that the block-level checksum is only meaningful between two anchor
/// points: every completed pattern pass re-anchors via `reanchor()`, and
/// the final verification pass compares against the last anchor.
pub struct MemoryBlock {
    pub id: BlockId,
    backing: Box<dyn Backing>,
    pub baseline_checksum: u64,
    pub last_good_checksum: u64,
}

impl MemoryBlock {
    fn new(id: BlockId, mut backing: Box<dyn Backing>) -> MemoryBlock {
        touch_pages(backing.as_mut());
        let sum = checksum::checksum(backing.as_ref());
        MemoryBlock {
            id,
            backing,
            baseline_checksum: sum,
            last_good_checksum: sum,
        }
    }

    pub fn words(&self) -> usize {
        self.backing.words()
    }

    pub fn size_bytes(&self) -> usize {
        self.backing.size_bytes()
    }

    pub fn backing(&self) -> &dyn Backing {
        self.backing.as_ref()
    }

    pub fn backing_mut(&mut self) -> &mut dyn Backing {
        self.backing.as_mut()
    }

    /// Re-anchor the block checksum after a completed pattern pass. Never
    /// called by the patterns themselves; only the worker loop and the
    /// final verifier move this value.
    pub fn reanchor(&mut self) {
        self.last_good_checksum = checksum::checksum(self.backing.as_ref());
    }
}

/// Write one word per page so the kernel commits physical frames now.
fn touch_pages(mem: &mut dyn Backing) {
    let words = mem.words();
    let mut idx = 0;
    while idx < words {
        mem.write_word(idx, 0);
        idx += PAGE_WORDS;
    }
    if words > 0 {
        mem.write_word(words - 1, 0);
    }
}

/// Position of the highest set bit. Used for address-line probing and
/// tier sizing; unlike an alignment check this accepts any nonzero value.
pub(crate) fn floor_log2<T: PrimInt>(value: T) -> usize {
    debug_assert!(value > T::zero());
    let size_in_bits = std::mem::size_of::<T>() * 8;
    size_in_bits - 1 - value.leading_zeros() as usize
}

/// Four block-size tiers derived from the target. A mix of sizes exercises
/// the allocator's placement of discontiguous physical pages and bounds
/// the blast radius of a single corrupted block.
fn tier_sizes(target_bytes: usize) -> [usize; 4] {
    const MIB: usize = 1024 * 1024;
    let base = ((target_bytes / 16) / MIB * MIB).max(MIB);
    [8 * base, 4 * base, 2 * base, base]
}

/// Allocate and touch blocks until the target is met, cycling through the
/// size tiers largest-first. Exhaustion above the floor degrades to a
/// logged partial run; below the floor it aborts the whole run, since
/// silently under-testing defeats the tool's purpose.
pub fn allocate_blocks(
    alloc: &dyn BlockAlloc,
    cfg: &TestConfig,
) -> Result<Vec<Mutex<MemoryBlock>>, StressError> {
    let tiers = tier_sizes(cfg.target_bytes);
    let mut blocks: Vec<Mutex<MemoryBlock>> = Vec::new();
    let mut allocated = 0usize;
    let mut next_id: BlockId = 0;
    let mut tier = 0usize;

    while allocated < cfg.target_bytes {
        let remaining = cfg.target_bytes - allocated;
        let size = tiers[tier % tiers.len()].min(remaining).max(WORD_BYTES);
        let words = size / WORD_BYTES;

        match alloc.alloc(words) {
            Some(backing) => {
                let block = MemoryBlock::new(next_id, backing);
                allocated += block.size_bytes();
                blocks.push(Mutex::new(block));
                next_id += 1;
                tier += 1;
            }
            None => {
                // Fall back to the next smaller tier before giving up.
                let in_cycle = tier % tiers.len();
                if in_cycle < tiers.len() - 1 {
                    tier += 1;
                    continue;
                }
                if allocated >= cfg.min_floor_bytes {
                    warn!(
                        "allocation exhausted at {} of {} bytes; continuing with partial set",
                        allocated, cfg.target_bytes
                    );
                    break;
                }
                return Err(StressError::AllocationExhausted {
                    wanted: cfg.target_bytes,
                    got: allocated,
                    floor: cfg.min_floor_bytes,
                });
            }
        }
    }

    info!(
        "allocated {} blocks, {} bytes total (target {})",
        blocks.len(),
        allocated,
        cfg.target_bytes
    );
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small_cfg(target: usize) -> TestConfig {
        let mut cfg = TestConfig::new(target, Duration::from_secs(1));
        cfg.min_floor_bytes = 1024 * 1024;
        cfg
    }

    #[test]
    fn floor_log2_values() {
        assert_eq!(floor_log2(1usize), 0);
        assert_eq!(floor_log2(2usize), 1);
        assert_eq!(floor_log2(3usize), 1);
        assert_eq!(floor_log2(1024usize), 10);
        assert_eq!(floor_log2(u64::MAX), 63);
    }

    #[test]
    fn tiers_cover_four_sizes() {
        let tiers = tier_sizes(64 * 1024 * 1024);
        assert_eq!(tiers.len(), 4);
        for pair in tiers.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn allocation_meets_target_with_stable_ids() {
        let cfg = small_cfg(8 * 1024 * 1024);
        let blocks = allocate_blocks(&HeapAlloc, &cfg).unwrap();
        let total: usize = blocks
            .iter()
            .map(|b| b.lock().unwrap().size_bytes())
            .sum();
        assert!(total >= cfg.target_bytes);
        for (i, b) in blocks.iter().enumerate() {
            assert_eq!(b.lock().unwrap().id as usize, i);
        }
    }

    #[test]
    fn baseline_checksum_anchored_at_creation() {
        let cfg = small_cfg(4 * 1024 * 1024);
        let blocks = allocate_blocks(&HeapAlloc, &cfg).unwrap();
        let block = blocks[0].lock().unwrap();
        assert_eq!(block.baseline_checksum, block.last_good_checksum);
        assert_eq!(
            block.baseline_checksum,
            crate::checksum::checksum(block.backing())
        );
    }

    #[test]
    fn exhaustion_below_floor_aborts() {
        struct NoAlloc;
        impl BlockAlloc for NoAlloc {
            fn alloc(&self, _words: usize) -> Option<Box<dyn Backing>> {
                None
            }
        }
        let cfg = small_cfg(8 * 1024 * 1024);
        match allocate_blocks(&NoAlloc, &cfg) {
            Err(StressError::AllocationExhausted { got, .. }) => assert_eq!(got, 0),
            other => panic!("expected AllocationExhausted, got {:?}", other.is_ok()),
        }
    }
}
