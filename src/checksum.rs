// Block-level integrity checksum.
//
// This is a secondary detector, not the fault signal itself: the patterns
// carry their own before/after verification, and the checksum exists to
// catch any content change a pattern step did not, such as a write from a
// concurrency bug. Speed therefore matters more than collision resistance,
// and the accumulation must be order sensitive so swapped words do not
// cancel out. FNV-1a over words fits both requirements.

use crate::mem::{Backing, MemoryBlock};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Fold every word of the region into an order-sensitive accumulator.
/// Read-only; computing it twice with no intervening write returns the
/// same value.
pub fn checksum(mem: &dyn Backing) -> u64 {
    let mut hash = FNV_OFFSET;
    for idx in 0..mem.words() {
        hash = (hash ^ mem.read_word(idx)).wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Recompute and compare against the block's last anchored checksum.
pub fn verify(block: &MemoryBlock) -> bool {
    checksum(block.backing()) == block.last_good_checksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::HeapBacking;

    #[test]
    fn checksum_is_idempotent() {
        let mut mem = HeapBacking::new(1024).unwrap();
        for i in 0..1024 {
            mem.write_word(i, (i as u64).wrapping_mul(0x9e37_79b9));
        }
        assert_eq!(checksum(&mem), checksum(&mem));
    }

    #[test]
    fn checksum_detects_single_word_change() {
        let mut mem = HeapBacking::new(256).unwrap();
        let before = checksum(&mem);
        mem.write_word(100, 1);
        assert_ne!(before, checksum(&mem));
    }

    #[test]
    fn checksum_is_order_sensitive() {
        let mut a = HeapBacking::new(2).unwrap();
        let mut b = HeapBacking::new(2).unwrap();
        a.write_word(0, 1);
        a.write_word(1, 2);
        b.write_word(0, 2);
        b.write_word(1, 1);
        assert_ne!(checksum(&a), checksum(&b));
    }
}
