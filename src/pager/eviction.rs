//! Eviction: generation-based recency scoring and the reclaim sweep.
//!
//! Every successful borrow marks its block in the current access
//! generation. An eviction pass scores each idle block by which of the
//! last four generations touched it (most recent generation in the
//! high bit, so lower patterns are colder), reclaims the coldest
//! blocks until resident memory drops below the soft limit, then
//! rotates the generations so the next window starts clean.

use std::sync::atomic::Ordering;

use crate::constants::{BLOCK_SIZE, NUMBER_OF_ACCESS_GENERATIONS};
use crate::sync::AtomicBitmap;

use super::PagerInner;

impl PagerInner {
    /// Best-effort reclaim of cold, unreferenced blocks.
    ///
    /// May return without reaching the target when every loaded block
    /// is still borrowed; admission then decides between proceeding
    /// and failing at the hard limit.
    pub(super) fn evict(&self) {
        let soft = self.limits.soft();

        let mut candidates: Vec<(u8, usize)> = Vec::new();
        for (block, slot) in self.slots.iter().enumerate() {
            if slot.is_idle() {
                candidates.push((self.usage_score(block), block));
            }
        }
        candidates.sort_unstable();

        let mut freed = 0u64;
        for &(_, block) in &candidates {
            if self.size_used.load(Ordering::SeqCst) < soft {
                break;
            }
            // A borrow taken since the scan makes reset fail; the block
            // survives.
            if let Some(buf) = self.slots[block].reset() {
                // Safety: loaded slots hold pointers from Box::into_raw.
                unsafe { drop(Box::from_raw(buf.as_ptr())) };
                self.size_used.fetch_sub(BLOCK_SIZE, Ordering::SeqCst);
                self.stats.record_evicted();
                freed += BLOCK_SIZE;
            }
        }

        self.stats.record_eviction_pass();
        self.rotate_generation();
        tracing::debug!(freed, candidates = candidates.len(), "eviction pass");
    }

    fn usage_score(&self, block: usize) -> u8 {
        usage_pattern(
            &self.accessed,
            self.access_idx.load(Ordering::Relaxed),
            block,
        )
    }

    /// Advance the current generation, clearing the one rotated in.
    ///
    /// Rotation happens once per eviction pass, so each generation
    /// records the touches of one inter-eviction window.
    fn rotate_generation(&self) {
        let next = (self.access_idx.load(Ordering::Relaxed) + 1) % NUMBER_OF_ACCESS_GENERATIONS;
        self.accessed[next].clear_all();
        self.access_idx.store(next, Ordering::Relaxed);
    }
}

/// Recency pattern for `block`: one bit per generation, the current
/// generation in the high bit and each older generation one bit down.
/// Ordered by value, recently-touched blocks always outrank blocks
/// whose last touch is older, so the pattern doubles as the usage
/// score (lower = colder).
fn usage_pattern(accessed: &[AtomicBitmap], current: usize, block: usize) -> u8 {
    let generations = accessed.len();
    let mut pattern = 0u8;
    for age in 0..generations {
        let generation = (current + generations - age) % generations;
        if accessed[generation].test(block) {
            pattern |= 1 << (generations - 1 - age);
        }
    }
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::NUMBER_OF_BLOCKS;

    fn generations() -> Vec<AtomicBitmap> {
        (0..NUMBER_OF_ACCESS_GENERATIONS)
            .map(|_| AtomicBitmap::new(NUMBER_OF_BLOCKS))
            .collect()
    }

    #[test]
    fn test_untouched_block_is_coldest() {
        let accessed = generations();
        assert_eq!(usage_pattern(&accessed, 0, 7), 0);
    }

    #[test]
    fn test_current_generation_is_high_bit() {
        let accessed = generations();
        accessed[2].set(5);
        assert_eq!(usage_pattern(&accessed, 2, 5), 0b1000);
    }

    #[test]
    fn test_older_generations_rank_lower() {
        let accessed = generations();
        // current = 3; ages 1..3 map to generations 2, 1, 0.
        accessed[2].set(9);
        assert_eq!(usage_pattern(&accessed, 3, 9), 0b0100);
        accessed[1].set(9);
        assert_eq!(usage_pattern(&accessed, 3, 9), 0b0110);
        accessed[0].set(9);
        assert_eq!(usage_pattern(&accessed, 3, 9), 0b0111);
        accessed[3].set(9);
        assert_eq!(usage_pattern(&accessed, 3, 9), 0b1111);
    }

    #[test]
    fn test_recent_touch_outranks_any_older_history() {
        let accessed = generations();
        // Block 1: touched only in the current generation.
        accessed[0].set(1);
        // Block 2: touched in every generation except the current one.
        accessed[1].set(2);
        accessed[2].set(2);
        accessed[3].set(2);
        let hot = usage_pattern(&accessed, 0, 1);
        let cold = usage_pattern(&accessed, 0, 2);
        assert!(hot > cold, "hot={hot:#06b} cold={cold:#06b}");
    }

    #[test]
    fn test_wrap_around_ages() {
        let accessed = generations();
        // current = 0: age 1 is generation 3, age 3 is generation 1.
        accessed[3].set(4);
        assert_eq!(usage_pattern(&accessed, 0, 4), 0b0100);
        accessed[1].set(4);
        assert_eq!(usage_pattern(&accessed, 0, 4), 0b0101);
    }
}
