#![forbid(unsafe_code)]
//! Block allocation for a contiguous-file filesystem.
//!
//! Every file occupies one run of consecutive blocks, so allocation is a
//! matter of finding free *runs* rather than free blocks.
//!
//! ## Design
//!
//! 1. **Bitmap**: raw bit manipulation on `u32` words, bit `i` of word
//!    `i / 32` describes block `i`.
//! 2. **AllocBitmap**: a bitmap bound to a block count, with block 0
//!    (the File Table) permanently allocated.
//! 3. **Run queries**: the free-run scan, best-fit selection and the
//!    "is the block after this file free" check used to grow files in place.

use cfs_error::{CfsError, Result};
use cfs_types::{BITMAP_WORD_BITS, FsBlock};
use serde::{Deserialize, Serialize};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Number of `u32` words needed for `count` bits.
#[must_use]
pub fn bitmap_words(count: u32) -> usize {
    count.div_ceil(BITMAP_WORD_BITS) as usize
}

/// Get bit `idx` from a word bitmap.
#[must_use]
pub fn bitmap_get(bitmap: &[u32], idx: u32) -> bool {
    let word_idx = (idx / BITMAP_WORD_BITS) as usize;
    let bit_idx = idx % BITMAP_WORD_BITS;
    bitmap
        .get(word_idx)
        .is_some_and(|word| (word >> bit_idx) & 1 == 1)
}

/// Set bit `idx` in a word bitmap.
pub fn bitmap_set(bitmap: &mut [u32], idx: u32) {
    let word_idx = (idx / BITMAP_WORD_BITS) as usize;
    if let Some(word) = bitmap.get_mut(word_idx) {
        *word |= 1 << (idx % BITMAP_WORD_BITS);
    }
}

/// Clear bit `idx` in a word bitmap.
pub fn bitmap_clear(bitmap: &mut [u32], idx: u32) {
    let word_idx = (idx / BITMAP_WORD_BITS) as usize;
    if let Some(word) = bitmap.get_mut(word_idx) {
        *word &= !(1 << (idx % BITMAP_WORD_BITS));
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u32], count: u32) -> u32 {
    let full_words = (count / BITMAP_WORD_BITS) as usize;
    let remainder = count % BITMAP_WORD_BITS;
    let mut free: u32 = bitmap.iter().take(full_words).map(|w| w.count_zeros()).sum();

    if remainder > 0 {
        if let Some(word) = bitmap.get(full_words) {
            let mask = (1_u32 << remainder) - 1;
            free += remainder - (word & mask).count_ones();
        }
    }
    free
}

// ── Free runs ───────────────────────────────────────────────────────────────

/// A maximal run of free blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeRun {
    pub start: FsBlock,
    pub len: u16,
}

impl FreeRun {
    /// One past the last block of the run.
    #[must_use]
    pub fn end(self) -> u32 {
        u32::from(self.start.0) + u32::from(self.len)
    }
}

/// Scan the first `count` bits for maximal free runs, in address order.
#[must_use]
pub fn bitmap_free_runs(bitmap: &[u32], count: u32) -> Vec<FreeRun> {
    let mut runs = Vec::new();
    let mut run_start: Option<u32> = None;
    for idx in 0..=count {
        let free = idx < count && !bitmap_get(bitmap, idx);
        match (free, run_start) {
            (true, None) => run_start = Some(idx),
            (false, Some(start)) => {
                // count fits u16 (enforced by AllocBitmap::new).
                #[expect(clippy::cast_possible_truncation)]
                runs.push(FreeRun {
                    start: FsBlock(start as u16),
                    len: (idx - start) as u16,
                });
                run_start = None;
            }
            _ => {}
        }
    }
    runs
}

/// Pick the smallest run holding at least `n` blocks; ties go to the
/// lowest address.
#[must_use]
pub fn best_fit(runs: &[FreeRun], n: u16) -> Option<FreeRun> {
    runs.iter()
        .copied()
        .filter(|run| run.len >= n)
        .min_by_key(|run| (run.len, run.start))
}

// ── Allocation bitmap ───────────────────────────────────────────────────────

/// Allocation state of every block of one filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocBitmap {
    words: Vec<u32>,
    total: u16,
}

impl AllocBitmap {
    /// Fresh bitmap with only block 0 allocated.
    pub fn new(total_blocks: u16) -> Result<Self> {
        if total_blocks < 2 {
            return Err(CfsError::InvalidArgument(format!(
                "filesystem needs at least 2 blocks, got {total_blocks}"
            )));
        }
        let mut words = vec![0_u32; bitmap_words(u32::from(total_blocks))];
        bitmap_set(&mut words, u32::from(FsBlock::TABLE.0));
        Ok(Self {
            words,
            total: total_blocks,
        })
    }

    /// Adopt persisted words. Bits past `total_blocks` are cleared.
    pub fn from_words(words: Vec<u32>, total_blocks: u16) -> Result<Self> {
        let expected = bitmap_words(u32::from(total_blocks));
        if words.len() != expected {
            return Err(CfsError::InvalidArgument(format!(
                "bitmap has {} words, expected {expected}",
                words.len()
            )));
        }
        let mut bitmap = Self {
            words,
            total: total_blocks,
        };
        for idx in u32::from(total_blocks)..(expected as u32 * BITMAP_WORD_BITS) {
            bitmap_clear(&mut bitmap.words, idx);
        }
        Ok(bitmap)
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[must_use]
    pub fn total_blocks(&self) -> u16 {
        self.total
    }

    #[must_use]
    pub fn is_allocated(&self, block: FsBlock) -> bool {
        bitmap_get(&self.words, u32::from(block.0))
    }

    fn check_range(&self, first: FsBlock, count: u16) -> Result<()> {
        let end = u32::from(first.0) + u32::from(count);
        if end > u32::from(self.total) {
            return Err(CfsError::OutOfRange(format!(
                "block range {first}+{count} exceeds {} blocks",
                self.total
            )));
        }
        Ok(())
    }

    /// Mark `count` blocks from `first` allocated. Every block must be free.
    pub fn allocate(&mut self, first: FsBlock, count: u16) -> Result<()> {
        self.check_range(first, count)?;
        let range = u32::from(first.0)..u32::from(first.0) + u32::from(count);
        if let Some(taken) = range.clone().find(|&idx| bitmap_get(&self.words, idx)) {
            return Err(CfsError::InvalidArgument(format!(
                "block {taken} is already allocated"
            )));
        }
        for idx in range {
            bitmap_set(&mut self.words, idx);
        }
        Ok(())
    }

    /// Mark `count` blocks from `first` free. Block 0 is never freed.
    pub fn free(&mut self, first: FsBlock, count: u16) -> Result<()> {
        self.check_range(first, count)?;
        for idx in u32::from(first.0)..u32::from(first.0) + u32::from(count) {
            if idx != u32::from(FsBlock::TABLE.0) {
                bitmap_clear(&mut self.words, idx);
            }
        }
        Ok(())
    }

    /// Move an allocated span of `count` blocks from `from` to `to`.
    ///
    /// The spans may overlap. Blocks of the destination not covered by the
    /// source must be free.
    pub fn relocate(&mut self, from: FsBlock, to: FsBlock, count: u16) -> Result<()> {
        self.check_range(from, count)?;
        self.check_range(to, count)?;
        let src = u32::from(from.0)..u32::from(from.0) + u32::from(count);
        let dst = u32::from(to.0)..u32::from(to.0) + u32::from(count);
        if let Some(taken) = dst
            .clone()
            .find(|idx| !src.contains(idx) && bitmap_get(&self.words, *idx))
        {
            return Err(CfsError::InvalidArgument(format!(
                "relocation target block {taken} is already allocated"
            )));
        }
        for idx in src {
            bitmap_clear(&mut self.words, idx);
        }
        for idx in dst {
            bitmap_set(&mut self.words, idx);
        }
        Ok(())
    }

    #[must_use]
    pub fn count_free(&self) -> u16 {
        // Bounded by total, which is a u16.
        #[expect(clippy::cast_possible_truncation)]
        let free = bitmap_count_free(&self.words, u32::from(self.total)) as u16;
        free
    }

    /// Maximal free runs in address order.
    #[must_use]
    pub fn free_runs(&self) -> Vec<FreeRun> {
        bitmap_free_runs(&self.words, u32::from(self.total))
    }

    /// Best-fit run of at least `n` blocks, if one exists.
    #[must_use]
    pub fn best_fit(&self, n: u16) -> Option<FreeRun> {
        best_fit(&self.free_runs(), n)
    }

    #[must_use]
    pub fn largest_free_run(&self) -> u16 {
        self.free_runs().iter().map(|run| run.len).max().unwrap_or(0)
    }

    /// Whether the block right after `[first, first + count)` exists and is free.
    #[must_use]
    pub fn next_is_free(&self, first: FsBlock, count: u16) -> bool {
        let next = u32::from(first.0) + u32::from(count);
        next < u32::from(self.total) && !bitmap_get(&self.words, next)
    }
}
