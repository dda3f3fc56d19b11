//! Free-run selection and online compaction.
//!
//! A request for `n` contiguous blocks is served in three steps:
//!
//! 1. Scan the bitmap once for maximal free runs.
//! 2. Best fit: the smallest run with at least `n` blocks wins, nothing
//!    moves.
//! 3. Otherwise, if the free blocks add up to `n`, compact: walk the runs
//!    left to right, sliding every file that sits between the accumulated
//!    hole and the next run down by the hole's length. The next run then
//!    merges into the hole. Stop as soon as the hole holds `n` blocks.
//!
//! Compaction writes the device directly, so it first flushes and
//! invalidates the whole cache. After each file move the bitmap and the
//! entry are updated and the table is committed, so a failure leaves the
//! table describing only files whose copy completed. A slide that fails
//! part-way writes back the source blocks it had already overwritten, so
//! the file being moved keeps its old run and contents.

use crate::table::FsTable;
use crate::volume::Volume;
use cfs_alloc::{FreeRun, best_fit};
use cfs_block::FlashDevice;
use cfs_error::{CfsError, Result};
use cfs_types::FsBlock;
use tracing::{debug, info};

fn free_total(runs: &[FreeRun]) -> u32 {
    runs.iter().map(|run| u32::from(run.len)).sum()
}

fn scratch_for(volume: &Volume) -> Result<Vec<u8>> {
    let len = usize::try_from(volume.geometry.block_size.get())
        .map_err(|_| CfsError::OutOfRange("block size does not fit usize".to_owned()))?;
    Ok(vec![0_u8; len])
}

/// First block of a free run of at least `n` blocks, compacting if no
/// single run is large enough. Nothing is allocated.
pub(crate) fn find_run(volume: &Volume, table: &mut FsTable, n: u16) -> Result<FsBlock> {
    let runs = table.bitmap.free_runs();
    if let Some(fit) = best_fit(&runs, n) {
        debug!(
            target: "cfs::compact",
            requested = n,
            start = fit.start.0,
            run = fit.len,
            "best_fit"
        );
        return Ok(fit.start);
    }
    let free = free_total(&runs);
    if free < u32::from(n) {
        debug!(target: "cfs::compact", requested = n, free, "no_space");
        return Err(CfsError::OutOfSpace);
    }
    compact(volume, table, &runs, n)
}

fn compact(volume: &Volume, table: &mut FsTable, runs: &[FreeRun], n: u16) -> Result<FsBlock> {
    let Some((&first_run, rest)) = runs.split_first() else {
        return Err(CfsError::OutOfSpace);
    };
    info!(
        target: "cfs::compact",
        requested = n,
        runs = runs.len(),
        free = free_total(runs),
        "compaction_start"
    );

    volume.cache.sync(true)?;
    let flash = volume.flash()?;
    let mut scratch = scratch_for(volume)?;

    let mut hole = first_run;
    for next in rest {
        shift_region(volume, flash.as_ref(), table, hole, next.start, &mut scratch)?;
        hole = FreeRun {
            start: FsBlock(next.start.0 - hole.len),
            len: hole.len + next.len,
        };
        if hole.len >= n {
            info!(
                target: "cfs::compact",
                start = hole.start.0,
                len = hole.len,
                "compaction_done"
            );
            return Ok(hole.start);
        }
    }
    Err(CfsError::OutOfSpace)
}

/// Slide every file in `[hole.end, region_end)` down by `hole.len`, in
/// address order.
fn shift_region(
    volume: &Volume,
    flash: &dyn FlashDevice,
    table: &mut FsTable,
    hole: FreeRun,
    region_end: FsBlock,
    scratch: &mut [u8],
) -> Result<()> {
    let mut at = u32::from(hole.start.0) + u32::from(hole.len);
    while at < u32::from(region_end.0) {
        // at < region_end, a u16.
        #[expect(clippy::cast_possible_truncation)]
        let block = at as u16;
        let idx = table.owner_of(block).ok_or_else(|| CfsError::Corruption {
            block: u64::from(block),
            detail: "allocated block has no owning file".to_owned(),
        })?;
        let entry = table.entry(idx)?;
        if entry.first != block {
            return Err(CfsError::Corruption {
                block: u64::from(block),
                detail: format!("entry {idx} starts inside a free run"),
            });
        }
        let span = entry.span();
        relocate(volume, flash, table, idx, FsBlock(block - hole.len), scratch)?;
        at += u32::from(span);
    }
    Ok(())
}

/// Move file `idx` so its run starts at `to`, then commit the table.
///
/// Only consumed blocks are copied; the pending reservation moves with the
/// run in the bitmap.
fn relocate(
    volume: &Volume,
    flash: &dyn FlashDevice,
    table: &mut FsTable,
    idx: usize,
    to: FsBlock,
    scratch: &mut [u8],
) -> Result<()> {
    let entry = table.entry(idx)?;
    let (from, count, span) = (FsBlock(entry.first), entry.count, entry.span());
    volume.copy_blocks(flash, from, to, count, scratch)?;
    table.bitmap.relocate(from, to, span)?;
    table.entry_mut(idx)?.first = to.0;
    volume.commit_table(table)?;
    debug!(
        target: "cfs::compact",
        slot = idx,
        from = from.0,
        to = to.0,
        blocks = count,
        "file_relocated"
    );
    Ok(())
}

/// Move file `idx` into the free run starting at `to` so it can grow there.
pub(crate) fn move_file(volume: &Volume, table: &mut FsTable, idx: usize, to: FsBlock) -> Result<()> {
    volume.cache.sync(true)?;
    let flash = volume.flash()?;
    let mut scratch = scratch_for(volume)?;
    relocate(volume, flash.as_ref(), table, idx, to, &mut scratch)
}

/// Gather all free space into a single run. Returns whether anything moved.
pub(crate) fn defragment(volume: &Volume, table: &mut FsTable) -> Result<bool> {
    let runs = table.bitmap.free_runs();
    if runs.len() < 2 {
        return Ok(false);
    }
    // Free blocks never exceed total_blocks, a u16.
    #[expect(clippy::cast_possible_truncation)]
    let free = free_total(&runs) as u16;
    compact(volume, table, &runs, free)?;
    Ok(true)
}
