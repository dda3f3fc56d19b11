//! The filesystem's view of its device: a region of one cached device.

use crate::config::FsGeometry;
use crate::table::FsTable;
use cfs_block::{BlockCache, FlashDevice};
use cfs_error::{CfsError, Result};
use cfs_types::{DeviceId, FsBlock};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

#[derive(Debug)]
pub(crate) struct Volume {
    pub cache: Arc<BlockCache>,
    pub device: DeviceId,
    pub geometry: FsGeometry,
}

impl Volume {
    /// Raw bytes of the table region, through the cache.
    pub fn read_table(&self) -> Result<Vec<u8>> {
        let mut raw = vec![0_u8; self.geometry.table_len()];
        self.cache
            .read(self.device, self.geometry.region_offset, &mut raw)?;
        Ok(raw)
    }

    /// Write the encoded table into the cache. It reaches the device when
    /// the cache flushes it.
    pub fn write_table(&self, table: &FsTable) -> Result<()> {
        let bytes = table.encode()?;
        self.cache
            .write(self.device, self.geometry.region_offset, &bytes)?;
        debug!(target: "cfs::fs", bytes = bytes.len(), files = table.file_count(), "table_persist");
        Ok(())
    }

    /// Write the table and push it to the device immediately.
    pub fn commit_table(&self, table: &FsTable) -> Result<()> {
        self.write_table(table)?;
        self.cache.sync(false)
    }

    pub fn flash(&self) -> Result<Arc<dyn FlashDevice>> {
        self.cache.device(self.device)
    }

    /// Copy `count` blocks from `from` to `to` directly on the device, in
    /// ascending order. The cache must not hold any of these blocks.
    ///
    /// When `to` lies below `from` and the runs overlap, the copy overwrites
    /// the head of the source run. Those blocks are staged in memory first,
    /// and if a step fails they are written back (highest block first), so
    /// the source run is intact when the error is returned.
    pub fn copy_blocks(
        &self,
        flash: &dyn FlashDevice,
        from: FsBlock,
        to: FsBlock,
        count: u16,
        scratch: &mut [u8],
    ) -> Result<()> {
        let staged = self.stage_overlap(flash, from, to, count, scratch)?;
        for step in 0..count {
            if let Err(err) = self.copy_step(flash, from, to, step, scratch) {
                // Destinations to..=to+step may have been erased; the
                // staged blocks among them are the source blocks lost.
                let touched = (u32::from(to.0) + u32::from(step) + 1)
                    .saturating_sub(u32::from(from.0))
                    .min(u32::try_from(staged.len()).unwrap_or(u32::MAX));
                self.restore_staged(flash, from, &staged, touched);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Read the source blocks a downward overlapping copy will overwrite.
    fn stage_overlap(
        &self,
        flash: &dyn FlashDevice,
        from: FsBlock,
        to: FsBlock,
        count: u16,
        scratch: &mut [u8],
    ) -> Result<Vec<Vec<u8>>> {
        if to.0 >= from.0 {
            return Ok(Vec::new());
        }
        let overlap = (u32::from(to.0) + u32::from(count)).saturating_sub(u32::from(from.0));
        let mut staged = Vec::new();
        for k in 0..overlap {
            // k < count, a u16.
            #[expect(clippy::cast_possible_truncation)]
            let block = from
                .checked_add(k as u16)
                .ok_or_else(|| CfsError::OutOfRange(format!("block {from}+{k}")))?;
            self.read_block(flash, block, scratch)?;
            staged.push(scratch.to_vec());
        }
        Ok(staged)
    }

    /// Write staged blocks `from + k` for `k < touched` back, last first.
    /// Failures are logged; the caller already carries the original error.
    fn restore_staged(
        &self,
        flash: &dyn FlashDevice,
        from: FsBlock,
        staged: &[Vec<u8>],
        touched: u32,
    ) {
        for (k, data) in staged.iter().enumerate().rev() {
            let Ok(k) = u16::try_from(k) else { continue };
            if u32::from(k) >= touched {
                continue;
            }
            let Some(block) = from.checked_add(k) else { continue };
            match self.program_block(flash, block, data) {
                Ok(()) => {
                    trace!(target: "cfs::compact", block = block.0, "block_restored");
                }
                Err(err) => {
                    error!(
                        target: "cfs::compact",
                        block = block.0,
                        error = %err,
                        "block_restore_failed"
                    );
                }
            }
        }
        warn!(target: "cfs::compact", from = from.0, blocks = touched, "copy_rolled_back");
    }

    fn copy_step(
        &self,
        flash: &dyn FlashDevice,
        from: FsBlock,
        to: FsBlock,
        step: u16,
        scratch: &mut [u8],
    ) -> Result<()> {
        let src_block = from
            .checked_add(step)
            .ok_or_else(|| CfsError::OutOfRange(format!("block {from}+{step}")))?;
        let dst_block = to
            .checked_add(step)
            .ok_or_else(|| CfsError::OutOfRange(format!("block {to}+{step}")))?;
        self.read_block(flash, src_block, scratch)?;
        self.program_block(flash, dst_block, scratch)?;
        trace!(target: "cfs::compact", from = src_block.0, to = dst_block.0, "block_copy");
        Ok(())
    }

    fn read_block(&self, flash: &dyn FlashDevice, block: FsBlock, buf: &mut [u8]) -> Result<()> {
        let at = self.geometry.block_offset(block)?;
        let got = flash.read(at, buf)?;
        if got != buf.len() {
            return Err(CfsError::DeviceIo(format!(
                "short read of block {block}: {got}/{} bytes",
                buf.len()
            )));
        }
        Ok(())
    }

    fn program_block(&self, flash: &dyn FlashDevice, block: FsBlock, data: &[u8]) -> Result<()> {
        let at = self.geometry.block_offset(block)?;
        flash.erase(at, self.geometry.block_size.as_u64())?;
        let put = flash.write(at, data)?;
        if put != data.len() {
            return Err(CfsError::DeviceIo(format!(
                "short program of block {block}: {put}/{} bytes",
                data.len()
            )));
        }
        Ok(())
    }
}
