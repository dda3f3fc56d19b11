//! In-memory File Table: allocation bitmap plus entry slots.
//!
//! The in-memory form differs from the persisted one in a single way:
//! entries carry a pending reservation (`reserved`) whose blocks are set in
//! the bitmap here but cleared in the encoded table.

use crate::config::FsGeometry;
use cfs_alloc::AllocBitmap;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{FileTable, RawEntry};
use cfs_types::{FsBlock, ParseError, encode_name};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub name: String,
    pub size: u32,
    pub first: u16,
    pub count: u16,
    pub reserved: u16,
}

impl Entry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            size: 0,
            first: 0,
            count: 0,
            reserved: 0,
        }
    }

    /// Blocks owned, consumed or not.
    pub fn span(&self) -> u16 {
        self.count + self.reserved
    }

    pub fn span_end(&self) -> u32 {
        u32::from(self.first) + u32::from(self.span())
    }

    pub fn clear_blocks(&mut self) {
        self.first = 0;
        self.count = 0;
        self.reserved = 0;
    }
}

/// Map a parse failure of the table block to `Corruption`.
pub(crate) fn parse_error_to_cfs(err: &ParseError) -> CfsError {
    CfsError::Corruption {
        block: u64::from(FsBlock::TABLE.0),
        detail: err.to_string(),
    }
}

fn corruption(detail: String) -> CfsError {
    CfsError::Corruption {
        block: u64::from(FsBlock::TABLE.0),
        detail,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FsTable {
    pub bitmap: AllocBitmap,
    pub entries: Vec<Option<Entry>>,
}

impl FsTable {
    pub fn empty(geometry: &FsGeometry) -> Result<Self> {
        Ok(Self {
            bitmap: AllocBitmap::new(geometry.total_blocks)?,
            entries: vec![None; usize::from(geometry.max_files)],
        })
    }

    /// Build the in-memory table from a decoded one.
    ///
    /// Out-of-range and overlapping runs are rejected. Bitmap bits that
    /// disagree with the entries are repaired; the returned flag reports
    /// whether anything was repaired.
    pub fn from_disk(disk: &FileTable, geometry: &FsGeometry) -> Result<(Self, bool)> {
        let mut table = Self {
            bitmap: AllocBitmap::from_words(disk.bitmap.clone(), geometry.total_blocks)
                .map_err(|err| corruption(err.to_string()))?,
            entries: vec![None; usize::from(geometry.max_files)],
        };

        for (slot, raw) in disk.entries.iter().enumerate() {
            if !raw.in_use || slot >= table.entries.len() {
                continue;
            }
            let name = raw.name_str();
            if encode_name(&name).is_none() {
                return Err(corruption(format!("entry {slot} has an invalid name")));
            }
            if !raw.checksum_ok() {
                warn!(target: "cfs::fs", slot, name = %name, "entry_checksum_mismatch");
            }
            let mut entry = Entry::new(&name);
            entry.size = raw.size;
            if raw.block_count > 0 {
                if raw.first_block == 0 {
                    return Err(corruption(format!("entry {slot} ({name}) starts at block 0")));
                }
                if raw.end_block() > u32::from(geometry.total_blocks) {
                    return Err(corruption(format!(
                        "entry {slot} ({name}) run {}+{} exceeds {} blocks",
                        raw.first_block, raw.block_count, geometry.total_blocks
                    )));
                }
                entry.first = raw.first_block;
                entry.count = raw.block_count;
            }
            if u64::from(entry.size) > geometry.bytes_of(entry.count) {
                return Err(corruption(format!(
                    "entry {slot} ({name}) size {} exceeds its {} blocks",
                    entry.size, entry.count
                )));
            }
            table.entries[slot] = Some(entry);
        }

        table.check_disjoint()?;
        let repaired = table.repair_bitmap();
        Ok((table, repaired))
    }

    /// Encoded form, with pending reservations left out.
    pub fn to_disk(&self) -> Result<FileTable> {
        let mut bitmap = self.bitmap.clone();
        let mut entries = vec![RawEntry::EMPTY; self.entries.len()];
        for (slot, entry) in self.entries.iter().enumerate() {
            let Some(entry) = entry else { continue };
            if entry.reserved > 0 {
                bitmap.free(FsBlock(entry.first + entry.count), entry.reserved)?;
            }
            let name = encode_name(&entry.name).ok_or_else(|| {
                CfsError::InvalidArgument(format!("entry {slot} has an invalid name"))
            })?;
            entries[slot] = RawEntry {
                name,
                size: entry.size,
                first_block: if entry.count > 0 { entry.first } else { 0 },
                block_count: entry.count,
                in_use: true,
                checksum: 0,
            }
            .sealed();
        }
        Ok(FileTable {
            bitmap: bitmap.words().to_vec(),
            entries,
            table_crc: 0,
            file_count: 0,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_disk()?.encode().map_err(|err| parse_error_to_cfs(&err))
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.as_ref().is_some_and(|e| e.name == name))
    }

    pub fn free_slot(&self) -> Option<usize> {
        self.entries.iter().position(Option::is_none)
    }

    pub fn entry(&self, idx: usize) -> Result<&Entry> {
        self.entries
            .get(idx)
            .and_then(Option::as_ref)
            .ok_or_else(|| CfsError::NotFound(format!("entry slot {idx}")))
    }

    pub fn entry_mut(&mut self, idx: usize) -> Result<&mut Entry> {
        self.entries
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or_else(|| CfsError::NotFound(format!("entry slot {idx}")))
    }

    /// Slot whose span contains `block`.
    pub fn owner_of(&self, block: u16) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.as_ref().is_some_and(|e| {
                e.span() > 0 && e.first <= block && u32::from(block) < e.span_end()
            })
        })
    }

    /// Free every block of `idx` and truncate it to zero bytes.
    pub fn release_blocks(&mut self, idx: usize) -> Result<()> {
        let entry = self.entry(idx)?;
        let (first, span) = (entry.first, entry.span());
        if span > 0 {
            self.bitmap.free(FsBlock(first), span)?;
        }
        let entry = self.entry_mut(idx)?;
        entry.clear_blocks();
        entry.size = 0;
        Ok(())
    }

    /// Number of in-use entries.
    pub fn file_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_some()).count()
    }

    fn spans(&self) -> Vec<(usize, u16, u32)> {
        let mut spans: Vec<(usize, u16, u32)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| {
                entry
                    .as_ref()
                    .filter(|e| e.span() > 0)
                    .map(|e| (slot, e.first, e.span_end()))
            })
            .collect();
        spans.sort_by_key(|&(_, first, _)| first);
        spans
    }

    fn check_disjoint(&self) -> Result<()> {
        let spans = self.spans();
        for pair in spans.windows(2) {
            let (left, _, left_end) = pair[0];
            let (right, right_first, _) = pair[1];
            if left_end > u32::from(right_first) {
                return Err(corruption(format!("entry {right} overlaps entry {left}")));
            }
        }
        Ok(())
    }

    /// Make the bitmap match the entries exactly. Returns true if any bit
    /// changed.
    fn repair_bitmap(&mut self) -> bool {
        let mut expected = vec![false; usize::from(self.bitmap.total_blocks())];
        expected[0] = true;
        for (_, first, end) in self.spans() {
            for block in u32::from(first)..end {
                expected[block as usize] = true;
            }
        }

        let mut repaired = false;
        for (block, want) in expected.into_iter().enumerate() {
            // `block` is below total_blocks, a u16.
            #[expect(clippy::cast_possible_truncation)]
            let block = FsBlock(block as u16);
            let have = self.bitmap.is_allocated(block);
            if have == want {
                continue;
            }
            repaired = true;
            warn!(
                target: "cfs::fs",
                block = block.0,
                allocated = have,
                owned = want,
                "bitmap_repaired"
            );
            let result = if want {
                self.bitmap.allocate(block, 1)
            } else {
                self.bitmap.free(block, 1)
            };
            if let Err(err) = result {
                warn!(target: "cfs::fs", block = block.0, error = %err, "bitmap_repair_failed");
            }
        }
        repaired
    }

    /// Verify the allocation invariant: block 0 reserved, every span inside
    /// the region, spans pairwise disjoint, and the bitmap set exactly on
    /// block 0 plus the spans.
    pub fn check(&self, geometry: &FsGeometry) -> Result<()> {
        if !self.bitmap.is_allocated(FsBlock::TABLE) {
            return Err(corruption("block 0 is not reserved".to_owned()));
        }
        let spans = self.spans();
        let mut owned = 1_u32;
        for &(slot, first, end) in &spans {
            if first == 0 || end > u32::from(geometry.total_blocks) {
                return Err(corruption(format!(
                    "entry {slot} span {first}..{end} is outside the region"
                )));
            }
            for block in u32::from(first)..end {
                #[expect(clippy::cast_possible_truncation)]
                let block = FsBlock(block as u16);
                if !self.bitmap.is_allocated(block) {
                    return Err(CfsError::Corruption {
                        block: u64::from(block.0),
                        detail: format!("block of entry {slot} is free in the bitmap"),
                    });
                }
            }
            owned += end - u32::from(first);
        }
        self.check_disjoint()?;

        let allocated =
            u32::from(geometry.total_blocks) - u32::from(self.bitmap.count_free());
        if allocated != owned {
            return Err(corruption(format!(
                "bitmap marks {allocated} blocks allocated but entries own {owned}"
            )));
        }

        for (slot, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                if u64::from(entry.size) > geometry.bytes_of(entry.count) {
                    return Err(corruption(format!(
                        "entry {slot} size {} exceeds its {} blocks",
                        entry.size, entry.count
                    )));
                }
            }
        }
        Ok(())
    }
}
