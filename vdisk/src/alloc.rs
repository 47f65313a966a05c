use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::ops::Range;

use log::debug;

use crate::fs::FsError;
use crate::node::NodeId;

/// The block number to access ranging from 0 (the first block) to n - 1 (the last
/// block) where n is number of blocks on the volume.
pub type BlockNumber = u32;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// A run of consecutive blocks owned by a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub start_block: BlockNumber,
    pub block_count: u32,
}

impl BlockRange {
    pub fn new(start_block: BlockNumber, block_count: u32) -> Self {
        Self {
            start_block,
            block_count,
        }
    }

    /// One past the last block of the range. Widened so a corrupt range can't overflow.
    pub fn end_block(&self) -> u64 {
        u64::from(self.start_block) + u64::from(self.block_count)
    }

    /// Callers must have checked the range against the bitmap length first.
    pub(crate) fn blocks(&self) -> Range<BlockNumber> {
        self.start_block..self.start_block + self.block_count
    }
}

/// Tracks one bit per block on the volume, packed into 64 bit words. Bits past
/// `len` in the final word are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    len: u32,
}

fn words_for(len: u32) -> usize {
    (len as usize + 63) / 64
}

impl Bitmap {
    pub fn new(len: u32) -> Self {
        Self {
            bitmap: vec![0; words_for(len)],
            len,
        }
    }

    /// Rebuilds a bitmap from its packed words. Returns `None` if the word count
    /// doesn't match `len` or a bit beyond the last block is set.
    pub(crate) fn from_words(words: Vec<u64>, len: u32) -> Option<Self> {
        if words.len() != words_for(len) {
            return None;
        }
        let tail = len % 64;
        if let Some(last) = words.last() {
            if tail != 0 && last >> tail != 0 {
                return None;
            }
        }
        Some(Self { bitmap: words, len })
    }

    pub fn words(&self) -> &[u64] {
        &self.bitmap
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, blocknr: BlockNumber) -> State {
        assert!(blocknr < self.len, "block {} out of range", blocknr);
        // Grab the u64 containing the significant bit.
        let outer_offset = self.bitmap[(blocknr / 64) as usize];

        let inner_offset = blocknr % 64;
        let mask = 0b01_u64 << inner_offset;
        let block_state = (outer_offset & mask) >> inner_offset;
        match block_state {
            0 => State::Free,
            1 => State::Used,
            _ => unreachable!("Block state returned a non 0 or 1 value. This likely indicates an error with bitmasking"),
        }
    }

    pub fn set_reserved(&mut self, blocknr: BlockNumber) {
        assert!(blocknr < self.len, "block {} out of range", blocknr);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[(blocknr / 64) as usize] |= mask;
    }

    pub fn set_free(&mut self, blocknr: BlockNumber) {
        assert!(blocknr < self.len, "block {} out of range", blocknr);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[(blocknr / 64) as usize] &= !mask;
    }

    pub fn count_used(&self) -> u32 {
        self.bitmap.iter().map(|word| word.count_ones()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = State> + '_ {
        (0..self.len).map(move |blocknr| self.get(blocknr))
    }
}

/// Space accounting for the whole volume, recomputed from the bitmap on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_blocks: u32,
    pub used_blocks: u32,
    pub free_blocks: u32,
    pub block_size: u32,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn percent_used(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        f64::from(self.used_blocks) * 100.0 / f64::from(self.total_blocks)
    }
}

/// Hands out contiguous block ranges with a first-fit scan of the bitmap.
///
/// The scan walks the bitmap from block 0 and takes the first run of free blocks
/// long enough for the request. No compaction or best-fit search is attempted, so
/// a request can fail while the total number of free blocks would cover it. That
/// fragmentation is part of the observable behavior of the volume.
///
/// Ranges are recorded in a table keyed by the owning file's node id. The id is
/// stable for the life of the file, so renames and moves never touch the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocator {
    block_size: u32,
    bitmap: Bitmap,
    table: BTreeMap<NodeId, BlockRange>,
}

impl BlockAllocator {
    pub fn new(total_blocks: u32, block_size: u32) -> Self {
        Self {
            block_size,
            bitmap: Bitmap::new(total_blocks),
            table: BTreeMap::new(),
        }
    }

    pub(crate) fn from_parts(
        block_size: u32,
        bitmap: Bitmap,
        table: BTreeMap<NodeId, BlockRange>,
    ) -> Self {
        Self {
            block_size,
            bitmap,
            table,
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.bitmap.len()
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    pub fn table(&self) -> &BTreeMap<NodeId, BlockRange> {
        &self.table
    }

    pub fn allocation(&self, id: NodeId) -> Option<BlockRange> {
        self.table.get(&id).copied()
    }

    /// Number of blocks a file of `size_bytes` occupies, rounded up.
    pub fn blocks_for(&self, size_bytes: u64) -> u64 {
        let block_size = u64::from(self.block_size);
        size_bytes / block_size + u64::from(size_bytes % block_size != 0)
    }

    fn blocks_needed(&self, size_bytes: u64) -> Result<u32, FsError> {
        let requested = self.blocks_for(size_bytes);
        u32::try_from(requested).map_err(|_| FsError::OutOfSpace { requested })
    }

    /// Claims the first run of `num_blocks` free blocks. A zero block request
    /// returns an empty range at block 0 and leaves the bitmap alone.
    pub fn allocate(&mut self, num_blocks: u32) -> Result<BlockRange, FsError> {
        if num_blocks == 0 {
            return Ok(BlockRange::new(0, 0));
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for blocknr in 0..self.bitmap.len() {
            if let State::Used = self.bitmap.get(blocknr) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = blocknr;
            }
            run_len += 1;
            if run_len == num_blocks {
                let range = BlockRange::new(run_start, num_blocks);
                self.mark_used(range);
                debug!(
                    "Allocated blocks {}..{} ({} blocks).",
                    range.start_block,
                    range.end_block(),
                    num_blocks
                );
                return Ok(range);
            }
        }

        debug!("No free run of {} blocks.", num_blocks);
        Err(FsError::OutOfSpace {
            requested: u64::from(num_blocks),
        })
    }

    /// Clears every block in `range`. Blocks past the end of the volume and
    /// blocks that are already free are skipped.
    pub fn free(&mut self, range: BlockRange) {
        let end = range.end_block().min(u64::from(self.bitmap.len()));
        for blocknr in u64::from(range.start_block)..end {
            self.bitmap.set_free(blocknr as BlockNumber);
        }
    }

    fn mark_used(&mut self, range: BlockRange) {
        for blocknr in range.blocks() {
            self.bitmap.set_reserved(blocknr);
        }
    }

    /// Allocates enough blocks to hold `size_bytes` and records them for `id`.
    /// Nothing changes when the allocation fails.
    pub fn allocate_file(&mut self, id: NodeId, size_bytes: u64) -> Result<BlockRange, FsError> {
        if self.table.contains_key(&id) {
            return Err(FsError::InvalidArgument(format!(
                "file {} already has an allocation",
                id
            )));
        }
        let num_blocks = self.blocks_needed(size_bytes)?;
        let range = self.allocate(num_blocks)?;
        self.table.insert(id, range);
        Ok(range)
    }

    pub fn deallocate_file(&mut self, id: NodeId) -> Result<BlockRange, FsError> {
        let range = self.table.remove(&id).ok_or(FsError::NotAllocated(id))?;
        self.free(range);
        debug!("Released blocks {}..{} of file {}.", range.start_block, range.end_block(), id);
        Ok(range)
    }

    /// Moves `id` to a first-fit range sized for `size_bytes`. The old range is
    /// released before the scan so the file may grow in place. On failure the
    /// old range is claimed again and the table is left as it was.
    pub fn reallocate_file(&mut self, id: NodeId, size_bytes: u64) -> Result<BlockRange, FsError> {
        let old = self.allocation(id).ok_or(FsError::NotAllocated(id))?;
        let num_blocks = self.blocks_needed(size_bytes)?;

        self.free(old);
        match self.allocate(num_blocks) {
            Ok(range) => {
                self.table.insert(id, range);
                Ok(range)
            }
            Err(err) => {
                // Nothing ran between the free and the failed scan, the old run is still clear.
                self.mark_used(old);
                Err(err)
            }
        }
    }

    pub fn usage(&self) -> DiskUsage {
        let total_blocks = self.bitmap.len();
        let used_blocks = self.bitmap.count_used();
        let free_blocks = total_blocks - used_blocks;
        let block_size = u64::from(self.block_size);
        DiskUsage {
            total_blocks,
            used_blocks,
            free_blocks,
            block_size: self.block_size,
            total_bytes: u64::from(total_blocks) * block_size,
            used_bytes: u64::from(used_blocks) * block_size,
            free_bytes: u64::from(free_blocks) * block_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with(pattern: &[State]) -> BlockAllocator {
        let mut alloc = BlockAllocator::new(pattern.len() as u32, 512);
        for (blocknr, state) in pattern.iter().enumerate() {
            if *state == State::Used {
                alloc.bitmap.set_reserved(blocknr as u32);
            }
        }
        alloc
    }

    fn id(raw: u32) -> NodeId {
        NodeId::from_raw(raw)
    }

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new(128);

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new(4096);

        bmp.set_reserved(0);
        bmp.set_reserved(4095);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(4095), State::Used);
        assert_eq!(bmp.count_used(), 2);
    }

    #[test]
    fn can_toggle_block_between_free_and_used() {
        let mut bmp = Bitmap::new(64);

        bmp.set_reserved(10);
        bmp.set_reserved(11);
        assert_eq!(bmp.get(10), State::Used);

        bmp.set_free(10);
        assert_eq!(bmp.get(10), State::Free);
        // Neighbouring bits in the same word survive.
        assert_eq!(bmp.get(11), State::Used);
    }

    #[test]
    fn bitmap_rejects_bits_past_its_length() {
        assert!(Bitmap::from_words(vec![0b1000], 3).is_none());
        assert!(Bitmap::from_words(vec![0b0100], 3).is_some());
        assert!(Bitmap::from_words(vec![0, 0], 64).is_none());
    }

    #[test]
    fn first_fit_skips_runs_that_are_too_short() {
        use State::*;
        let mut alloc = allocator_with(&[Free, Free, Used, Free, Free, Free]);

        let range = alloc.allocate(3).unwrap();

        assert_eq!(range, BlockRange::new(3, 3));
        assert_eq!(alloc.usage().used_blocks, 4);
    }

    #[test]
    fn first_fit_takes_the_earliest_run() {
        use State::*;
        let mut alloc = allocator_with(&[Used, Free, Free, Used, Free, Free]);

        assert_eq!(alloc.allocate(2).unwrap(), BlockRange::new(1, 2));
        assert_eq!(alloc.allocate(1).unwrap(), BlockRange::new(4, 1));
    }

    #[test]
    fn fragmented_free_space_is_out_of_space() {
        use State::*;
        let mut alloc = allocator_with(&[Used, Free, Used, Free]);
        let before = alloc.clone();

        match alloc.allocate(2) {
            Err(FsError::OutOfSpace { requested: 2 }) => (),
            other => panic!("expected out of space, got {:?}", other),
        }
        assert_eq!(alloc.usage().free_blocks, 2);
        assert_eq!(alloc, before);
    }

    #[test]
    fn allocate_zero_blocks_touches_nothing() {
        use State::*;
        let mut alloc = allocator_with(&[Used, Used]);

        assert_eq!(alloc.allocate(0).unwrap(), BlockRange::new(0, 0));
        assert_eq!(alloc.usage().used_blocks, 2);
    }

    #[test]
    fn free_tolerates_free_and_out_of_range_blocks() {
        use State::*;
        let mut alloc = allocator_with(&[Used, Free, Used, Used]);

        alloc.free(BlockRange::new(1, 10));
        alloc.free(BlockRange::new(2, 2));

        assert_eq!(alloc.bitmap().get(0), State::Used);
        assert_eq!(alloc.usage().used_blocks, 1);
    }

    #[test]
    fn allocate_file_rounds_up_to_whole_blocks() {
        let mut alloc = BlockAllocator::new(16, 512);

        assert_eq!(alloc.allocate_file(id(1), 1).unwrap(), BlockRange::new(0, 1));
        assert_eq!(alloc.allocate_file(id(2), 512).unwrap(), BlockRange::new(1, 1));
        assert_eq!(alloc.allocate_file(id(3), 1000).unwrap(), BlockRange::new(2, 2));
        assert_eq!(alloc.allocate_file(id(4), 1025).unwrap(), BlockRange::new(4, 3));

        let usage = alloc.usage();
        let summed: u32 = alloc.table().values().map(|r| r.block_count).sum();
        assert_eq!(usage.used_blocks, summed);
        assert_eq!(usage.used_bytes, 7 * 512);
    }

    #[test]
    fn failed_allocate_file_leaves_no_trace() {
        let mut alloc = BlockAllocator::new(4, 512);
        alloc.allocate_file(id(1), 1024).unwrap();
        let before = alloc.clone();

        assert!(alloc.allocate_file(id(2), 3 * 512).is_err());
        assert!(alloc.allocate_file(id(3), u64::MAX).is_err());
        assert_eq!(alloc, before);
        assert!(alloc.allocation(id(2)).is_none());
    }

    #[test]
    fn deallocate_unknown_file_is_not_allocated() {
        let mut alloc = BlockAllocator::new(4, 512);

        match alloc.deallocate_file(id(9)) {
            Err(FsError::NotAllocated(missing)) => assert_eq!(missing, id(9)),
            other => panic!("expected not allocated, got {:?}", other),
        }
    }

    #[test]
    fn deallocate_releases_range_for_reuse() {
        let mut alloc = BlockAllocator::new(8, 512);
        alloc.allocate_file(id(1), 1024).unwrap();
        alloc.allocate_file(id(2), 1024).unwrap();

        assert_eq!(alloc.deallocate_file(id(1)).unwrap(), BlockRange::new(0, 2));
        assert_eq!(alloc.allocate_file(id(3), 512).unwrap(), BlockRange::new(0, 1));
        assert_eq!(alloc.usage().used_blocks, 3);
    }

    #[test]
    fn reallocate_grows_in_place_when_followed_by_free_space() {
        let mut alloc = BlockAllocator::new(8, 512);
        alloc.allocate_file(id(1), 512).unwrap();

        assert_eq!(alloc.reallocate_file(id(1), 2048).unwrap(), BlockRange::new(0, 4));
        assert_eq!(alloc.usage().used_blocks, 4);
    }

    #[test]
    fn failed_reallocate_restores_old_range() {
        let mut alloc = BlockAllocator::new(4, 512);
        alloc.allocate_file(id(1), 512).unwrap();
        alloc.allocate_file(id(2), 512).unwrap();
        let before = alloc.clone();

        assert!(alloc.reallocate_file(id(2), 4 * 512).is_err());
        assert_eq!(alloc, before);
    }
}
