//! Free-space tracking for the whole medium, one entry per block.

use tracing::trace;

/// Allocation state of every block on the medium. Blocks are fixed-size and
/// addressed purely by index, so there is no coalescing or best-fit logic;
/// allocation is a first-fit scan from block 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    entries: Vec<bool>,
    allocated: u64,
}

impl BlockMap {
    /// Bytes one entry occupies on disk. The map is persisted as one
    /// little-endian `u32` per block (0 = free, nonzero = allocated),
    /// keeping the integer-per-block layout instead of a packed bitmask.
    pub const ENTRY_SIZE: usize = 4;

    /// A map with every block free.
    pub fn new(total_blocks: u64) -> BlockMap {
        BlockMap {
            entries: vec![false; total_blocks as usize],
            allocated: 0,
        }
    }

    pub fn total_blocks(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.allocated
    }

    pub fn free_blocks(&self) -> u64 {
        self.total_blocks() - self.allocated
    }

    pub fn is_allocated(&self, block: u64) -> bool {
        self.entries[block as usize]
    }

    pub fn mark_allocated(&mut self, block: u64) {
        debug_assert!(
            !self.entries[block as usize],
            "block {block} is already allocated"
        );
        self.entries[block as usize] = true;
        self.allocated += 1;
    }

    /// Hand a single block back. Releasing a block that is not allocated is
    /// a caller bug.
    pub fn release(&mut self, block: u64) {
        debug_assert!(
            self.entries[block as usize],
            "block {block} is already free"
        );
        self.entries[block as usize] = false;
        self.allocated -= 1;
    }

    /// The ascending indices of the first `count` free blocks, scanning from
    /// block 0, each marked allocated. Returns `None` without touching any
    /// state if fewer than `count` blocks are free anywhere on the medium.
    pub fn allocate(&mut self, count: usize) -> Option<Vec<u64>> {
        let mut found = Vec::with_capacity(count);
        for (block, allocated) in self.entries.iter().copied().enumerate() {
            if found.len() == count {
                break;
            }
            if !allocated {
                found.push(block as u64);
            }
        }
        if found.len() < count {
            return None;
        }
        for &block in &found {
            self.mark_allocated(block);
        }
        trace!("allocated {count} blocks: {found:?}");
        Some(found)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.entries.len() * Self::ENTRY_SIZE);
        for &allocated in &self.entries {
            bytes.extend_from_slice(&(allocated as u32).to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8], total_blocks: u64) -> BlockMap {
        let mut map = BlockMap::new(total_blocks);
        for block in 0..total_blocks as usize {
            let offset = block * Self::ENTRY_SIZE;
            let word = u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap());
            if word != 0 {
                map.mark_allocated(block as u64);
            }
        }
        map
    }
}
