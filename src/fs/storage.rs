//! This module implements storage on an underlying block device: the
//! device trait, the superblock record, the reserved-region layout, and
//! block allocation in data-region coordinates.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use packed_struct::prelude::*;
use tracing::{debug, trace};

use super::blockmap::BlockMap;
use super::inode::{InodeTable, INODE_DISK_SIZE};
use super::{FsError, Result};

/// Trait that abstracts out a block device. The crate ships a file backing
/// (`container::DiskFile`); tests or embedders may substitute their own.
pub trait BlockIO {
    /// Error type returned from the IO methods.
    type IoError: std::error::Error + Send + Sync + 'static;
    /// The total amount of blocks available to do IO.
    fn block_count(&self) -> usize;
    /// The size of a single block. It is required all blocks are the same
    /// size.
    fn block_size(&self) -> usize;
    /// Read a single block at offset `block_number` (starting at 0) into
    /// the `block` argument (must be at least `block_size` long).
    fn read_block(
        &mut self,
        block_number: u64,
        block: &mut [u8],
    ) -> std::result::Result<(), Self::IoError>;
    /// Write a single `block` at offset `block_number` (starting at 0).
    /// The `block` argument must be at least `block_size` long.
    fn write_block(
        &mut self,
        block_number: u64,
        block: &[u8],
    ) -> std::result::Result<(), Self::IoError>;
    /// Push outstanding writes down to the medium.
    fn flush(&mut self) -> std::result::Result<(), Self::IoError>;
}

pub const FS_MAGIC: [u8; 8] = *b"BLOCKFS1";

/// Global filesystem metadata, stored in block 0.
#[derive(PackedStruct, Debug, Clone, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct Superblock {
    pub magic: [u8; 8],
    pub total_blocks: u64,
    pub block_size: u32,
    pub free_blocks: u64,
    pub max_inodes: u32,
    pub used_inodes: u32,
    /// First block past the reserved region. Recorded for diagnostics;
    /// allocation never consults it.
    pub first_free_block: u64,
}

impl Superblock {
    pub const DISK_SIZE: usize = 44;

    /// Read and validate the superblock of an image file without knowing
    /// its block size: the record always sits at byte offset 0.
    pub fn probe(path: impl AsRef<Path>) -> Result<Superblock> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; Superblock::DISK_SIZE];
        file.read_exact(&mut buf)?;
        let superblock =
            Superblock::unpack_from_slice(&buf).map_err(|_| FsError::InvalidSuperblock)?;
        if superblock.magic != FS_MAGIC {
            return Err(FsError::InvalidSuperblock);
        }
        Ok(superblock)
    }
}

/// Where each on-disk region lives. Block 0 holds the superblock, the free
/// map and inode table follow, and everything after `data_start` is file
/// data addressed relative to the region start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskLayout {
    pub total_blocks: u64,
    pub block_size: usize,
    pub max_inodes: u32,
    pub map_start: u64,
    pub map_blocks: u64,
    pub table_start: u64,
    pub table_blocks: u64,
    pub data_start: u64,
}

impl DiskLayout {
    pub const MIN_BLOCK_SIZE: usize = 128;

    pub fn compute(total_blocks: u64, block_size: usize, max_inodes: u32) -> Result<DiskLayout> {
        if block_size < Self::MIN_BLOCK_SIZE {
            return Err(FsError::InvalidBlockSize(block_size));
        }
        let map_bytes = total_blocks * BlockMap::ENTRY_SIZE as u64;
        let map_blocks = map_bytes.div_ceil(block_size as u64);
        let table_bytes = max_inodes as u64 * INODE_DISK_SIZE as u64;
        let table_blocks = table_bytes.div_ceil(block_size as u64);
        let data_start = 1 + map_blocks + table_blocks;
        if data_start >= total_blocks {
            return Err(FsError::DeviceTooSmall {
                needed: data_start + 1,
                available: total_blocks,
            });
        }
        Ok(DiskLayout {
            total_blocks,
            block_size,
            max_inodes,
            map_start: 1,
            map_blocks,
            table_start: 1 + map_blocks,
            table_blocks,
            data_start,
        })
    }

    /// Blocks taken by the superblock, free map, and inode table.
    pub fn reserved_blocks(&self) -> u64 {
        self.data_start
    }

    pub fn data_blocks(&self) -> u64 {
        self.total_blocks - self.data_start
    }
}

fn read_region<D: BlockIO>(
    device: &mut D,
    buffer: &mut [u8],
    start: u64,
    blocks: u64,
    len: usize,
) -> Result<Vec<u8>>
where
    FsError: From<D::IoError>,
{
    let mut bytes = Vec::with_capacity(blocks as usize * buffer.len());
    for i in 0..blocks {
        device.read_block(start + i, buffer)?;
        bytes.extend_from_slice(buffer);
    }
    bytes.truncate(len);
    Ok(bytes)
}

/// Owns the device together with the superblock and free map, and performs
/// every raw block transfer on behalf of the filesystem facade.
#[derive(Debug)]
pub struct Storage<D: BlockIO> {
    device: D,
    superblock: Superblock,
    layout: DiskLayout,
    map: BlockMap,
    buffer: Vec<u8>,
}

impl<D> Storage<D>
where
    D: BlockIO,
    FsError: From<D::IoError>,
{
    /// Set up fresh metadata for `device`: an empty free map with the
    /// reserved region marked allocated, and a superblock describing it.
    /// Nothing is written until the first `sync_metadata`.
    pub fn format(device: D, max_inodes: u32) -> Result<Storage<D>> {
        let block_size = device.block_size();
        let total_blocks = device.block_count() as u64;
        let layout = DiskLayout::compute(total_blocks, block_size, max_inodes)?;
        let mut map = BlockMap::new(total_blocks);
        for block in 0..layout.data_start {
            map.mark_allocated(block);
        }
        let superblock = Superblock {
            magic: FS_MAGIC,
            total_blocks,
            block_size: block_size as u32,
            free_blocks: total_blocks - layout.reserved_blocks(),
            max_inodes,
            used_inodes: 0,
            first_free_block: layout.data_start,
        };
        debug!(
            "formatting device: {total_blocks} blocks of {block_size} bytes, {} reserved",
            layout.reserved_blocks()
        );
        Ok(Storage {
            device,
            superblock,
            layout,
            map,
            buffer: vec![0; block_size],
        })
    }

    /// Load the metadata regions of an already formatted device.
    pub fn open(mut device: D) -> Result<(Storage<D>, InodeTable)> {
        let block_size = device.block_size();
        if block_size < DiskLayout::MIN_BLOCK_SIZE {
            return Err(FsError::InvalidBlockSize(block_size));
        }
        let mut buffer = vec![0; block_size];
        device.read_block(0, &mut buffer)?;
        let superblock = Superblock::unpack_from_slice(&buffer[..Superblock::DISK_SIZE])
            .map_err(|_| FsError::InvalidSuperblock)?;
        if superblock.magic != FS_MAGIC {
            return Err(FsError::InvalidSuperblock);
        }
        if superblock.block_size as usize != block_size {
            return Err(FsError::BlockSizeMismatch {
                recorded: superblock.block_size as usize,
                device: block_size,
            });
        }
        if superblock.total_blocks != device.block_count() as u64 {
            debug!(
                "device reports {} blocks, superblock records {}",
                device.block_count(),
                superblock.total_blocks
            );
        }
        let layout = DiskLayout::compute(superblock.total_blocks, block_size, superblock.max_inodes)?;
        let map_bytes = read_region(
            &mut device,
            &mut buffer,
            layout.map_start,
            layout.map_blocks,
            superblock.total_blocks as usize * BlockMap::ENTRY_SIZE,
        )?;
        let map = BlockMap::from_bytes(&map_bytes, superblock.total_blocks);
        let table_bytes = read_region(
            &mut device,
            &mut buffer,
            layout.table_start,
            layout.table_blocks,
            superblock.max_inodes as usize * INODE_DISK_SIZE,
        )?;
        let table = InodeTable::from_bytes(&table_bytes, superblock.max_inodes as usize);
        debug!(
            "opened filesystem: {} blocks, {} free, {}/{} inodes in use",
            superblock.total_blocks,
            superblock.free_blocks,
            superblock.used_inodes,
            superblock.max_inodes
        );
        Ok((
            Storage {
                device,
                superblock,
                layout,
                map,
                buffer,
            },
            table,
        ))
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub(crate) fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.map.allocated_blocks()
    }

    /// Claim `count` data blocks, first-fit. Returns their indices relative
    /// to the data region start.
    pub fn allocate_blocks(&mut self, count: u64) -> Result<Vec<u32>> {
        if count > self.superblock.free_blocks {
            return Err(FsError::OutOfSpace {
                needed: count,
                free: self.superblock.free_blocks,
            });
        }
        let physical = self.map.allocate(count as usize).ok_or(FsError::OutOfSpace {
            needed: count,
            free: self.superblock.free_blocks,
        })?;
        self.superblock.free_blocks -= count;
        Ok(physical
            .into_iter()
            .map(|block| (block - self.layout.data_start) as u32)
            .collect())
    }

    /// Hand a single data block back to the free map.
    pub fn release_block(&mut self, pointer: u32) {
        trace!("releasing data block {pointer}");
        self.map.release(self.layout.data_start + pointer as u64);
        self.superblock.free_blocks += 1;
    }

    pub fn read_data_block(&mut self, pointer: u32, block: &mut [u8]) -> Result<()> {
        self.device
            .read_block(self.layout.data_start + pointer as u64, block)?;
        Ok(())
    }

    pub fn write_data_block(&mut self, pointer: u32, block: &[u8]) -> Result<()> {
        self.device
            .write_block(self.layout.data_start + pointer as u64, block)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.device.flush()?;
        Ok(())
    }

    /// Serialize the superblock, free map, and inode table back to their
    /// reserved blocks and flush. Every mutating operation ends here.
    pub fn sync_metadata(&mut self, table: &InodeTable) -> Result<()> {
        let superblock_bytes = self.superblock.pack().unwrap();
        self.write_region(0, &superblock_bytes)?;
        let map_bytes = self.map.to_bytes();
        self.write_region(self.layout.map_start, &map_bytes)?;
        let table_bytes = table.to_bytes();
        self.write_region(self.layout.table_start, &table_bytes)?;
        self.device.flush()?;
        Ok(())
    }

    fn write_region(&mut self, start: u64, bytes: &[u8]) -> Result<()> {
        for (i, chunk) in bytes.chunks(self.layout.block_size).enumerate() {
            self.buffer.fill(0);
            self.buffer[..chunk.len()].copy_from_slice(chunk);
            self.device.write_block(start + i as u64, &self.buffer)?;
        }
        Ok(())
    }
}
