use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::debug;

pub mod blockmap;
pub mod inode;
pub mod storage;

use crate::container::DiskFile;
use inode::{InodeTable, DIRECT_SLOTS, INDIRECT_SLOTS, MAX_NAME_LEN, POINTER_SLOTS};
use storage::{BlockIO, Storage, Superblock};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FsError {
    #[error("a file named {0:?} already exists")]
    NameConflict(String),
    #[error("no file named {0:?} exists")]
    NotFound(String),
    #[error("the file table is full ({0} entries)")]
    TableFull(u32),
    #[error("not enough free blocks: need {needed}, have {free}")]
    OutOfSpace { needed: u64, free: u64 },
    #[error("a file of {size} bytes exceeds the maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },
    #[error("file names must be non-empty and free of NUL bytes")]
    InvalidName,
    #[error("file name is longer than {max} bytes")]
    NameTooLong { max: usize },
    #[error("block size {0} is not valid (must be at least 128)")]
    InvalidBlockSize(usize),
    #[error("the device is too small: {needed} blocks needed for metadata, {available} available")]
    DeviceTooSmall { needed: u64, available: u64 },
    #[error("no valid superblock found on the device")]
    InvalidSuperblock,
    #[error("the superblock records block size {recorded}, but the device uses {device}")]
    BlockSizeMismatch { recorded: usize, device: usize },
    #[error("I/O error against the backing medium")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, FsError>;

/// One row of `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    /// Creation time, seconds since the Unix epoch.
    pub created: u64,
    pub size: u64,
}

/// Per-file metadata returned by `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub name: String,
    pub created: u64,
    pub size: u64,
    pub direct: [Option<u32>; DIRECT_SLOTS],
    pub indirect: [Option<u32>; INDIRECT_SLOTS],
}

/// Superblock counters, as reported to external callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockInfo {
    pub total_blocks: u64,
    pub block_size: u32,
    pub free_blocks: u64,
    pub max_inodes: u32,
    pub used_inodes: u32,
}

/// The filesystem facade: a flat namespace of files over a block device,
/// with every mutation persisted before the call returns.
///
/// Access is strictly single-threaded; callers needing concurrency must
/// serialize externally.
#[derive(Debug)]
pub struct FileSystem<D: BlockIO> {
    storage: Storage<D>,
    table: InodeTable,
}

impl<D> FileSystem<D>
where
    D: BlockIO,
    FsError: From<D::IoError>,
{
    /// Write a fresh, empty filesystem onto `device`.
    pub fn format(device: D, max_inodes: u32) -> Result<FileSystem<D>> {
        let storage = Storage::format(device, max_inodes)?;
        let table = InodeTable::new(max_inodes as usize);
        let mut fs = FileSystem { storage, table };
        fs.storage.sync_metadata(&fs.table)?;
        Ok(fs)
    }

    /// Load an existing filesystem from `device`.
    pub fn open(device: D) -> Result<FileSystem<D>> {
        let (storage, table) = Storage::open(device)?;
        Ok(FileSystem { storage, table })
    }

    /// Register a new empty file: size 0, no blocks assigned yet.
    pub fn create(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.table.lookup(name).is_some() {
            return Err(FsError::NameConflict(name.to_string()));
        }
        let max_inodes = self.storage.superblock().max_inodes;
        if self.storage.superblock().used_inodes >= max_inodes {
            return Err(FsError::TableFull(max_inodes));
        }
        let slot = self
            .table
            .find_free_slot()
            .ok_or(FsError::TableFull(max_inodes))?;
        let inode = self.table.get_mut(slot);
        inode.name = name.to_string();
        inode.created = unix_now();
        inode.size = 0;
        inode.active = true;
        inode.clear_pointers();
        self.storage.superblock_mut().used_inodes += 1;
        debug!("created {name:?} in slot {slot}");
        self.storage.sync_metadata(&self.table)
    }

    /// Store `data` as the file's content, replacing whatever it held
    /// before. Blocks already assigned to the file are released first, so
    /// a rewrite never needs both copies' worth of space and never leaks.
    pub fn add(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let index = self.lookup(name)?;
        let block_size = self.storage.block_size() as u64;
        let blocks_needed = (data.len() as u64).div_ceil(block_size);
        if blocks_needed > POINTER_SLOTS as u64 {
            return Err(FsError::FileTooLarge {
                size: data.len() as u64,
                max: POINTER_SLOTS as u64 * block_size,
            });
        }
        let held: Vec<u32> = self.table.get(index).pointers().collect();
        let available = self.storage.superblock().free_blocks + held.len() as u64;
        if blocks_needed > available {
            return Err(FsError::OutOfSpace {
                needed: blocks_needed,
                free: available,
            });
        }
        for block in held {
            self.storage.release_block(block);
        }
        let blocks = self.storage.allocate_blocks(blocks_needed)?;
        let mut buffer = vec![0u8; block_size as usize];
        for (chunk, &block) in data.chunks(block_size as usize).zip(&blocks) {
            buffer.fill(0);
            buffer[..chunk.len()].copy_from_slice(chunk);
            self.storage.write_data_block(block, &buffer)?;
        }
        self.storage.flush()?;
        let inode = self.table.get_mut(index);
        inode.size = data.len() as u64;
        inode.assign_pointers(&blocks);
        debug!(
            "stored {} bytes in {name:?} across {} blocks",
            data.len(),
            blocks.len()
        );
        self.storage.sync_metadata(&self.table)
    }

    /// The file's content, reassembled from its blocks in slot order and
    /// truncated to the recorded size.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let index = self.lookup(name)?;
        let inode = self.table.get(index);
        let size = inode.size as usize;
        let pointers: Vec<u32> = inode.pointers().collect();
        let block_size = self.storage.block_size();
        let mut data = Vec::with_capacity(size);
        let mut buffer = vec![0u8; block_size];
        for block in pointers {
            if data.len() >= size {
                break;
            }
            self.storage.read_data_block(block, &mut buffer)?;
            let take = block_size.min(size - data.len());
            data.extend_from_slice(&buffer[..take]);
        }
        Ok(data)
    }

    /// Remove the file, returning its blocks to the free map and its table
    /// slot to the inactive pool.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let index = self.lookup(name)?;
        let held: Vec<u32> = self.table.get(index).pointers().collect();
        for block in held {
            self.storage.release_block(block);
        }
        let inode = self.table.get_mut(index);
        inode.active = false;
        inode.size = 0;
        inode.name.clear();
        inode.clear_pointers();
        self.storage.superblock_mut().used_inodes -= 1;
        debug!("deleted {name:?}");
        self.storage.sync_metadata(&self.table)
    }

    /// Change a file's name in place. The new name must not collide with
    /// another active file; renaming a file to its own name is a no-op.
    pub fn rename(&mut self, name: &str, new_name: &str) -> Result<()> {
        let index = self.lookup(name)?;
        validate_name(new_name)?;
        match self.table.lookup(new_name) {
            Some(existing) if existing != index => {
                return Err(FsError::NameConflict(new_name.to_string()));
            }
            _ => {}
        }
        self.table.get_mut(index).name = new_name.to_string();
        debug!("renamed {name:?} to {new_name:?}");
        self.storage.sync_metadata(&self.table)
    }

    /// Active files in table-index order.
    pub fn list(&self) -> Vec<FileEntry> {
        self.table
            .active_entries()
            .map(|(_, inode)| FileEntry {
                name: inode.name.clone(),
                created: inode.created,
                size: inode.size,
            })
            .collect()
    }

    pub fn stat(&self, name: &str) -> Result<FileStat> {
        let index = self.lookup(name)?;
        let inode = self.table.get(index);
        Ok(FileStat {
            name: inode.name.clone(),
            created: inode.created,
            size: inode.size,
            direct: inode.direct,
            indirect: inode.indirect,
        })
    }

    pub fn superblock_info(&self) -> SuperblockInfo {
        let superblock = self.storage.superblock();
        SuperblockInfo {
            total_blocks: superblock.total_blocks,
            block_size: superblock.block_size,
            free_blocks: superblock.free_blocks,
            max_inodes: superblock.max_inodes,
            used_inodes: superblock.used_inodes,
        }
    }

    /// Flush outstanding writes and release the device.
    pub fn close(self) -> Result<()> {
        let mut storage = self.storage;
        storage.flush()
    }

    fn lookup(&self, name: &str) -> Result<usize> {
        self.table
            .lookup(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let info = self.superblock_info();
        assert_eq!(
            info.free_blocks + self.storage.allocated_blocks(),
            info.total_blocks,
            "free and allocated counts must cover the whole medium"
        );
        let mut names: Vec<&str> = self
            .table
            .active_entries()
            .map(|(_, inode)| inode.name.as_str())
            .collect();
        assert_eq!(names.len() as u32, info.used_inodes);
        names.sort_unstable();
        names.dedup();
        assert_eq!(
            names.len() as u32,
            info.used_inodes,
            "active names must be pairwise distinct"
        );
    }
}

impl FileSystem<DiskFile> {
    /// Create a pre-sized image file and format it.
    pub fn create_path(
        path: impl AsRef<Path>,
        total_blocks: u64,
        block_size: usize,
        max_inodes: u32,
    ) -> Result<FileSystem<DiskFile>> {
        let device = DiskFile::create(path, block_size, total_blocks as usize)?;
        FileSystem::format(device, max_inodes)
    }

    /// Open an image file, discovering its block size from the superblock.
    pub fn open_path(path: impl AsRef<Path>) -> Result<FileSystem<DiskFile>> {
        let superblock = Superblock::probe(path.as_ref())?;
        let device = DiskFile::open(path, superblock.block_size as usize)?;
        FileSystem::open(device)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(FsError::InvalidName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::NameTooLong { max: MAX_NAME_LEN });
    }
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BLOCK_SIZE: usize = 512;
    const TOTAL_BLOCKS: u64 = 64;
    const MAX_FILES: u32 = 4;

    fn build_fs(dir: &TempDir) -> FileSystem<DiskFile> {
        let path = dir.path().join("disk.img");
        FileSystem::create_path(&path, TOTAL_BLOCKS, BLOCK_SIZE, MAX_FILES).expect("format")
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn create_rejects_duplicate_names() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        assert!(matches!(fs.create("a"), Err(FsError::NameConflict(_))));
        fs.check_invariants();
    }

    #[test]
    fn create_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        assert!(matches!(fs.create(""), Err(FsError::InvalidName)));
        assert!(matches!(fs.create("a\0b"), Err(FsError::InvalidName)));
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            fs.create(&long),
            Err(FsError::NameTooLong { .. })
        ));
    }

    #[test]
    fn create_fails_when_table_is_full() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        for name in ["a", "b", "c", "d"] {
            fs.create(name).unwrap();
        }
        assert!(matches!(
            fs.create("e"),
            Err(FsError::TableFull(MAX_FILES))
        ));
    }

    #[test]
    fn add_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        // two full blocks plus a partial third
        let data = payload(BLOCK_SIZE * 2 + 100);
        fs.add("a", &data).unwrap();
        assert_eq!(fs.read("a").unwrap(), data);
        fs.check_invariants();
    }

    #[test]
    fn add_fills_all_six_slots_at_the_cap() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        let data = payload(BLOCK_SIZE * POINTER_SLOTS);
        fs.add("a", &data).unwrap();
        let stat = fs.stat("a").unwrap();
        assert!(stat.direct.iter().all(|slot| slot.is_some()));
        assert!(stat.indirect.iter().all(|slot| slot.is_some()));
        assert_eq!(fs.read("a").unwrap(), data);
    }

    #[test]
    fn add_rejects_oversized_payloads() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        let data = payload(BLOCK_SIZE * POINTER_SLOTS + 1);
        assert!(matches!(
            fs.add("a", &data),
            Err(FsError::FileTooLarge { .. })
        ));
        assert_eq!(fs.stat("a").unwrap().size, 0);
        fs.check_invariants();
    }

    #[test]
    fn add_reports_out_of_space() {
        let dir = TempDir::new().unwrap();
        // 8 blocks total, 3 reserved: 5 free, so a 6-block file cannot fit
        let path = dir.path().join("tiny.img");
        let mut fs = FileSystem::create_path(&path, 8, BLOCK_SIZE, 2).expect("format");
        fs.create("a").unwrap();
        let data = payload(BLOCK_SIZE * 6);
        assert!(matches!(
            fs.add("a", &data),
            Err(FsError::OutOfSpace { needed: 6, free: 5 })
        ));
        fs.check_invariants();
    }

    #[test]
    fn add_to_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        assert!(matches!(fs.add("a", b"x"), Err(FsError::NotFound(_))));
        assert!(matches!(fs.read("a"), Err(FsError::NotFound(_))));
        assert!(matches!(fs.delete("a"), Err(FsError::NotFound(_))));
    }

    #[test]
    fn add_with_empty_data_uses_no_blocks() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        let free = fs.superblock_info().free_blocks;
        fs.add("a", b"").unwrap();
        assert_eq!(fs.superblock_info().free_blocks, free);
        assert_eq!(fs.read("a").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rewriting_a_file_releases_its_old_blocks() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        let free = fs.superblock_info().free_blocks;
        fs.add("a", &payload(BLOCK_SIZE * 5)).unwrap();
        assert_eq!(fs.superblock_info().free_blocks, free - 5);
        let small = payload(BLOCK_SIZE);
        fs.add("a", &small).unwrap();
        assert_eq!(fs.superblock_info().free_blocks, free - 1);
        assert_eq!(fs.read("a").unwrap(), small);
        fs.check_invariants();
    }

    #[test]
    fn delete_releases_blocks_for_reuse() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        fs.add("a", &payload(BLOCK_SIZE * 2)).unwrap();
        let first = fs.stat("a").unwrap().direct;
        let free = fs.superblock_info().free_blocks;
        fs.delete("a").unwrap();
        assert_eq!(fs.superblock_info().free_blocks, free + 2);

        fs.create("b").unwrap();
        fs.add("b", &payload(BLOCK_SIZE * 2)).unwrap();
        // first-fit hands back the same two blocks
        assert_eq!(fs.stat("b").unwrap().direct, first);
        fs.check_invariants();
    }

    #[test]
    fn delete_then_create_reuses_the_table_slot() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        for name in ["a", "b", "c", "d"] {
            fs.create(name).unwrap();
        }
        fs.delete("a").unwrap();
        fs.create("a").unwrap();
        assert_eq!(fs.superblock_info().used_inodes, 4);
        fs.check_invariants();
    }

    #[test]
    fn list_reflects_deletions() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("x").unwrap();
        fs.create("y").unwrap();
        fs.delete("x").unwrap();
        let names: Vec<String> = fs.list().into_iter().map(|entry| entry.name).collect();
        assert_eq!(names, vec!["y"]);
    }

    #[test]
    fn rename_moves_the_entry() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a.txt").unwrap();
        fs.rename("a.txt", "b.txt").unwrap();
        assert!(matches!(fs.read("a.txt"), Err(FsError::NotFound(_))));
        assert!(fs.stat("b.txt").is_ok());
    }

    #[test]
    fn rename_rejects_collisions() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        fs.create("b").unwrap();
        assert!(matches!(
            fs.rename("a", "b"),
            Err(FsError::NameConflict(_))
        ));
        // renaming to the same name is allowed
        fs.rename("a", "a").unwrap();
        fs.check_invariants();
    }

    #[test]
    fn reopening_reconstructs_identical_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        let data = payload(BLOCK_SIZE * 3 + 17);
        let written_info;
        let written_list;
        {
            let mut fs =
                FileSystem::create_path(&path, TOTAL_BLOCKS, BLOCK_SIZE, MAX_FILES).unwrap();
            fs.create("kept").unwrap();
            fs.add("kept", &data).unwrap();
            written_info = fs.superblock_info();
            written_list = fs.list();
            fs.close().unwrap();
        }
        let mut fs = FileSystem::open_path(&path).unwrap();
        assert_eq!(fs.superblock_info(), written_info);
        assert_eq!(fs.list(), written_list);
        assert_eq!(fs.read("kept").unwrap(), data);
        fs.check_invariants();
    }

    #[test]
    fn stat_reports_slot_assignments() {
        let dir = TempDir::new().unwrap();
        let mut fs = build_fs(&dir);
        fs.create("a").unwrap();
        fs.add("a", &payload(BLOCK_SIZE * 5)).unwrap();
        let stat = fs.stat("a").unwrap();
        assert_eq!(stat.size, BLOCK_SIZE as u64 * 5);
        assert_eq!(stat.direct.iter().flatten().count(), 4);
        assert_eq!(stat.indirect.iter().flatten().count(), 1);
    }
}
