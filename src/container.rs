use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::fs::storage::BlockIO;

/// A block medium simulated on top of a regular file. The file is sized to
/// exactly `block_count * block_size` bytes when the image is created and
/// never grows or shrinks afterwards.
#[derive(Debug)]
pub struct DiskFile {
    file: fs::File,
    block_size: usize,
    block_count: usize,
}

impl DiskFile {
    /// Create a new image file pre-sized to `block_count` blocks. Fails if
    /// the target already exists.
    pub fn create(
        path: impl AsRef<Path>,
        block_size: usize,
        block_count: usize,
    ) -> io::Result<DiskFile> {
        let path = path.as_ref();
        debug!("creating disk image at {path:?}: {block_count} blocks of {block_size} bytes");
        let file = fs::OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(block_count as u64 * block_size as u64)?;
        Ok(DiskFile {
            file,
            block_size,
            block_count,
        })
    }

    /// Open an existing image file. The file length must be an exact
    /// multiple of `block_size`.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> io::Result<DiskFile> {
        let path = path.as_ref().canonicalize()?;
        debug!("opening disk image at {path:?}");
        let file = fs::File::options().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if block_size == 0 || len % block_size as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file length {len} is not a multiple of the block size {block_size}"),
            ));
        }
        Ok(DiskFile {
            file,
            block_size,
            block_count: (len / block_size as u64) as usize,
        })
    }

    fn seek_to(&mut self, block_number: u64) -> io::Result<()> {
        self.file
            .seek(SeekFrom::Start(block_number * self.block_size as u64))?;
        Ok(())
    }

    /// Flush outstanding writes and release the handle.
    pub fn close(mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl BlockIO for DiskFile {
    type IoError = io::Error;

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, block_number: u64, block: &mut [u8]) -> io::Result<()> {
        assert!(
            block.len() >= self.block_size,
            "provided buffer is too small"
        );
        assert!(
            (block_number as usize) < self.block_count,
            "block number out of range"
        );
        self.seek_to(block_number)?;
        self.file.read_exact(&mut block[..self.block_size])
    }

    fn write_block(&mut self, block_number: u64, block: &[u8]) -> io::Result<()> {
        assert!(
            block.len() >= self.block_size,
            "provided buffer is too small"
        );
        assert!(
            (block_number as usize) < self.block_count,
            "block number out of range"
        );
        self.seek_to(block_number)?;
        self.file.write_all(&block[..self.block_size])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
