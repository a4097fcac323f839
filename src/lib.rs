pub mod container;
pub mod fs;

pub use container::DiskFile;
pub use fs::{FileSystem, FsError};
