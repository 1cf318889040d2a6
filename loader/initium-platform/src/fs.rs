//! Filesystem collaborator.
//!
//! The pipeline needs very little from a filesystem: open a path, know a
//! file's size, read at an offset, list a directory. Reads are synchronous
//! and complete fully or fail.

use alloc::boxed::Box;
use alloc::string::String;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("not a regular file")]
    NotAFile,
    #[error("not a directory")]
    NotADirectory,
    #[error("read failed")]
    ReadFailed,
    #[error("device error")]
    DeviceError,
}

/// An open file.
pub trait FileHandle {
    /// Total file size in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), FsError>;
}

/// A directory entry yielded by [`FileSystem::iterate`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// A mounted filesystem.
pub trait FileSystem {
    /// Open a regular file.
    fn open(&mut self, path: &str) -> Result<Box<dyn FileHandle>, FsError>;

    /// Call `cb` for each entry of the directory at `path`; iteration stops
    /// early when `cb` returns `false`.
    fn iterate(
        &mut self,
        path: &str,
        cb: &mut dyn FnMut(&DirEntry) -> bool,
    ) -> Result<(), FsError>;
}
