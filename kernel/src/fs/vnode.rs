//! Vnodes: the abstract file/directory handle the VFS operates on.
//!
//! The operation set is the classic vnode table. File systems implement the
//! ops that make sense for each node; the defaults stand in for "op not
//! present" — calling `read` on something with no read op reports `EISDIR`,
//! calling a directory op on a non-directory reports `ENOTDIR`.

use crate::errno::{Errno, Result};
use crate::fs::file::FileMode;
use crate::memory::object::MemObject;
use alloc::string::String;
use alloc::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeKind {
    Regular,
    Directory,
    CharDev,
    BlockDev,
    Fifo,
}

/// Results of a `stat` vnode op.
#[derive(Debug, Clone)]
pub struct Stat {
    pub ino: usize,
    pub kind: VnodeKind,
    pub len: usize,
    pub nlink: usize,
}

/// One directory entry, as produced by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: usize,
    pub name: String,
}

pub trait Vnode: Send + Sync {
    fn ino(&self) -> usize;
    fn kind(&self) -> VnodeKind;
    fn len(&self) -> usize;

    fn is_dir(&self) -> bool {
        self.kind() == VnodeKind::Directory
    }

    /// Find `name` in this directory. The returned vnode carries its own
    /// reference.
    fn lookup(&self, _name: &str) -> Result<Arc<dyn Vnode>> {
        Err(Errno::ENOTDIR)
    }

    /// Create a regular file named `name` in this directory and return it
    /// with a held reference.
    fn create(&self, _name: &str) -> Result<Arc<dyn Vnode>> {
        Err(Errno::ENOTDIR)
    }

    fn mkdir(&self, _name: &str) -> Result<()> {
        Err(Errno::ENOTDIR)
    }

    /// Remove the empty directory `name` from this directory.
    fn rmdir(&self, _name: &str) -> Result<()> {
        Err(Errno::ENOTDIR)
    }

    /// Remove the non-directory entry `name` from this directory.
    fn unlink(&self, _name: &str) -> Result<()> {
        Err(Errno::ENOTDIR)
    }

    /// Add a hard link `name` in this directory to `target`.
    fn link(&self, _target: &Arc<dyn Vnode>, _name: &str) -> Result<()> {
        Err(Errno::ENOTDIR)
    }

    /// Create a device special node.
    fn mknod(&self, _name: &str, _kind: VnodeKind, _devid: u32) -> Result<()> {
        Err(Errno::ENOTDIR)
    }

    /// The entry at cursor `pos`, with the advanced cursor, or `None` at the
    /// end of the directory.
    fn readdir(&self, _pos: usize) -> Result<Option<(Dirent, usize)>> {
        Err(Errno::ENOTDIR)
    }

    fn read(&self, _off: usize, _buf: &mut [u8]) -> Result<usize> {
        Err(Errno::EISDIR)
    }

    fn write(&self, _off: usize, _data: &[u8]) -> Result<usize> {
        Err(Errno::EISDIR)
    }

    /// The memory object backing file mappings of this vnode.
    fn mmap(&self) -> Result<Arc<MemObject>> {
        Err(Errno::ENXIO)
    }

    fn stat(&self) -> Result<Stat>;

    /// An open file holding `mode` on this vnode was dropped. Pipes use
    /// this to track their reader/writer ends.
    fn release(&self, _mode: FileMode) {}
}
