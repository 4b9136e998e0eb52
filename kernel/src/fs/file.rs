//! Open files and the per-process descriptor table.

use crate::errno::{Errno, Result};
use crate::fs::vnode::Vnode;
use crate::sync::spinlock::Spinlock;
use alloc::sync::Arc;
use bitflags::bitflags;

/// Width of every process's file-descriptor table.
pub const NFILES: usize = 32;

// Open flags, straight out of fcntl.
pub const O_RDONLY: u32 = 0x000;
pub const O_WRONLY: u32 = 0x001;
pub const O_RDWR: u32 = 0x002;
pub const O_CREAT: u32 = 0x100;
pub const O_APPEND: u32 = 0x200;

bitflags! {
    /// Open-file mode bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const APPEND = 1 << 2;
    }
}

/// An open file: mode, byte cursor, and the backing vnode.
///
/// The fd table owns one reference per slot; `dup`, `dup2`, and `fork`
/// share the object (and therefore the cursor) by cloning the reference.
pub struct File {
    mode: FileMode,
    pos: Spinlock<usize>,
    vnode: Arc<dyn Vnode>,
}

impl File {
    pub fn new(vnode: Arc<dyn Vnode>, mode: FileMode) -> Arc<File> {
        Arc::new(File { mode, pos: Spinlock::new(0), vnode })
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn vnode(&self) -> Arc<dyn Vnode> {
        self.vnode.clone()
    }

    pub fn pos(&self) -> usize {
        *self.pos.lock()
    }

    pub fn set_pos(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    pub fn advance(&self, n: usize) {
        *self.pos.lock() += n;
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.vnode.release(self.mode);
    }
}

/// Fixed-width descriptor table.
pub struct FdTable {
    slots: [Option<Arc<File>>; NFILES],
}

impl FdTable {
    pub fn new() -> FdTable {
        FdTable { slots: [const { None }; NFILES] }
    }

    /// The lowest free descriptor, or `EMFILE` when the table is full.
    pub fn get_empty_fd(&self) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(Errno::EMFILE)
    }

    pub fn get(&self, fd: i32) -> Option<Arc<File>> {
        if fd < 0 || fd as usize >= NFILES {
            return None;
        }
        self.slots[fd as usize].clone()
    }

    pub fn set(&mut self, fd: usize, file: Arc<File>) {
        assert!(fd < NFILES);
        self.slots[fd] = Some(file);
    }

    pub fn take(&mut self, fd: i32) -> Option<Arc<File>> {
        if fd < 0 || fd as usize >= NFILES {
            return None;
        }
        self.slots[fd as usize].take()
    }

    /// Drop every open file (process exit).
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Fork: the child shares every open file, one reference per slot.
    pub fn clone_for_fork(&self) -> FdTable {
        FdTable { slots: self.slots.clone() }
    }

    /// Occupied descriptor count (diagnostics).
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}
