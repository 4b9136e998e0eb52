//! The virtual file system: vnodes, path resolution, open files, and the
//! syscall surface, backed by an in-memory file system mounted at '/'.

pub mod file;
pub mod namev;
pub mod open;
pub mod pipe;
pub mod ramfs;
pub mod syscall;
pub mod vnode;

use crate::sync::spinlock::Spinlock;
use alloc::sync::Arc;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 28;

struct VfsState {
    root_fs: Arc<ramfs::RamFs>,
    root: Arc<dyn vnode::Vnode>,
}

static VFS: Spinlock<Option<VfsState>> = Spinlock::new(None);

/// Mount a fresh root file system at '/'.
pub fn vfs_init() {
    let root_fs = ramfs::RamFs::new();
    let root = root_fs.root();
    *VFS.lock() = Some(VfsState { root_fs, root });
    log::debug!("vfs: ramfs mounted at '/'");
}

/// The root vnode, with a held reference; `None` before `vfs_init`.
pub fn vfs_root() -> Option<Arc<dyn vnode::Vnode>> {
    VFS.lock().as_ref().map(|s| s.root.clone())
}

/// The mounted root file system (tests use this for invariant checks).
pub fn root_fs() -> Option<Arc<ramfs::RamFs>> {
    VFS.lock().as_ref().map(|s| s.root_fs.clone())
}

/// Unmount at shutdown, dropping the root references.
pub fn vfs_shutdown() {
    *VFS.lock() = None;
}
