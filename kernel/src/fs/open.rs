//! `do_open` and descriptor helpers.

use crate::errno::{Errno, Result};
use crate::fs::file::{File, FileMode, O_APPEND, O_RDWR, O_WRONLY};
use crate::fs::namev::open_namev;
use crate::task::sched;
use alloc::sync::Arc;

/// Look up an open file by descriptor, taking a reference.
pub fn fget(fd: i32) -> Result<Arc<File>> {
    sched::curproc().files.lock().get(fd).ok_or(Errno::EBADF)
}

/// Open `path` with the given flags and return the new descriptor.
///
/// `O_WRONLY | O_RDWR` is the one illegal access combination. Write-mode
/// opens of directories are rejected with `EISDIR`.
pub fn do_open(path: &str, oflags: u32) -> Result<usize> {
    if (oflags & O_WRONLY != 0) && (oflags & O_RDWR != 0) {
        return Err(Errno::EINVAL);
    }

    let mut mode = FileMode::empty();
    if oflags & O_WRONLY != 0 {
        mode |= FileMode::WRITE;
    } else if oflags & O_RDWR != 0 {
        mode |= FileMode::READ | FileMode::WRITE;
    } else {
        mode |= FileMode::READ;
    }
    if oflags & O_APPEND != 0 {
        mode |= FileMode::APPEND;
    }

    let proc = sched::curproc();
    let fd = proc.files.lock().get_empty_fd()?;

    let vn = open_namev(path, oflags, None)?;
    if vn.is_dir() && mode.contains(FileMode::WRITE) {
        return Err(Errno::EISDIR);
    }

    // Cursor starts at zero; the vnode reference moves into the file.
    proc.files.lock().set(fd, File::new(vn, mode));
    Ok(fd)
}
