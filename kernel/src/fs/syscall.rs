//! The VFS syscall surface (minus open, which lives in `fs::open`).
//!
//! Every path-taking operation resolves through `namev` and keeps the
//! reference discipline symmetrical: each lookup either flows into the
//! result or is released on the way out.

use crate::errno::{Errno, Result};
use crate::fs::file::{FileMode, O_RDONLY};
use crate::fs::namev::{dir_namev, lookup, open_namev};
use crate::fs::open::fget;
use crate::fs::pipe::PipeVnode;
use crate::fs::vnode::{Dirent, Stat, VnodeKind};
use crate::task::sched;

/// `lseek` origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Read from the descriptor at its cursor, advancing it by what came back.
pub fn do_read(fd: i32, buf: &mut [u8]) -> Result<usize> {
    let file = fget(fd)?;
    if file.vnode().is_dir() {
        return Err(Errno::EISDIR);
    }
    if !file.mode().contains(FileMode::READ) {
        return Err(Errno::EBADF);
    }
    let n = file.vnode().read(file.pos(), buf)?;
    file.advance(n);
    Ok(n)
}

/// Write at the cursor (or the end of the file under `O_APPEND`).
pub fn do_write(fd: i32, data: &[u8]) -> Result<usize> {
    let file = fget(fd)?;
    if !file.mode().intersects(FileMode::WRITE | FileMode::APPEND) {
        return Err(Errno::EBADF);
    }
    let vn = file.vnode();
    if file.mode().contains(FileMode::APPEND) {
        file.set_pos(vn.len());
    }
    let n = vn.write(file.pos(), data)?;
    file.advance(n);
    // After a write the cursor must still be inside a regular file.
    assert!(
        vn.kind() != VnodeKind::Regular || file.pos() <= vn.len(),
        "file cursor ran past the end of a regular file"
    );
    Ok(n)
}

/// Release the descriptor's reference and free the slot.
pub fn do_close(fd: i32) -> Result<()> {
    sched::curproc()
        .files
        .lock()
        .take(fd)
        .map(|_| ())
        .ok_or(Errno::EBADF)
}

/// Duplicate `fd` into the lowest free descriptor.
pub fn do_dup(fd: i32) -> Result<usize> {
    let file = fget(fd)?;
    let proc = sched::curproc();
    let mut files = proc.files.lock();
    let nfd = files.get_empty_fd()?;
    files.set(nfd, file);
    Ok(nfd)
}

/// Duplicate `ofd` into `nfd`, closing `nfd` first unless they are equal.
pub fn do_dup2(ofd: i32, nfd: i32) -> Result<usize> {
    let file = fget(ofd)?;
    if nfd < 0 || nfd as usize >= crate::fs::file::NFILES {
        return Err(Errno::EBADF);
    }
    if nfd == ofd {
        return Ok(nfd as usize);
    }
    let proc = sched::curproc();
    let mut files = proc.files.lock();
    files.take(nfd);
    files.set(nfd as usize, file);
    Ok(nfd as usize)
}

/// Create a device special file. Only char and block nodes are allowed.
pub fn do_mknod(path: &str, kind: VnodeKind, devid: u32) -> Result<()> {
    if kind != VnodeKind::CharDev && kind != VnodeKind::BlockDev {
        return Err(Errno::EINVAL);
    }
    let (dir, name) = dir_namev(path, None)?;
    if name.is_empty() {
        return Err(Errno::EEXIST);
    }
    match lookup(&dir, &name) {
        Ok(_) => Err(Errno::EEXIST),
        Err(Errno::ENOENT) => dir.mknod(&name, kind, devid),
        Err(e) => Err(e),
    }
}

/// Create a directory.
pub fn do_mkdir(path: &str) -> Result<()> {
    let (dir, name) = dir_namev(path, None)?;
    if name.is_empty() {
        // The path names an existing directory (e.g. "/").
        return Err(Errno::EEXIST);
    }
    match lookup(&dir, &name) {
        Ok(_) => Err(Errno::EEXIST),
        Err(Errno::ENOENT) => dir.mkdir(&name),
        Err(e) => Err(e),
    }
}

/// Remove an empty directory. A final component of "." is `EINVAL`, ".."
/// is `ENOTEMPTY`.
pub fn do_rmdir(path: &str) -> Result<()> {
    let (dir, name) = dir_namev(path, None)?;
    match name.as_str() {
        "" => Err(Errno::EINVAL),
        "." => Err(Errno::EINVAL),
        ".." => Err(Errno::ENOTEMPTY),
        _ => dir.rmdir(&name),
    }
}

/// Remove a non-directory entry. Directories get `EPERM`.
pub fn do_unlink(path: &str) -> Result<()> {
    let (dir, name) = dir_namev(path, None)?;
    if name.is_empty() {
        return Err(Errno::EPERM);
    }
    let vn = lookup(&dir, &name)?;
    if vn.is_dir() {
        return Err(Errno::EPERM);
    }
    dir.unlink(&name)
}

/// Hard-link `to` to the file at `from`. Directories cannot be linked.
pub fn do_link(from: &str, to: &str) -> Result<()> {
    let target = open_namev(from, O_RDONLY, None)?;
    if target.is_dir() {
        return Err(Errno::EPERM);
    }
    let (dir, name) = dir_namev(to, None)?;
    if name.is_empty() {
        return Err(Errno::EEXIST);
    }
    match lookup(&dir, &name) {
        Ok(_) => Err(Errno::EEXIST),
        Err(Errno::ENOENT) => dir.link(&target, &name),
        Err(e) => Err(e),
    }
}

/// Rename: link the new name, then unlink the old. Not atomic — a failed
/// unlink leaves both links in place.
pub fn do_rename(oldname: &str, newname: &str) -> Result<()> {
    do_link(oldname, newname)?;
    do_unlink(oldname)
}

/// Change the working directory, releasing the reference to the old one.
pub fn do_chdir(path: &str) -> Result<()> {
    let vn = open_namev(path, O_RDONLY, None)?;
    if !vn.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    sched::curproc().set_cwd(vn);
    Ok(())
}

/// Append up to `count` directory entries to `buf`, reading from the
/// descriptor's cursor and advancing it. Returns the number of entries
/// produced (0 once the directory is exhausted).
pub fn do_getdents(fd: i32, buf: &mut alloc::vec::Vec<Dirent>, count: usize) -> Result<usize> {
    let file = fget(fd)?;
    let vn = file.vnode();
    if !vn.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    let mut filled = 0;
    while filled < count {
        match vn.readdir(file.pos())? {
            Some((d, next)) => {
                buf.push(d);
                filled += 1;
                file.set_pos(next);
            }
            None => break,
        }
    }
    Ok(filled)
}

/// Move the descriptor's cursor. The resulting position must not be
/// negative.
pub fn do_lseek(fd: i32, offset: isize, whence: Whence) -> Result<usize> {
    let file = fget(fd)?;
    let base = match whence {
        Whence::Set => 0isize,
        Whence::Cur => file.pos() as isize,
        Whence::End => file.vnode().len() as isize,
    };
    let pos = base + offset;
    if pos < 0 {
        return Err(Errno::EINVAL);
    }
    file.set_pos(pos as usize);
    Ok(pos as usize)
}

/// Stat the file at `path`. An empty path is `EINVAL`.
pub fn do_stat(path: &str) -> Result<Stat> {
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }
    let vn = open_namev(path, O_RDONLY, None)?;
    vn.stat()
}

/// Create a pipe; returns `(read_fd, write_fd)`.
pub fn do_pipe() -> Result<(usize, usize)> {
    let pipe = PipeVnode::create();
    let proc = sched::curproc();
    let mut files = proc.files.lock();
    let rfd = files.get_empty_fd()?;
    pipe.opened(FileMode::READ);
    files.set(rfd, crate::fs::file::File::new(pipe.clone(), FileMode::READ));
    let wfd = match files.get_empty_fd() {
        Ok(fd) => fd,
        Err(e) => {
            // Dropping the read end also retires its reader registration.
            files.take(rfd as i32);
            return Err(e);
        }
    };
    pipe.opened(FileMode::WRITE);
    files.set(wfd, crate::fs::file::File::new(pipe, FileMode::WRITE));
    Ok((rfd, wfd))
}
