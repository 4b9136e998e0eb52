//! Path resolution.
//!
//! Reference discipline: every vnode a helper hands back carries a held
//! reference, and every intermediate acquired during the walk is released
//! before returning — ownership makes the release automatic, the contract is
//! that nothing extra survives.

use crate::errno::{Errno, Result};
use crate::fs::file::O_CREAT;
use crate::fs::vnode::Vnode;
use crate::fs::NAME_MAX;
use crate::task::sched;
use alloc::string::{String, ToString};
use alloc::sync::Arc;

/// Find `name` in the directory `dir`. `ENOTDIR` if `dir` has no lookup op.
pub fn lookup(dir: &Arc<dyn Vnode>, name: &str) -> Result<Arc<dyn Vnode>> {
    if !dir.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    dir.lookup(name)
}

/// Resolve the directory prefix of `path`.
///
/// Returns the parent directory (with a held reference) and the basename.
/// An absolute path starts at the file-system root; otherwise resolution
/// starts at `base`, or at the current process's working directory when
/// `base` is `None`. Trailing slashes are collapsed; a path that is nothing
/// but slashes yields an empty basename and the effective base itself.
pub fn dir_namev(path: &str, base: Option<Arc<dyn Vnode>>) -> Result<(Arc<dyn Vnode>, String)> {
    let mut cur: Arc<dyn Vnode> = if path.starts_with('/') {
        crate::fs::vfs_root().ok_or(Errno::ENOENT)?
    } else {
        match base {
            Some(b) => b,
            None => sched::curproc().cwd().ok_or(Errno::ENOENT)?,
        }
    };

    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        // "" or all slashes: the base itself, with an empty basename.
        return Ok((cur, String::new()));
    }

    let (prefix, basename) = match trimmed.rfind('/') {
        Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
        None => ("", trimmed),
    };
    if basename.len() > NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }

    for comp in prefix.split('/').filter(|c| !c.is_empty()) {
        if comp.len() > NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        // The previous intermediate is released as `cur` is overwritten.
        cur = lookup(&cur, comp)?;
    }

    if !cur.is_dir() {
        return Err(Errno::ENOTDIR);
    }
    Ok((cur, basename.to_string()))
}

/// Resolve `path` to a vnode, creating the final component if `O_CREAT` is
/// set and it does not exist. A trailing slash requires the result to be a
/// directory.
pub fn open_namev(path: &str, flags: u32, base: Option<Arc<dyn Vnode>>) -> Result<Arc<dyn Vnode>> {
    let (dir, name) = dir_namev(path, base)?;
    if name.is_empty() {
        // Only slashes: the directory itself.
        return Ok(dir);
    }
    match lookup(&dir, &name) {
        Ok(vn) => {
            if path.ends_with('/') && !vn.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            Ok(vn)
        }
        Err(Errno::ENOENT) if flags & O_CREAT != 0 => dir.create(&name),
        Err(e) => Err(e),
    }
}
