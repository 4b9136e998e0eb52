//! In-memory file system.
//!
//! Backs the VFS: a directory tree with `.`/`..` entries, regular files as
//! growable byte vectors, hard links with link counts, and device special
//! nodes (whose data ops report `ENXIO` — drivers live elsewhere). Each
//! regular vnode caches a file-backed memory object so shared mappings and
//! read/write stay coherent.

use crate::errno::{Errno, Result};
use crate::fs::vnode::{Dirent, Stat, Vnode, VnodeKind};
use crate::fs::NAME_MAX;
use crate::memory::object::{MemObject, ObjectKind};
use crate::sync::spinlock::Spinlock;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

struct RamDirent {
    name: String,
    ino: usize,
}

enum RamData {
    File(Vec<u8>),
    Dir(Vec<RamDirent>),
    Dev { devid: u32 },
}

struct RamNode {
    data: RamData,
    nlink: usize,
}

pub struct RamVnode {
    ino: usize,
    kind: VnodeKind,
    fs: Weak<RamFs>,
    node: Spinlock<RamNode>,
    /// Cached memory object for file mappings of this vnode.
    mmobj: Spinlock<Weak<MemObject>>,
}

pub struct RamFs {
    /// ino-indexed vnode table; `None` once a node's last link is gone.
    nodes: Spinlock<Vec<Option<Arc<RamVnode>>>>,
}

pub const ROOT_INO: usize = 0;

impl RamFs {
    /// A fresh file system whose root directory is its own parent.
    pub fn new() -> Arc<RamFs> {
        let fs = Arc::new(RamFs { nodes: Spinlock::new(Vec::new()) });
        let root = Arc::new(RamVnode {
            ino: ROOT_INO,
            kind: VnodeKind::Directory,
            fs: Arc::downgrade(&fs),
            node: Spinlock::new(RamNode {
                data: RamData::Dir(alloc::vec![
                    RamDirent { name: String::from("."), ino: ROOT_INO },
                    RamDirent { name: String::from(".."), ino: ROOT_INO },
                ]),
                nlink: 1,
            }),
            mmobj: Spinlock::new(Weak::new()),
        });
        fs.nodes.lock().push(Some(root));
        fs
    }

    pub fn root(&self) -> Arc<dyn Vnode> {
        self.get(ROOT_INO).expect("ramfs lost its root")
    }

    fn get(&self, ino: usize) -> Option<Arc<RamVnode>> {
        self.nodes.lock().get(ino).and_then(|slot| slot.clone())
    }

    fn alloc_node(&self, kind: VnodeKind, data: RamData, fs: &Arc<RamFs>) -> Arc<RamVnode> {
        let mut nodes = self.nodes.lock();
        let ino = nodes.len();
        let vn = Arc::new(RamVnode {
            ino,
            kind,
            fs: Arc::downgrade(fs),
            node: Spinlock::new(RamNode { data, nlink: 1 }),
            mmobj: Spinlock::new(Weak::new()),
        });
        nodes.push(Some(vn.clone()));
        vn
    }

    fn drop_node(&self, ino: usize) {
        let mut nodes = self.nodes.lock();
        nodes[ino] = None;
    }

    /// Live vnode count (tests).
    pub fn live_nodes(&self) -> usize {
        self.nodes.lock().iter().filter(|s| s.is_some()).count()
    }
}

impl RamVnode {
    fn fs(&self) -> Arc<RamFs> {
        self.fs.upgrade().expect("ramfs torn down under a vnode")
    }

    fn with_dir<R>(&self, f: impl FnOnce(&mut Vec<RamDirent>) -> R) -> Result<R> {
        let mut node = self.node.lock();
        match &mut node.data {
            RamData::Dir(entries) => Ok(f(entries)),
            _ => Err(Errno::ENOTDIR),
        }
    }

    fn dir_entry_ino(&self, name: &str) -> Result<usize> {
        self.with_dir(|entries| entries.iter().find(|e| e.name == name).map(|e| e.ino))?
            .ok_or(Errno::ENOENT)
    }

    fn check_new_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(Errno::EINVAL);
        }
        if name.len() > NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        Ok(())
    }
}

impl Vnode for RamVnode {
    fn ino(&self) -> usize {
        self.ino
    }

    fn kind(&self) -> VnodeKind {
        self.kind
    }

    fn len(&self) -> usize {
        let node = self.node.lock();
        match &node.data {
            RamData::File(bytes) => bytes.len(),
            RamData::Dir(entries) => entries.len(),
            RamData::Dev { .. } => 0,
        }
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Vnode>> {
        if name.len() > NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        let ino = self.dir_entry_ino(name)?;
        Ok(self.fs().get(ino).expect("directory entry names a dead inode"))
    }

    fn create(&self, name: &str) -> Result<Arc<dyn Vnode>> {
        self.check_new_name(name)?;
        if self.dir_entry_ino(name).is_ok() {
            return Err(Errno::EEXIST);
        }
        let fs = self.fs();
        let vn = fs.alloc_node(VnodeKind::Regular, RamData::File(Vec::new()), &fs);
        self.with_dir(|entries| entries.push(RamDirent { name: name.to_string(), ino: vn.ino }))?;
        Ok(vn)
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        self.check_new_name(name)?;
        if self.dir_entry_ino(name).is_ok() {
            return Err(Errno::EEXIST);
        }
        let fs = self.fs();
        let vn = fs.alloc_node(VnodeKind::Directory, RamData::Dir(Vec::new()), &fs);
        vn.with_dir(|entries| {
            entries.push(RamDirent { name: String::from("."), ino: vn.ino });
            entries.push(RamDirent { name: String::from(".."), ino: self.ino });
        })?;
        self.with_dir(|entries| entries.push(RamDirent { name: name.to_string(), ino: vn.ino }))?;
        Ok(())
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        let ino = self.dir_entry_ino(name)?;
        let fs = self.fs();
        let target = fs.get(ino).expect("directory entry names a dead inode");
        if !target.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let empty = target.with_dir(|entries| {
            entries.iter().all(|e| e.name == "." || e.name == "..")
        })?;
        if !empty {
            return Err(Errno::ENOTEMPTY);
        }
        self.with_dir(|entries| entries.retain(|e| e.name != name))?;
        fs.drop_node(ino);
        Ok(())
    }

    fn unlink(&self, name: &str) -> Result<()> {
        let ino = self.dir_entry_ino(name)?;
        let fs = self.fs();
        let target = fs.get(ino).expect("directory entry names a dead inode");
        if target.is_dir() {
            return Err(Errno::EPERM);
        }
        self.with_dir(|entries| entries.retain(|e| e.name != name))?;
        let gone = {
            let mut node = target.node.lock();
            node.nlink -= 1;
            node.nlink == 0
        };
        if gone {
            // Open files still hold the vnode; only the cache entry dies.
            fs.drop_node(ino);
        }
        Ok(())
    }

    fn link(&self, target: &Arc<dyn Vnode>, name: &str) -> Result<()> {
        self.check_new_name(name)?;
        if self.dir_entry_ino(name).is_ok() {
            return Err(Errno::EEXIST);
        }
        if target.is_dir() {
            return Err(Errno::EPERM);
        }
        let fs = self.fs();
        // The target must be one of ours.
        let mine = fs.get(target.ino()).ok_or(Errno::EPERM)?;
        let mine_dyn: Arc<dyn Vnode> = mine.clone();
        if !Arc::ptr_eq(&mine_dyn, target) {
            return Err(Errno::EPERM);
        }
        mine.node.lock().nlink += 1;
        self.with_dir(|entries| entries.push(RamDirent { name: name.to_string(), ino: mine.ino }))?;
        Ok(())
    }

    fn mknod(&self, name: &str, kind: VnodeKind, devid: u32) -> Result<()> {
        self.check_new_name(name)?;
        if kind != VnodeKind::CharDev && kind != VnodeKind::BlockDev {
            return Err(Errno::EINVAL);
        }
        if self.dir_entry_ino(name).is_ok() {
            return Err(Errno::EEXIST);
        }
        let fs = self.fs();
        let vn = fs.alloc_node(kind, RamData::Dev { devid }, &fs);
        self.with_dir(|entries| entries.push(RamDirent { name: name.to_string(), ino: vn.ino }))?;
        Ok(())
    }

    fn readdir(&self, pos: usize) -> Result<Option<(Dirent, usize)>> {
        self.with_dir(|entries| {
            entries.get(pos).map(|e| {
                (Dirent { ino: e.ino, name: e.name.clone() }, pos + 1)
            })
        })
    }

    fn read(&self, off: usize, buf: &mut [u8]) -> Result<usize> {
        let node = self.node.lock();
        match &node.data {
            RamData::File(bytes) => {
                if off >= bytes.len() {
                    return Ok(0);
                }
                let n = core::cmp::min(buf.len(), bytes.len() - off);
                buf[..n].copy_from_slice(&bytes[off..off + n]);
                Ok(n)
            }
            RamData::Dir(_) => Err(Errno::EISDIR),
            RamData::Dev { .. } => Err(Errno::ENXIO),
        }
    }

    fn write(&self, off: usize, data: &[u8]) -> Result<usize> {
        let mut node = self.node.lock();
        match &mut node.data {
            RamData::File(bytes) => {
                let end = off + data.len();
                if bytes.len() < end {
                    // Sparse writes zero-fill the gap.
                    bytes.resize(end, 0);
                }
                bytes[off..end].copy_from_slice(data);
                Ok(data.len())
            }
            RamData::Dir(_) => Err(Errno::EISDIR),
            RamData::Dev { .. } => Err(Errno::ENXIO),
        }
    }

    fn mmap(&self) -> Result<Arc<MemObject>> {
        if self.kind != VnodeKind::Regular {
            return Err(Errno::ENXIO);
        }
        let mut cached = self.mmobj.lock();
        if let Some(obj) = cached.upgrade() {
            return Ok(obj);
        }
        // An unlinked-but-open file is no longer in the table; new mappings
        // of it are refused.
        let me: Arc<dyn Vnode> = self.fs().get(self.ino).ok_or(Errno::ENOENT)?;
        let obj = MemObject::with_kind(ObjectKind::File(me));
        *cached = Arc::downgrade(&obj);
        Ok(obj)
    }

    fn stat(&self) -> Result<Stat> {
        let nlink = self.node.lock().nlink;
        Ok(Stat {
            ino: self.ino,
            kind: self.kind,
            len: self.len(),
            nlink,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_lookup() {
        let fs = RamFs::new();
        let root = fs.root();
        let f = root.create("hello").unwrap();
        assert_eq!(f.kind(), VnodeKind::Regular);
        let again = root.lookup("hello").unwrap();
        assert_eq!(again.ino(), f.ino());
        assert_eq!(root.create("hello").err(), Some(Errno::EEXIST));
    }

    #[test]
    fn dot_and_dotdot_resolve() {
        let fs = RamFs::new();
        let root = fs.root();
        root.mkdir("d").unwrap();
        let d = root.lookup("d").unwrap();
        assert_eq!(d.lookup(".").unwrap().ino(), d.ino());
        assert_eq!(d.lookup("..").unwrap().ino(), root.ino());
    }

    #[test]
    fn link_counts_follow_links() {
        let fs = RamFs::new();
        let root = fs.root();
        let f = root.create("a").unwrap();
        root.link(&f, "b").unwrap();
        assert_eq!(f.stat().unwrap().nlink, 2);
        root.unlink("a").unwrap();
        assert_eq!(f.stat().unwrap().nlink, 1);
        // Still reachable through the second name.
        assert_eq!(root.lookup("b").unwrap().ino(), f.ino());
        root.unlink("b").unwrap();
        assert_eq!(root.lookup("b").err(), Some(Errno::ENOENT));
    }

    #[test]
    fn rmdir_requires_empty() {
        let fs = RamFs::new();
        let root = fs.root();
        root.mkdir("d").unwrap();
        let d = root.lookup("d").unwrap();
        d.create("f").unwrap();
        assert_eq!(root.rmdir("d").unwrap_err(), Errno::ENOTEMPTY);
        d.unlink("f").unwrap();
        root.rmdir("d").unwrap();
        assert_eq!(root.lookup("d").err(), Some(Errno::ENOENT));
    }

    #[test]
    fn sparse_writes_zero_fill() {
        let fs = RamFs::new();
        let root = fs.root();
        let f = root.create("f").unwrap();
        f.write(4, b"xy").unwrap();
        assert_eq!(f.len(), 6);
        let mut buf = [0xffu8; 6];
        f.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"\0\0\0\0xy");
    }

    #[test]
    fn readdir_walks_entries_in_order() {
        let fs = RamFs::new();
        let root = fs.root();
        root.create("one").unwrap();
        root.mkdir("two").unwrap();
        let mut names = Vec::new();
        let mut pos = 0;
        while let Some((d, next)) = root.readdir(pos).unwrap() {
            names.push(d.name);
            pos = next;
        }
        assert_eq!(names, [".", "..", "one", "two"]);
    }
}
