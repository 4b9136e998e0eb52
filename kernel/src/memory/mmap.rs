//! The mmap/munmap surface.
//!
//! Argument validation lives here; the heavy lifting is `VmMap::map` and
//! `VmMap::remove`. Only SHARED, PRIVATE, FIXED, and ANON are supported.

use crate::errno::{Errno, Result};
use crate::fs::file::FileMode;
use crate::fs::open::fget;
use crate::fs::vnode::Vnode;
use crate::memory::pagetable::tlb;
use crate::memory::vmmap::{Dir, MapFlags, Prot};
use crate::memory::{addr_to_pn, page_aligned, pn_to_addr, PAGE_SIZE, USER_MEM_HIGH, USER_MEM_LOW};
use crate::task::sched;
use alloc::sync::Arc;

/// Map `len` bytes at `addr` (or a kernel-chosen address when `addr == 0`).
/// Returns the mapped base address.
pub fn do_mmap(
    addr: usize,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    fd: i32,
    off: usize,
) -> Result<usize> {
    if !page_aligned(off) || (addr != 0 && !page_aligned(addr)) {
        return Err(Errno::EINVAL);
    }
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let end = addr.checked_add(len).ok_or(Errno::EINVAL)?;
    if addr != 0 && (addr < USER_MEM_LOW || end > USER_MEM_HIGH) {
        return Err(Errno::EINVAL);
    }
    if len > USER_MEM_HIGH - USER_MEM_LOW {
        return Err(Errno::EINVAL);
    }
    // Exactly one of SHARED and PRIVATE.
    if flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
        return Err(Errno::EINVAL);
    }
    if flags.contains(MapFlags::FIXED) && addr == 0 {
        return Err(Errno::EINVAL);
    }

    let file: Option<Arc<dyn Vnode>> = if flags.contains(MapFlags::ANON) {
        None
    } else {
        let file = fget(fd)?;
        if !file.mode().contains(FileMode::READ) {
            return Err(Errno::EACCES);
        }
        if prot.contains(Prot::WRITE)
            && flags.contains(MapFlags::SHARED)
            && !file.mode().contains(FileMode::WRITE)
        {
            return Err(Errno::EACCES);
        }
        Some(file.vnode())
    };

    let npages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
    let lopage = if addr == 0 { 0 } else { addr_to_pn(addr) };

    let proc = sched::curproc();
    let start = {
        let mut map = proc.vmmap.lock();
        map.map(file, lopage, npages, prot, flags, addr_to_pn(off), Dir::HiLo)?
    };

    tlb::flush_all();
    Ok(pn_to_addr(start))
}

/// Unmap `[addr, addr + len)`.
pub fn do_munmap(addr: usize, len: usize) -> Result<()> {
    if !page_aligned(addr) || len == 0 {
        return Err(Errno::EINVAL);
    }
    let end = addr.checked_add(len).ok_or(Errno::EINVAL)?;
    if addr < USER_MEM_LOW || end > USER_MEM_HIGH {
        return Err(Errno::EINVAL);
    }

    let npages = (len + PAGE_SIZE - 1) / PAGE_SIZE;
    let proc = sched::curproc();
    proc.vmmap.lock().remove(addr_to_pn(addr), npages);
    tlb::flush_all();
    Ok(())
}
