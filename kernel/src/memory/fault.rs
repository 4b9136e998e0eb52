//! Page-fault handling and the hosted user-mode access path.
//!
//! The MMU fault path lands in [`handle_fault`]: find the area, check its
//! protection against the access, materialize the frame through the backing
//! object (copy-on-write happens inside shadow lookup), and install the
//! page-table mapping. A fault the handler rejects terminates the process
//! with the FAULT status — it is not a syscall error.
//!
//! Hosted builds have no hardware MMU, so [`user_read`] / [`user_write`] /
//! [`user_exec`] are the user-mode boundary: they walk the *active* page
//! directory exactly as the hardware would, faulting on misses and
//! insufficient permissions, then retrying the translation.

use crate::errno::Errno;
use crate::memory::object::MemObject;
use crate::memory::pagetable::{self, tlb, PtFlags};
use crate::memory::vmmap::Prot;
use crate::memory::{addr_to_pn, page_align_down, page_offset, phys, PAGE_SIZE};
use crate::task::process::do_exit;
use crate::task::sched;
use alloc::sync::Arc;

/// What the faulting access was trying to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    Read,
    Write,
    Exec,
}

impl FaultCause {
    fn required_prot(self) -> Prot {
        match self {
            FaultCause::Read => Prot::READ,
            FaultCause::Write => Prot::WRITE,
            FaultCause::Exec => Prot::EXEC,
        }
    }
}

/// Handle a user-mode fault at `vaddr`.
///
/// Either installs a mapping and returns, or terminates the current process
/// with the FAULT status (and never returns). The rejection path runs with
/// an empty frame: abandoned frames never run destructors, so `try_handle`
/// scopes every reference it takes.
pub fn handle_fault(vaddr: usize, cause: FaultCause) {
    if try_handle(vaddr, cause).is_err() {
        do_exit(Errno::EFAULT.as_i32());
    }
}

fn try_handle(vaddr: usize, cause: FaultCause) -> Result<(), ()> {
    let vfn = addr_to_pn(vaddr);
    let proc = sched::curproc();

    // Pull what we need out of the map and drop the lock before the object
    // walk.
    let looked_up: Option<(Arc<MemObject>, usize, Prot)> = {
        let map = proc.vmmap.lock();
        map.lookup(vfn).and_then(|area| {
            area.obj
                .as_ref()
                .map(|obj| (obj.clone(), area.off + vfn - area.start, area.prot))
        })
    };

    let (obj, pagenum, prot) = match looked_up {
        Some(v) => v,
        None => {
            log::debug!("pid {}: fault at {:#x} with no mapping", proc.pid(), vaddr);
            return Err(());
        }
    };

    if !prot.contains(cause.required_prot()) {
        log::debug!(
            "pid {}: {:?} fault at {:#x} denied by prot {:?}",
            proc.pid(),
            cause,
            vaddr,
            prot
        );
        return Err(());
    }

    let for_write = cause == FaultCause::Write;
    let frame = obj.lookup_page(pagenum, for_write).map_err(|_| ())?;

    if for_write {
        // Pin across the dirty so the marker is observed even if a cleaner
        // were to race in between.
        frame.pin();
        frame.dirty();
        frame.unpin();
    }

    let mut flags = PtFlags::PRESENT | PtFlags::USER;
    if for_write {
        flags |= PtFlags::WRITE;
    }
    let page_va = page_align_down(vaddr);
    proc.pagedir().map(page_va, frame.paddr, flags);
    tlb::flush(page_va);
    Ok(())
}

fn translated(vfn: usize, for_write: bool) -> Option<phys::PhysAddr> {
    let pd = pagetable::active()?;
    let entry = pd.translate(vfn)?;
    let mut need = PtFlags::PRESENT | PtFlags::USER;
    if for_write {
        need |= PtFlags::WRITE;
    }
    if entry.flags.contains(need) {
        Some(entry.paddr)
    } else {
        None
    }
}

fn user_copy(vaddr: usize, len: usize, cause: FaultCause, mut op: impl FnMut(phys::PhysAddr, usize, usize, usize)) {
    let for_write = cause == FaultCause::Write;
    let mut done = 0;
    while done < len {
        let cur = vaddr + done;
        let vfn = addr_to_pn(cur);
        let paddr = match translated(vfn, for_write) {
            Some(p) => p,
            None => {
                // Fault like the hardware would; either this returns with a
                // usable mapping installed or the process is gone.
                handle_fault(cur, cause);
                translated(vfn, for_write).expect("fault handler returned without mapping")
            }
        };
        let off = page_offset(cur);
        let n = core::cmp::min(len - done, PAGE_SIZE - off);
        op(paddr, off, done, n);
        done += n;
    }
}

/// User-mode load: read `buf.len()` bytes at `vaddr` through the MMU.
pub fn user_read(vaddr: usize, buf: &mut [u8]) {
    user_copy(vaddr, buf.len(), FaultCause::Read, |paddr, off, done, n| {
        phys::read_bytes(paddr, off, &mut buf[done..done + n]);
    });
}

/// User-mode store: write `data` at `vaddr` through the MMU.
pub fn user_write(vaddr: usize, data: &[u8]) {
    user_copy(vaddr, data.len(), FaultCause::Write, |paddr, off, done, n| {
        phys::write_bytes(paddr, off, &data[done..done + n]);
    });
}

/// User-mode instruction fetch probe at `vaddr`.
pub fn user_exec(vaddr: usize) {
    let mut byte = [0u8; 1];
    user_copy(vaddr, 1, FaultCause::Exec, |paddr, off, _, _| {
        phys::read_bytes(paddr, off, &mut byte);
    });
}
