//! fork(2).
//!
//! Clones the current process: address-space metadata is copied, shared
//! areas alias the parent's objects, and every private area gets *two* fresh
//! shadows — one for the parent, one for the child — both over the parent's
//! previous object and sharing its bottom. The parent's user page-table
//! range is then dropped and the TLB flushed globally, so its next write
//! re-faults and materializes into its own new shadow.
//!
//! The ELF loader and user trampoline are out of scope here, so the child's
//! thread begins in `child_main` instead of resuming a trap-frame snapshot;
//! everything else follows the classic sequence.

use crate::errno::Result;
use crate::memory::pagetable::tlb;
use crate::memory::shadow::shadow_create;
use crate::memory::vmmap::MapFlags;
use crate::memory::{USER_MEM_HIGH, USER_MEM_LOW};
use crate::task::process::{self, Pid, ProcState};
use crate::task::sched;
use crate::task::thread::Thread;
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Fork the current process. Returns the child's pid to the caller; the
/// child's thread runs `child_main` in the cloned address space.
pub fn do_fork(child_main: Box<dyn FnOnce() -> i64 + Send>) -> Result<Pid> {
    let parent = sched::curproc();
    assert_eq!(parent.state(), ProcState::Running, "fork from a dead process");

    let child = process::proc_create(parent.name())?;

    // Clone the map metadata, then reinstall backing objects area by area.
    {
        let mut parent_map = parent.vmmap.lock();
        let mut child_map = child.vmmap.lock();
        *child_map = parent_map.clone_metadata();

        for i in 0..child_map.areas().len() {
            let (start, shared) = {
                let a = &child_map.areas()[i];
                (a.start, a.flags.contains(MapFlags::SHARED))
            };
            let parent_obj = {
                let pa = parent_map
                    .lookup(start)
                    .expect("cloned area has no counterpart in the parent");
                pa.obj.clone().expect("parent area without a backing object")
            };

            if shared {
                // Shared mappings alias the same object; the clone above is
                // the child's reference.
                child_map.areas_mut()[i].set_obj(parent_obj);
            } else {
                let bottom = parent_obj.bottom_object();
                let parent_shadow = shadow_create(Arc::clone(&parent_obj), Arc::clone(&bottom));
                let child_shadow = shadow_create(parent_obj, bottom);
                parent_map
                    .lookup_mut(start)
                    .expect("parent area moved during fork")
                    .replace_obj(parent_shadow);
                child_map.areas_mut()[i].set_obj(child_shadow);
            }
        }
    }

    // Drop the parent's user mappings: it may still hold writable entries,
    // and copy-on-write needs its next write to trap.
    parent.pagedir().unmap_range(USER_MEM_LOW, USER_MEM_HIGH);
    tlb::flush_all();

    // Fresh stack, duplicated errno and cancellation flag; begins in
    // `child_main` under the child's page directory.
    let thr = Thread::clone_thread(&sched::curthr(), child.pagedir(), child_main)?;
    thr.set_proc(&child);
    child.attach_thread(&thr);

    // Descriptor table: one reference per occupied slot.
    let table = parent.files.lock().clone_for_fork();
    *child.files.lock() = table;

    // The child works in the parent's directory.
    if let Some(cwd) = parent.cwd() {
        child.set_cwd(cwd);
    }

    // Heap bookkeeping travels too.
    {
        let (start_brk, brk) = {
            let pb = parent.brk.lock();
            (pb.start_brk, pb.brk)
        };
        let mut cb = child.brk.lock();
        cb.start_brk = start_brk;
        cb.brk = brk;
    }

    sched::make_runnable(thr);
    log::debug!("pid {} forked child {}", parent.pid(), child.pid());
    Ok(child.pid())
}
