//! The process break.
//!
//! The dynamic region is at most one vm-area, beginning at the page of
//! `start_brk` (which the loader guarantees sits inside a non-empty
//! read/write data area). `do_brk` adjusts that area's end with page
//! granularity, bounded below by `start_brk` and above by the next mapping
//! or the user-space ceiling.

use crate::errno::{Errno, Result};
use crate::memory::vmmap::{Dir, MapFlags, Prot};
use crate::memory::{addr_to_pn, page_align_up, page_aligned, USER_MEM_HIGH};
use crate::task::sched;

/// Page number of the data area's last guaranteed page: the one holding
/// `start_brk`, or the one below it when `start_brk` is page-aligned.
fn data_page(start_brk: usize) -> usize {
    if page_aligned(start_brk) {
        addr_to_pn(start_brk) - 1
    } else {
        addr_to_pn(start_brk)
    }
}

/// Stand-in for the loader: map the initial data/bss area covering `start`
/// and seed `start_brk = brk = start` for the current process.
pub fn setup_heap(start: usize) -> Result<()> {
    let proc = sched::curproc();
    // The data area must reach up to `start`; when `start` is page-aligned
    // the page below it is the tail of data/bss.
    let spn = data_page(start);
    {
        let mut map = proc.vmmap.lock();
        map.map(
            None,
            spn,
            1,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANON,
            0,
            Dir::LoHi,
        )?;
    }
    let mut brk = proc.brk.lock();
    brk.start_brk = start;
    brk.brk = start;
    Ok(())
}

/// Set the process break to `addr`; `addr == 0` queries the current break.
/// Returns the (new) break.
pub fn do_brk(addr: usize) -> Result<usize> {
    let proc = sched::curproc();

    if addr == 0 {
        return Ok(proc.brk.lock().brk);
    }

    let start_brk = proc.brk.lock().start_brk;
    if addr < start_brk || addr > USER_MEM_HIGH {
        return Err(Errno::ENOMEM);
    }

    {
        let mut map = proc.vmmap.lock();
        let (prev_end, area_start) = {
            let area = map.lookup(data_page(start_brk)).expect("break without a data area");
            (area.end, area.start)
        };
        let new_end = addr_to_pn(page_align_up(addr)).max(area_start + 1);

        if prev_end > new_end {
            map.remove(new_end, prev_end - new_end);
        } else if prev_end < new_end {
            if !map.is_range_empty(prev_end, new_end - prev_end) {
                return Err(Errno::ENOMEM);
            }
            map.lookup_mut(data_page(start_brk)).expect("break area vanished").end = new_end;
        }
    }

    proc.brk.lock().brk = addr;
    Ok(addr)
}
