//! Virtual-memory subsystem: physical pages, page tables, memory objects
//! (anonymous / shadow / file-backed), address-space maps, the page-fault
//! handler, and the brk/mmap surface.

pub mod anon;
pub mod brk;
pub mod fault;
pub mod mmap;
pub mod object;
pub mod pagetable;
pub mod phys;
pub mod shadow;
pub mod vmmap;

use static_assertions::const_assert;

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// User virtual address range, page granular, [low, high).
pub const USER_MEM_LOW: usize = 0x0040_0000;
pub const USER_MEM_HIGH: usize = 0xc000_0000;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(USER_MEM_LOW % PAGE_SIZE == 0);
const_assert!(USER_MEM_HIGH % PAGE_SIZE == 0);

/// Virtual address → virtual page number.
#[inline]
pub fn addr_to_pn(addr: usize) -> usize {
    addr >> PAGE_SHIFT
}

/// Virtual page number → virtual address of its first byte.
#[inline]
pub fn pn_to_addr(pn: usize) -> usize {
    pn << PAGE_SHIFT
}

/// Offset of `addr` within its page.
#[inline]
pub fn page_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

#[inline]
pub fn page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub fn page_align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub fn page_align_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
