//! Page-directory bookkeeping and the TLB shim.
//!
//! `PageDir` records exactly what the hardware page tables would hold: a
//! mapping from virtual page to (frame, PRESENT/WRITE/USER). The hosted MMU
//! walk in `memory::fault` consults the *active* directory, which the
//! scheduler reloads on every context switch — the moral equivalent of the
//! page-table base register.

use crate::memory::phys::PhysAddr;
use crate::memory::{addr_to_pn, page_aligned};
use crate::sync::spinlock::Spinlock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Page-table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITE   = 1 << 1;
        const USER    = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PtEntry {
    pub paddr: PhysAddr,
    pub flags: PtFlags,
}

pub struct PageDir {
    entries: Spinlock<BTreeMap<usize, PtEntry>>,
}

impl PageDir {
    pub fn new() -> Arc<PageDir> {
        Arc::new(PageDir { entries: Spinlock::new(BTreeMap::new()) })
    }

    /// Install a mapping from the page containing `vaddr` to `paddr`.
    pub fn map(&self, vaddr: usize, paddr: PhysAddr, flags: PtFlags) {
        assert!(page_aligned(vaddr), "pt map of an unaligned address");
        self.entries.lock().insert(addr_to_pn(vaddr), PtEntry { paddr, flags });
    }

    /// Drop every mapping for `[lo, hi)` (virtual addresses, page aligned).
    pub fn unmap_range(&self, lo: usize, hi: usize) {
        assert!(page_aligned(lo) && page_aligned(hi));
        let (lopn, hipn) = (addr_to_pn(lo), addr_to_pn(hi));
        self.entries.lock().retain(|&pn, _| pn < lopn || pn >= hipn);
    }

    /// Translate a virtual address to its physical address, if mapped.
    pub fn virt_to_phys(&self, vaddr: usize) -> Option<PhysAddr> {
        let e = self.translate(addr_to_pn(vaddr))?;
        let off = vaddr & (crate::memory::PAGE_SIZE - 1);
        Some(PhysAddr::new(e.paddr.as_usize() + off))
    }

    /// Look up the entry for a virtual page number.
    pub fn translate(&self, vpn: usize) -> Option<PtEntry> {
        self.entries.lock().get(&vpn).copied()
    }

    /// Number of live mappings (diagnostics).
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}

// ── Active directory (the page-table base register) ─────────────────────

static ACTIVE: Spinlock<Option<Arc<PageDir>>> = Spinlock::new(None);

/// Reload the page-table base with `pd`.
pub fn activate(pd: Arc<PageDir>) {
    *ACTIVE.lock() = Some(pd);
}

/// The directory the MMU is currently walking.
pub fn active() -> Option<Arc<PageDir>> {
    ACTIVE.lock().clone()
}

/// Clear the active directory (shutdown only).
pub fn deactivate() {
    *ACTIVE.lock() = None;
}

// ── TLB shim ────────────────────────────────────────────────────────────

pub mod tlb {
    use super::*;

    static SINGLE_FLUSHES: AtomicU64 = AtomicU64::new(0);
    static FULL_FLUSHES: AtomicU64 = AtomicU64::new(0);

    /// Invalidate the TLB entry for one page.
    pub fn flush(vaddr: usize) {
        let _ = vaddr;
        SINGLE_FLUSHES.fetch_add(1, Ordering::Relaxed);
    }

    /// Invalidate the whole TLB.
    pub fn flush_all() {
        FULL_FLUSHES.fetch_add(1, Ordering::Relaxed);
    }

    /// (single-entry, full) flush counts since boot; diagnostics.
    pub fn flush_counts() -> (u64, u64) {
        (SINGLE_FLUSHES.load(Ordering::Relaxed), FULL_FLUSHES.load(Ordering::Relaxed))
    }
}
