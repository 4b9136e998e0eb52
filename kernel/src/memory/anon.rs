//! Anonymous memory objects: zero-filled, non-persistent.
//!
//! Used directly for anonymous mappings and as the bottom of private chains.

use crate::errno::Result;
use crate::memory::object::{MemObject, ObjectKind};
use crate::memory::phys::{self, PhysAddr};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Live anonymous objects; lets tests observe the self-collect rule.
static ANON_LIVE: AtomicU64 = AtomicU64::new(0);

pub fn anon_create() -> Arc<MemObject> {
    ANON_LIVE.fetch_add(1, Ordering::Relaxed);
    MemObject::with_kind(ObjectKind::Anon)
}

pub fn anon_count() -> u64 {
    ANON_LIVE.load(Ordering::Relaxed)
}

pub(crate) fn note_destroyed() {
    ANON_LIVE.fetch_sub(1, Ordering::Relaxed);
}

/// Fill: a fresh anonymous page is all zeroes.
pub(crate) fn fill_page(paddr: PhysAddr) -> Result<()> {
    phys::zero_page(paddr);
    Ok(())
}
