//! Shadow objects: copy-on-write on top of another object.
//!
//! A shadow holds unique writes; reads that miss it walk down the chain to
//! the first resident copy, falling through to the bottom object. Chains
//! grow by one shadow per fork, so both lookup and fill are iterative —
//! recursion here would overflow the kernel stack on deep fork chains (the
//! teardown in `MemObject::drop` unwinds iteratively for the same reason).

use crate::errno::Result;
use crate::memory::object::{MemObject, ObjectKind, PageRef, ShadowChain};
use crate::memory::phys::{self, PhysAddr};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// Live shadow objects; lets tests observe chain teardown.
static SHADOW_LIVE: AtomicU64 = AtomicU64::new(0);

/// Create a shadow over `shadowed`.
///
/// `bottom` must be the root of `shadowed`'s chain; the caller computes it
/// with [`MemObject::bottom_object`] so repeated forks do not re-walk the
/// chain. The shadow owns one reference to each.
pub fn shadow_create(shadowed: Arc<MemObject>, bottom: Arc<MemObject>) -> Arc<MemObject> {
    assert!(!bottom.is_shadow(), "bottom of a shadow chain must be anon or file");
    SHADOW_LIVE.fetch_add(1, Ordering::Relaxed);
    MemObject::with_kind(ObjectKind::Shadow(ShadowChain {
        shadowed: Some(shadowed),
        bottom,
    }))
}

pub fn shadow_count() -> u64 {
    SHADOW_LIVE.load(Ordering::Relaxed)
}

pub(crate) fn note_destroyed() {
    SHADOW_LIVE.fetch_sub(1, Ordering::Relaxed);
}

/// Shadow page lookup.
///
/// Reading: return the first resident copy found walking down the chain,
/// else delegate to the bottom object. Writing: return the copy resident in
/// `obj` itself, materializing (and dirtying) it if absent — the fill pulls
/// the bytes from the chain, and ancestors are never touched.
pub(crate) fn lookup_page(obj: &Arc<MemObject>, pagenum: usize, for_write: bool) -> Result<PageRef> {
    if for_write {
        if let Some(r) = obj.get_resident(pagenum) {
            return Ok(r);
        }
        let r = obj.get_frame(pagenum)?;
        r.dirty();
        return Ok(r);
    }

    let mut cur = obj.clone();
    while cur.is_shadow() {
        if let Some(r) = cur.get_resident(pagenum) {
            return Ok(r);
        }
        let parent = cur.shadow_parent().expect("shadow chain broken");
        cur = parent;
    }
    // Fell off the chain: the bottom provides (materializing if needed).
    obj.bottom_object().get_frame(pagenum)
}

/// Fill a freshly materialized shadow page from the first resident copy in
/// the chain above, else from the bottom object.
pub(crate) fn fill_page(obj: &Arc<MemObject>, pagenum: usize, paddr: PhysAddr) -> Result<()> {
    let mut cur = obj.shadow_parent().expect("filling a shadow with no parent");
    loop {
        if let Some(src) = cur.get_resident(pagenum) {
            phys::copy_page(paddr, src.paddr);
            return Ok(());
        }
        if !cur.is_shadow() {
            break;
        }
        cur = cur.shadow_parent().expect("shadow chain broken");
    }
    let src = obj.bottom_object().get_frame(pagenum)?;
    phys::copy_page(paddr, src.paddr);
    Ok(())
}
