//! Memory objects: the protocol behind every mapping.
//!
//! An object provides pages at numbered offsets. Three kinds exist: the
//! zero-filled anonymous object, the copy-on-write shadow object, and the
//! file-backed object a vnode's `mmap` hands out. Resident page frames are
//! owned by their object; everything that *uses* an object (a vm-area, a
//! shadow child) owns an `Arc`, so the last dropped reference is exactly the
//! point at which the resident pages of an anon or shadow object can never
//! be reached again — teardown unpins and uncaches them and releases the
//! `shadowed`/`bottom` references exactly once.

use crate::errno::Result;
use crate::fs::vnode::Vnode;
use crate::memory::phys::{self, PhysAddr};
use crate::memory::{anon, shadow, PAGE_SIZE};
use crate::sync::spinlock::Spinlock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    /// Page-frame state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PframeFlags: u8 {
        /// Being filled; nobody else may observe the contents.
        const BUSY   = 1 << 0;
        /// Modified since fill; `clean_page` persists it.
        const DIRTY  = 1 << 1;
        /// May not be reclaimed.
        const PINNED = 1 << 2;
    }
}

/// Kernel bookkeeping for one resident page of an object. Owns the frame.
pub(crate) struct PageFrame {
    pub(crate) pagenum: usize,
    pub(crate) paddr: PhysAddr,
    pub(crate) flags: PframeFlags,
}

impl Drop for PageFrame {
    fn drop(&mut self) {
        // Uncache: the frame goes back to the allocator (unpinning is
        // implicit — pin state is meaningless once the owner is gone).
        phys::page_free(self.paddr);
    }
}

/// Links a shadow object into its chain.
pub(crate) struct ShadowChain {
    /// Immediate parent; `None` only transiently during teardown.
    pub(crate) shadowed: Option<Arc<MemObject>>,
    /// Root of the chain (anon or file object). A non-owning shortcut in
    /// spirit: held as a plain reference that is released exactly once,
    /// when this shadow dies.
    pub(crate) bottom: Arc<MemObject>,
}

pub(crate) enum ObjectKind {
    Anon,
    File(Arc<dyn Vnode>),
    Shadow(ShadowChain),
}

pub struct MemObject {
    id: u64,
    pub(crate) kind: ObjectKind,
    pub(crate) pages: Spinlock<BTreeMap<usize, PageFrame>>,
    /// Ids of vm-areas attached to this object; maintained only on bottom
    /// objects (anon/file), which back every area in their chain.
    areas: Spinlock<Vec<u64>>,
}

impl MemObject {
    pub(crate) fn with_kind(kind: ObjectKind) -> Arc<MemObject> {
        Arc::new(MemObject {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            pages: Spinlock::new(BTreeMap::new()),
            areas: Spinlock::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_shadow(&self) -> bool {
        matches!(self.kind, ObjectKind::Shadow(_))
    }

    pub fn is_anon(&self) -> bool {
        matches!(self.kind, ObjectKind::Anon)
    }

    /// The object shadowed by this one, if it is a shadow.
    pub fn shadow_parent(&self) -> Option<Arc<MemObject>> {
        match &self.kind {
            ObjectKind::Shadow(chain) => {
                Some(chain.shadowed.clone().expect("shadow chain broken"))
            }
            _ => None,
        }
    }

    /// The ultimate non-shadow object under `self` (self when not a shadow).
    pub fn bottom_object(self: &Arc<Self>) -> Arc<MemObject> {
        match &self.kind {
            ObjectKind::Shadow(chain) => chain.bottom.clone(),
            _ => self.clone(),
        }
    }

    /// Number of resident pages.
    pub fn resident_count(&self) -> usize {
        self.pages.lock().len()
    }

    // ── Area registry (bottom objects) ──────────────────────────────────

    pub(crate) fn attach_area(&self, area_id: u64) {
        self.areas.lock().push(area_id);
    }

    pub(crate) fn detach_area(&self, area_id: u64) {
        let mut areas = self.areas.lock();
        if let Some(pos) = areas.iter().position(|&id| id == area_id) {
            areas.swap_remove(pos);
        }
    }

    /// Ids of attached vm-areas (diagnostics and invariant checks).
    pub fn attached_areas(&self) -> Vec<u64> {
        self.areas.lock().clone()
    }

    // ── The object protocol ─────────────────────────────────────────────

    /// Find the frame providing page `pagenum` for this object.
    ///
    /// For anon and file objects the page is materialized in this object if
    /// absent. For shadows, `for_write = false` walks the chain for the
    /// first resident copy and falls through to the bottom object, while
    /// `for_write = true` materializes (and dirties) a private copy in this
    /// shadow — ancestors are never modified by writers.
    pub fn lookup_page(self: &Arc<Self>, pagenum: usize, for_write: bool) -> Result<PageRef> {
        match &self.kind {
            ObjectKind::Shadow(_) => shadow::lookup_page(self, pagenum, for_write),
            _ => self.get_frame(pagenum),
        }
    }

    /// Resident frame for `pagenum`, if any, without materializing one.
    pub(crate) fn get_resident(self: &Arc<Self>, pagenum: usize) -> Option<PageRef> {
        let pages = self.pages.lock();
        pages.get(&pagenum).map(|f| PageRef {
            obj: self.clone(),
            pagenum,
            paddr: f.paddr,
        })
    }

    /// Resident frame for `pagenum`, materializing and filling it if absent.
    pub(crate) fn get_frame(self: &Arc<Self>, pagenum: usize) -> Result<PageRef> {
        if let Some(r) = self.get_resident(pagenum) {
            return Ok(r);
        }

        let paddr = phys::page_alloc()?;
        {
            let mut pages = self.pages.lock();
            let prev = pages.insert(pagenum, PageFrame {
                pagenum,
                paddr,
                flags: PframeFlags::BUSY,
            });
            assert!(prev.is_none(), "page materialized twice");
        }

        // Fill with the pages lock dropped: shadow fill walks the chain and
        // may materialize pages in other objects.
        let filled = match &self.kind {
            ObjectKind::Anon => anon::fill_page(paddr),
            ObjectKind::File(vn) => fill_from_vnode(vn, pagenum, paddr),
            ObjectKind::Shadow(_) => shadow::fill_page(self, pagenum, paddr),
        };

        let mut pages = self.pages.lock();
        match filled {
            Ok(()) => {
                let frame = pages.get_mut(&pagenum).expect("filled frame vanished");
                assert!(frame.flags.contains(PframeFlags::BUSY));
                assert!(!frame.flags.contains(PframeFlags::PINNED), "filling a pinned frame");
                frame.flags.remove(PframeFlags::BUSY);
                // Anon and shadow pages stay pinned until teardown; there is
                // nowhere to refetch them from.
                if !matches!(self.kind, ObjectKind::File(_)) {
                    frame.flags.insert(PframeFlags::PINNED);
                }
                Ok(PageRef { obj: self.clone(), pagenum, paddr })
            }
            Err(e) => {
                pages.remove(&pagenum);
                Err(e)
            }
        }
    }

    /// Mark page `pagenum` dirty so a later `clean_page` persists it.
    pub fn dirty_page(&self, pagenum: usize) {
        let mut pages = self.pages.lock();
        let frame = pages.get_mut(&pagenum).expect("dirtying a non-resident page");
        frame.flags.insert(PframeFlags::DIRTY);
    }

    /// Write page `pagenum` back to its backing store and clear the dirty
    /// bit. For anon and shadow objects this is a write-through into the
    /// object's own resident copy; for file objects the bytes land in the
    /// vnode.
    pub fn clean_page(self: &Arc<Self>, pagenum: usize) -> Result<()> {
        match &self.kind {
            ObjectKind::File(vn) => {
                let paddr = {
                    let pages = self.pages.lock();
                    pages.get(&pagenum).expect("cleaning a non-resident page").paddr
                };
                clean_to_vnode(vn, pagenum, paddr)?;
            }
            _ => {
                let src = {
                    let pages = self.pages.lock();
                    pages.get(&pagenum).expect("cleaning a non-resident page").paddr
                };
                let dst = self.lookup_page(pagenum, true)?;
                if dst.paddr != src {
                    phys::copy_page(dst.paddr, src);
                }
            }
        }
        let mut pages = self.pages.lock();
        if let Some(frame) = pages.get_mut(&pagenum) {
            frame.flags.remove(PframeFlags::DIRTY);
        }
        Ok(())
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        match &self.kind {
            ObjectKind::Anon => anon::note_destroyed(),
            ObjectKind::Shadow(_) => shadow::note_destroyed(),
            ObjectKind::File(_) => {}
        }
        // Resident frames are freed when the page map drops below.
        //
        // A long fork chain must not unwind recursively: take the parent
        // link and walk it with a loop, freeing each exclusively-owned
        // ancestor as we go.
        if let ObjectKind::Shadow(chain) = &mut self.kind {
            let mut next = chain.shadowed.take();
            while let Some(obj) = next {
                next = match Arc::try_unwrap(obj) {
                    Ok(mut dead) => match &mut dead.kind {
                        // `dead` drops at the end of this arm with its own
                        // parent link already severed — no recursion.
                        ObjectKind::Shadow(c) => c.shadowed.take(),
                        _ => None,
                    },
                    Err(_) => None,
                };
            }
        }
    }
}

/// A located page: the owning object, the page number, and the frame.
///
/// Holding one keeps the owner alive, which keeps the frame resident.
pub struct PageRef {
    pub obj: Arc<MemObject>,
    pub pagenum: usize,
    pub paddr: PhysAddr,
}

impl PageRef {
    fn with_frame<R>(&self, f: impl FnOnce(&mut PageFrame) -> R) -> R {
        let mut pages = self.obj.pages.lock();
        let frame = pages.get_mut(&self.pagenum).expect("frame vanished under a PageRef");
        assert_eq!(frame.pagenum, self.pagenum);
        f(frame)
    }

    pub fn pin(&self) {
        self.with_frame(|fr| fr.flags.insert(PframeFlags::PINNED));
    }

    pub fn unpin(&self) {
        self.with_frame(|fr| fr.flags.remove(PframeFlags::PINNED));
    }

    pub fn dirty(&self) {
        self.with_frame(|fr| fr.flags.insert(PframeFlags::DIRTY));
    }

    pub fn is_dirty(&self) -> bool {
        self.with_frame(|fr| fr.flags.contains(PframeFlags::DIRTY))
    }

    /// Copy bytes out of the frame.
    pub fn read(&self, off: usize, buf: &mut [u8]) {
        phys::read_bytes(self.paddr, off, buf);
    }

    /// Copy bytes into the frame (does not set the dirty bit).
    pub fn write(&self, off: usize, data: &[u8]) {
        phys::write_bytes(self.paddr, off, data);
    }
}

// ── File-backed fill / clean ────────────────────────────────────────────

fn fill_from_vnode(vn: &Arc<dyn Vnode>, pagenum: usize, paddr: PhysAddr) -> Result<()> {
    let mut buf = alloc::vec![0u8; PAGE_SIZE];
    let mut read = 0;
    let off = pagenum * PAGE_SIZE;
    // Short reads near EOF leave the tail zeroed.
    while read < PAGE_SIZE {
        let n = vn.read(off + read, &mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    phys::write_bytes(paddr, 0, &buf);
    Ok(())
}

fn clean_to_vnode(vn: &Arc<dyn Vnode>, pagenum: usize, paddr: PhysAddr) -> Result<()> {
    let off = pagenum * PAGE_SIZE;
    let len = vn.len();
    if off >= len {
        return Ok(());
    }
    let n = core::cmp::min(PAGE_SIZE, len - off);
    let mut buf = alloc::vec![0u8; n];
    phys::read_bytes(paddr, 0, &mut buf);
    vn.write(off, &buf)?;
    Ok(())
}
