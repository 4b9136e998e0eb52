//! Address-space maps: sorted, non-overlapping vm-areas.
//!
//! Ranges are half-open `[start, end)` in virtual page numbers. The list is
//! kept sorted by start; insertion, removal (with splitting), gap search in
//! both directions, and the read/write walks used by the user-copy paths all
//! live here.

use crate::errno::{Errno, Result};
use crate::fs::vnode::Vnode;
use crate::memory::anon::anon_create;
use crate::memory::object::MemObject;
use crate::memory::pagetable::{self, tlb};
use crate::memory::shadow::shadow_create;
use crate::memory::{addr_to_pn, page_offset, pn_to_addr, PAGE_SIZE, USER_MEM_HIGH, USER_MEM_LOW};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Mapping protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    /// Mapping flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED  = 1 << 0;
        const PRIVATE = 1 << 1;
        const FIXED   = 1 << 2;
        const ANON    = 1 << 3;
    }
}

/// Gap-search direction for [`VmMap::find_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Lowest usable gap.
    LoHi,
    /// Highest usable gap.
    HiLo,
}

static NEXT_AREA_ID: AtomicU64 = AtomicU64::new(1);

/// A contiguous run of virtual pages mapped to a contiguous run of pages in
/// one memory object at a constant offset.
pub struct VmArea {
    id: u64,
    /// `[start, end)` virtual page numbers.
    pub start: usize,
    pub end: usize,
    /// Offset into the backing object, in pages.
    pub off: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub obj: Option<Arc<MemObject>>,
}

impl VmArea {
    fn new(start: usize, end: usize, off: usize, prot: Prot, flags: MapFlags) -> VmArea {
        VmArea {
            id: NEXT_AREA_ID.fetch_add(1, Ordering::Relaxed),
            start,
            end,
            off,
            prot,
            flags,
            obj: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn npages(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, vfn: usize) -> bool {
        self.start <= vfn && vfn < self.end
    }

    /// Install a backing object, registering the area with the chain's
    /// bottom object.
    pub(crate) fn set_obj(&mut self, obj: Arc<MemObject>) {
        obj.bottom_object().attach_area(self.id);
        self.obj = Some(obj);
    }

    /// Release the backing object, deregistering from the bottom object.
    fn release_obj(&mut self) {
        if let Some(obj) = self.obj.take() {
            obj.bottom_object().detach_area(self.id);
        }
    }

    /// Swap in a different backing object (fork's shadow interposition),
    /// releasing the reference to the old one.
    pub(crate) fn replace_obj(&mut self, obj: Arc<MemObject>) {
        self.release_obj();
        self.set_obj(obj);
    }
}

impl Drop for VmArea {
    fn drop(&mut self) {
        self.release_obj();
    }
}

/// An address-space map: areas sorted by start page, pairwise disjoint.
pub struct VmMap {
    areas: Vec<VmArea>,
}

impl VmMap {
    pub fn new() -> VmMap {
        VmMap { areas: Vec::new() }
    }

    /// Release every area and its backing-object reference.
    pub fn destroy(&mut self) {
        self.areas.clear();
    }

    pub fn areas(&self) -> &[VmArea] {
        &self.areas
    }

    pub(crate) fn areas_mut(&mut self) -> &mut [VmArea] {
        &mut self.areas
    }

    pub fn is_empty(&self) -> bool {
        self.areas.is_empty()
    }

    /// Add an area. It must be non-empty, unattached, and lie entirely
    /// within the user range; it must not overlap an existing area.
    pub fn insert(&mut self, area: VmArea) {
        assert!(area.start < area.end, "inserting an empty area");
        assert!(
            addr_to_pn(USER_MEM_LOW) <= area.start && area.end <= addr_to_pn(USER_MEM_HIGH),
            "area outside the user range"
        );
        let pos = self
            .areas
            .iter()
            .position(|a| a.start >= area.end)
            .unwrap_or(self.areas.len());
        if pos > 0 {
            assert!(self.areas[pos - 1].end <= area.start, "overlapping area insert");
        }
        self.areas.insert(pos, area);
    }

    /// First-fit search for `npages` of unmapped space. `HiLo` returns the
    /// highest such gap, `LoHi` the lowest. Gaps against both ends of the
    /// user range count.
    pub fn find_range(&self, npages: usize, dir: Dir) -> Option<usize> {
        assert!(npages > 0);
        let lo = addr_to_pn(USER_MEM_LOW);
        let hi = addr_to_pn(USER_MEM_HIGH);
        if self.areas.is_empty() {
            return if hi - lo >= npages {
                Some(match dir {
                    Dir::HiLo => hi - npages,
                    Dir::LoHi => lo,
                })
            } else {
                None
            };
        }
        match dir {
            Dir::HiLo => {
                let mut prev_start = hi;
                for area in self.areas.iter().rev() {
                    if prev_start - area.end >= npages {
                        return Some(prev_start - npages);
                    }
                    prev_start = area.start;
                }
                let first = &self.areas[0];
                if first.start - lo >= npages {
                    return Some(first.start - npages);
                }
                None
            }
            Dir::LoHi => {
                let mut prev_end = lo;
                for area in self.areas.iter() {
                    if area.start - prev_end >= npages {
                        return Some(prev_end);
                    }
                    prev_end = area.end;
                }
                let last = self.areas.last().unwrap();
                if hi - last.end >= npages {
                    return Some(last.end);
                }
                None
            }
        }
    }

    /// The area covering virtual page `vfn`, if any.
    pub fn lookup(&self, vfn: usize) -> Option<&VmArea> {
        self.areas.iter().find(|a| a.contains(vfn))
    }

    pub fn lookup_mut(&mut self, vfn: usize) -> Option<&mut VmArea> {
        self.areas.iter_mut().find(|a| a.contains(vfn))
    }

    /// Fork helper: a new map with every area's geometry copied and no
    /// backing objects — the caller reinstalls those.
    pub fn clone_metadata(&self) -> VmMap {
        let mut map = VmMap::new();
        for a in &self.areas {
            map.areas.push(VmArea::new(a.start, a.end, a.off, a.prot, a.flags));
        }
        map
    }

    /// True iff no area intersects `[startvfn, startvfn + npages)`.
    pub fn is_range_empty(&self, startvfn: usize, npages: usize) -> bool {
        let endvfn = startvfn + npages;
        assert!(startvfn < endvfn);
        !self
            .areas
            .iter()
            .any(|a| a.start < endvfn && a.end > startvfn)
    }

    /// Create a mapping of `npages` pages.
    ///
    /// With `lopage == 0` a free range is found via [`find_range`]; a given
    /// `lopage` evicts whatever it overlaps first. `file == None` maps
    /// zeroes from a fresh anonymous object, otherwise the vnode's `mmap`
    /// provides the object. PRIVATE mappings get a fresh shadow interposed
    /// whose bottom is the chain root. Returns the starting page number.
    pub fn map(
        &mut self,
        file: Option<Arc<dyn Vnode>>,
        lopage: usize,
        npages: usize,
        prot: Prot,
        flags: MapFlags,
        off_pages: usize,
        dir: Dir,
    ) -> Result<usize> {
        assert!(npages > 0, "empty mapping");
        assert!(
            flags.contains(MapFlags::SHARED) || flags.contains(MapFlags::PRIVATE),
            "mapping must be shared or private"
        );
        assert!(lopage == 0 || lopage >= addr_to_pn(USER_MEM_LOW));
        assert!(lopage == 0 || lopage + npages <= addr_to_pn(USER_MEM_HIGH));

        let lopage = if lopage == 0 {
            self.find_range(npages, dir).ok_or(Errno::ENOMEM)?
        } else {
            if !self.is_range_empty(lopage, npages) {
                self.remove(lopage, npages);
            }
            lopage
        };

        let area = VmArea::new(lopage, lopage + npages, off_pages, prot, flags);
        let area_id = area.id;
        self.insert(area);

        let obj = match file {
            None => anon_create(),
            Some(vn) => match vn.mmap() {
                Ok(o) => o,
                Err(e) => {
                    self.areas.retain(|a| a.id != area_id);
                    return Err(e);
                }
            },
        };

        let obj = if flags.contains(MapFlags::PRIVATE) {
            let bottom = obj.bottom_object();
            shadow_create(obj, bottom)
        } else {
            obj
        };

        let area = self
            .areas
            .iter_mut()
            .find(|a| a.id == area_id)
            .expect("freshly inserted area vanished");
        area.set_obj(obj);
        Ok(lopage)
    }

    /// Unmap `[lopage, lopage + npages)`.
    ///
    /// Each overlapping area falls into one of four cases: fully containing
    /// the range (split in two, the tail sharing the object with a fresh
    /// reference), overlapped on its right (shorten), overlapped on its left
    /// (advance start and offset), or fully covered (unlink and release).
    /// Afterwards the TLB is flushed and the page-table range dropped.
    pub fn remove(&mut self, lopage: usize, npages: usize) {
        let endvfn = lopage + npages;
        let mut splits: Vec<VmArea> = Vec::new();
        let mut i = 0;
        while i < self.areas.len() {
            let (astart, aend) = (self.areas[i].start, self.areas[i].end);
            if astart < lopage && aend > endvfn {
                // Range strictly inside: split.
                let a = &mut self.areas[i];
                let mut tail = VmArea::new(
                    endvfn,
                    aend,
                    a.off + (endvfn - astart),
                    a.prot,
                    a.flags,
                );
                if let Some(obj) = &a.obj {
                    tail.set_obj(obj.clone());
                }
                a.end = lopage;
                splits.push(tail);
                i += 1;
            } else if astart < lopage && aend > lopage && aend <= endvfn {
                // Right end overlapped: shorten.
                self.areas[i].end = lopage;
                i += 1;
            } else if astart >= lopage && astart < endvfn && aend > endvfn {
                // Left end overlapped: advance.
                let a = &mut self.areas[i];
                a.off += endvfn - astart;
                a.start = endvfn;
                i += 1;
            } else if astart >= lopage && aend <= endvfn {
                // Fully covered: unlink and release the object reference.
                self.areas.remove(i);
            } else {
                i += 1;
            }
        }
        for tail in splits {
            self.insert(tail);
        }

        tlb::flush_all();
        if let Some(pd) = pagetable::active() {
            pd.unmap_range(pn_to_addr(lopage), pn_to_addr(endvfn));
        }
    }

    /// Read `buf.len()` bytes from this address space at `vaddr`.
    ///
    /// Walks page by page: find the area, locate the frame through the
    /// backing object, and copy out. Permissions are deliberately not
    /// checked — this is the kernel-internal copy path.
    pub fn read(&self, vaddr: usize, buf: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = vaddr + done;
            let area = self.lookup(addr_to_pn(cur)).ok_or(Errno::EFAULT)?;
            let obj = area.obj.as_ref().ok_or(Errno::EFAULT)?;
            let pagenum = area.off + addr_to_pn(cur) - area.start;
            let frame = obj.lookup_page(pagenum, false)?;
            let off = page_offset(cur);
            let n = core::cmp::min(buf.len() - done, PAGE_SIZE - off);
            frame.read(off, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Write `data` into this address space at `vaddr`, dirtying each frame.
    pub fn write(&self, vaddr: usize, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = vaddr + done;
            let area = self.lookup(addr_to_pn(cur)).ok_or(Errno::EFAULT)?;
            let obj = area.obj.as_ref().ok_or(Errno::EFAULT)?;
            let pagenum = area.off + addr_to_pn(cur) - area.start;
            let frame = obj.lookup_page(pagenum, true)?;
            let off = page_offset(cur);
            let n = core::cmp::min(data.len() - done, PAGE_SIZE - off);
            frame.write(off, &data[done..done + n]);
            frame.dirty();
            done += n;
        }
        Ok(())
    }
}

impl Default for VmMap {
    fn default() -> Self {
        VmMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LO: usize = USER_MEM_LOW >> 12;
    const HI: usize = USER_MEM_HIGH >> 12;

    fn area(start: usize, end: usize) -> VmArea {
        VmArea::new(start, end, 0, Prot::READ, MapFlags::PRIVATE)
    }

    #[test]
    fn insert_keeps_areas_sorted() {
        let mut m = VmMap::new();
        m.insert(area(LO + 10, LO + 20));
        m.insert(area(LO + 30, LO + 40));
        m.insert(area(LO + 20, LO + 30));
        let starts: Vec<usize> = m.areas().iter().map(|a| a.start).collect();
        assert_eq!(starts, [LO + 10, LO + 20, LO + 30]);
    }

    #[test]
    fn find_range_lohi_prefers_low_gaps() {
        let mut m = VmMap::new();
        m.insert(area(LO + 10, LO + 20));
        assert_eq!(m.find_range(5, Dir::LoHi), Some(LO));
        assert_eq!(m.find_range(10, Dir::LoHi), Some(LO));
        assert_eq!(m.find_range(11, Dir::LoHi), Some(LO + 20));
    }

    #[test]
    fn find_range_hilo_prefers_high_gaps() {
        let mut m = VmMap::new();
        m.insert(area(HI - 20, HI - 10));
        assert_eq!(m.find_range(10, Dir::HiLo), Some(HI - 10));
        assert_eq!(m.find_range(11, Dir::HiLo), Some(HI - 20 - 11));
    }

    #[test]
    fn find_range_empty_map_uses_whole_range() {
        let m = VmMap::new();
        assert_eq!(m.find_range(1, Dir::LoHi), Some(LO));
        assert_eq!(m.find_range(1, Dir::HiLo), Some(HI - 1));
    }

    #[test]
    fn is_range_empty_detects_overlap() {
        let mut m = VmMap::new();
        m.insert(area(LO + 10, LO + 20));
        assert!(m.is_range_empty(LO, 10));
        assert!(!m.is_range_empty(LO + 19, 1));
        assert!(m.is_range_empty(LO + 20, 1));
    }

    #[test]
    fn remove_shortens_and_splits() {
        let mut m = VmMap::new();
        m.insert(area(LO + 10, LO + 40));
        // Punch a hole in the middle: split into two.
        m.remove(LO + 20, 10);
        let ranges: Vec<(usize, usize, usize)> =
            m.areas().iter().map(|a| (a.start, a.end, a.off)).collect();
        assert_eq!(ranges, [(LO + 10, LO + 20, 0), (LO + 30, LO + 40, 20)]);
        // Shave the right end of the first piece.
        m.remove(LO + 15, 5);
        assert_eq!(m.areas()[0].end, LO + 15);
        // Shave the left end of the second piece; its offset advances.
        m.remove(LO + 30, 5);
        assert_eq!(m.areas()[1].start, LO + 35);
        assert_eq!(m.areas()[1].off, 25);
        // Cover everything.
        m.remove(LO, 100);
        assert!(m.is_empty());
    }
}
