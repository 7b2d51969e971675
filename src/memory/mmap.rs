//! Address-space / region manager.
//!
//! An address space is an ordered set of non-overlapping regions keyed
//! by start address over one page directory; everything not covered by
//! a region is a hole. Placement searches holes from the bottom, or
//! from the top for stacks; FIXED mappings evict whatever they overlap
//! first. Protection changes split regions at the boundaries, with all
//! validation done before the first mutation so a failed call leaves
//! the space untouched.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::KResult;
use crate::arch::x86_64::paging;
use crate::ds::queue::Whence;
use crate::errno::Error;
use crate::memory::region::{
    MapFlags, MmuFlags, PAGE_SIZE, Prot, VmFlags, Vmr, page_aligned, page_round_up,
};
use crate::sync::spinlock::{SpinGuard, SpinLock};

/// Highest user-addressable byte.
pub const USER_LIMIT: u64 = 0x0000_7fff_ffff_ffff;

/// Low addresses reserved against null dereferences.
const NULL_GUARD_SIZE: u64 = 0x0100_0000;

pub struct MmapInner {
    regions: BTreeMap<u64, Vmr>,
    pgdir: u64,
    used_space: u64,
    limit: u64,
    guard_len: u64,
    user: bool,
    pub brk: u64,
    pub heap: Option<u64>,
    pub arg: Option<u64>,
    pub env: Option<u64>,
}

pub struct AddressSpace {
    inner: SpinLock<MmapInner>,
}

impl AddressSpace {
    /// Allocate a user address space: fresh page directory plus the
    /// reserved low region.
    pub fn alloc() -> KResult<Arc<AddressSpace>> {
        let pgdir = paging::alloc_pgdir()?;
        let mut inner = MmapInner {
            regions: BTreeMap::new(),
            pgdir,
            used_space: 0,
            limit: USER_LIMIT,
            guard_len: PAGE_SIZE,
            user: true,
            brk: 0,
            heap: None,
            arg: None,
            env: None,
        };
        let null_guard = Vmr::new(
            0,
            NULL_GUARD_SIZE - 1,
            VmFlags::DONTEXPAND | VmFlags::GUARD,
            true,
        );
        inner.insert(null_guard);
        Ok(Arc::new(AddressSpace { inner: SpinLock::new(inner) }))
    }

    pub fn lock(&self) -> SpinGuard<'_, MmapInner> {
        self.inner.lock()
    }

    /// Map a region. Returns the start of the usable range (for stacks,
    /// the page above the guard).
    pub fn map_region(&self, addr: u64, len: u64, prot: Prot, flags: MapFlags) -> KResult<u64> {
        self.lock().map_region(addr, len, prot, flags)
    }

    /// Remove all mappings intersecting `[addr, addr + len)`.
    pub fn unmap(&self, addr: u64, len: u64) -> KResult<()> {
        self.lock().unmap(addr, len)
    }

    /// Change protection of `[addr, addr + len)`, splitting the covering
    /// region as needed.
    pub fn protect(&self, addr: u64, len: u64, prot: Prot) -> KResult<()> {
        self.lock().protect(addr, len, prot)
    }

    /// Designate the heap region and set the initial break.
    pub fn set_heap(&self, start: u64) -> KResult<()> {
        let mut inner = self.lock();
        let (r_start, brk) = {
            let vmr = inner.find(start).ok_or(Error::NoEnt)?;
            (vmr.start, vmr.upper_bound())
        };
        if r_start != start {
            return Err(Error::Inval);
        }
        inner.heap = Some(start);
        inner.brk = brk;
        Ok(())
    }

    /// Grow or shrink the heap region by `incr` bytes (page-rounded).
    /// Returns the new break.
    pub fn sbrk(&self, incr: i64) -> KResult<u64> {
        self.lock().sbrk(incr)
    }

    /// Allocate a stack: RW, private, guard page below, placed at the
    /// highest fitting hole. Returns (base, length) of the usable range.
    pub fn alloc_stack(&self, size: u64) -> KResult<(u64, u64)> {
        let size = page_round_up(size);
        let base = self.map_region(0, size, Prot::READ | Prot::WRITE, MapFlags::STACK | MapFlags::PRIVATE)?;
        Ok((base, size))
    }

    /// Validate that `addr` falls in a stack region; returns its bounds.
    pub fn find_stack(&self, addr: u64) -> KResult<(u64, u64)> {
        let inner = self.lock();
        let vmr = inner.find(addr).ok_or(Error::Fault)?;
        if !vmr.is_stack() {
            return Err(Error::Fault);
        }
        Ok((vmr.start, vmr.size()))
    }

    /// Region containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<Vmr> {
        self.lock().find(addr).cloned()
    }

    pub fn used_space(&self) -> u64 {
        self.lock().used_space
    }

    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    /// Regions in ascending order.
    pub fn regions_snapshot(&self) -> Vec<Vmr> {
        self.lock().regions.values().cloned().collect()
    }

    pub fn pgdir(&self) -> u64 {
        self.lock().pgdir
    }

    /// Load this space's page directory; returns the previous one.
    pub fn set_focus(&self) -> u64 {
        paging::switch_pgdir(self.lock().pgdir)
    }

    /// Duplicate the space: every region is copied, physical pages are
    /// shared copy-on-write through the architecture hook.
    pub fn clone_space(&self) -> KResult<Arc<AddressSpace>> {
        let src = self.lock();
        let pgdir = paging::alloc_pgdir()?;
        let inner = MmapInner {
            regions: src.regions.clone(),
            pgdir,
            used_space: src.used_space,
            limit: src.limit,
            guard_len: src.guard_len,
            user: src.user,
            brk: src.brk,
            heap: src.heap,
            arg: src.arg,
            env: src.env,
        };
        paging::lazy_copy(pgdir, src.pgdir)?;
        Ok(Arc::new(AddressSpace { inner: SpinLock::new(inner) }))
    }

    /// Copy argv/envp into fresh arg and env regions, eagerly paged in.
    /// Returns (argv pointer, argc, envp pointer) in the target space.
    pub fn argenvcpy(&self, argv: &[&str], envp: &[&str]) -> KResult<(u64, usize, u64)> {
        let argv_va = self.copy_string_table(argv)?;
        {
            self.lock().arg = Some(argv_va);
        }
        let envp_va = self.copy_string_table(envp)?;
        {
            self.lock().env = Some(envp_va);
        }
        Ok((argv_va, argv.len(), envp_va))
    }

    /// Lay out a NULL-terminated pointer table followed by the strings
    /// in one private region; returns the table's address.
    fn copy_string_table(&self, strings: &[&str]) -> KResult<u64> {
        let table_bytes = (strings.len() as u64 + 1) * 8;
        let string_bytes: u64 = strings.iter().map(|s| s.len() as u64 + 1).sum();
        let total = page_round_up(table_bytes + string_bytes);

        let base = self.map_region(
            0,
            total,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::DONTEXPAND,
        )?;

        let (pgdir, mmu) = {
            let inner = self.lock();
            let mmu = inner.find(base).map(|r| r.mmu).unwrap_or(MmuFlags::empty());
            (inner.pgdir, mmu)
        };
        paging::map_range(pgdir, base, total, mmu)?;

        let mut image: Vec<u8> = Vec::with_capacity(total as usize);
        image.resize((table_bytes + string_bytes) as usize, 0);
        let mut cursor = table_bytes;
        for (i, s) in strings.iter().enumerate() {
            let ptr = base + cursor;
            image[i * 8..i * 8 + 8].copy_from_slice(&ptr.to_le_bytes());
            image[cursor as usize..cursor as usize + s.len()].copy_from_slice(s.as_bytes());
            cursor += s.len() as u64 + 1;
        }
        paging::copy_out(pgdir, base, &image)?;
        Ok(base)
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        for vmr in self.regions.values() {
            paging::unmap_range(self.pgdir, vmr.start, vmr.size());
        }
        paging::free_pgdir(self.pgdir);
    }
}

impl MmapInner {
    /// Start key of the region containing `addr`.
    fn key_containing(&self, addr: u64) -> Option<u64> {
        self.regions
            .range(..=addr)
            .next_back()
            .filter(|(_, r)| r.contains(addr))
            .map(|(k, _)| *k)
    }

    pub fn find(&self, addr: u64) -> Option<&Vmr> {
        self.key_containing(addr).and_then(|k| self.regions.get(&k))
    }

    fn is_hole(&self, addr: u64) -> bool {
        self.key_containing(addr).is_none()
    }

    /// Size of the hole starting at `addr`; `Inval` if `addr` is mapped.
    fn hole_size(&self, addr: u64) -> KResult<u64> {
        if addr > self.limit || !self.is_hole(addr) {
            return Err(Error::Inval);
        }
        match self.regions.range(addr..).next() {
            Some((start, _)) => Ok(start - addr),
            None => Ok(self.limit + 1 - addr),
        }
    }

    /// First-fit hole search. `Head` walks addresses upward; `Tail`
    /// returns the highest fitting hole.
    fn find_hole(&self, size: u64, whence: Whence) -> KResult<u64> {
        match whence {
            Whence::Head => {
                let mut cursor = 0u64;
                for r in self.regions.values() {
                    if r.start > cursor && r.start - cursor >= size {
                        return Ok(cursor);
                    }
                    cursor = cursor.max(r.upper_bound());
                }
                if self.limit + 1 - cursor >= size {
                    return Ok(cursor);
                }
                Err(Error::NoMem)
            }
            Whence::Tail => {
                let mut ceiling = self.limit + 1;
                for r in self.regions.values().rev() {
                    if ceiling > r.upper_bound() && ceiling - r.upper_bound() >= size {
                        return Ok(ceiling - size);
                    }
                    ceiling = ceiling.min(r.start);
                }
                if ceiling >= size {
                    return Ok(ceiling - size);
                }
                Err(Error::NoMem)
            }
        }
    }

    /// Hole search honoring a placement hint.
    fn find_hole_at(&self, addr: u64, size: u64, whence: Whence) -> KResult<u64> {
        if addr != 0 && page_aligned(addr) && self.is_hole(addr) {
            if let Ok(hole) = self.hole_size(addr) {
                if hole >= size {
                    return Ok(addr);
                }
            }
        }
        self.find_hole(size, whence)
    }

    /// Insert a region known not to overlap anything.
    fn insert(&mut self, vmr: Vmr) {
        debug_assert!(self.is_hole(vmr.start) && self.is_hole(vmr.end));
        self.used_space += vmr.size();
        self.regions.insert(vmr.start, vmr);
    }

    /// Remove a whole region, returning its frames.
    fn remove_at(&mut self, key: u64) -> Vmr {
        let vmr = self.regions.remove(&key).expect("region key vanished");
        self.used_space -= vmr.size();
        paging::unmap_range(self.pgdir, vmr.start, vmr.size());
        if self.heap == Some(key) {
            self.heap = None;
            self.brk = 0;
        }
        if self.arg == Some(key) {
            self.arg = None;
        }
        if self.env == Some(key) {
            self.env = None;
        }
        vmr
    }

    pub fn map_region(&mut self, addr: u64, len: u64, prot: Prot, flags: MapFlags) -> KResult<u64> {
        if len == 0 {
            return Err(Error::Inval);
        }

        let fixed = flags.contains(MapFlags::FIXED);
        let stack = flags.contains(MapFlags::STACK);

        if fixed && (!page_aligned(addr) || addr.checked_add(len - 1).is_none_or(|e| e > self.limit)) {
            return Err(Error::Inval);
        }
        if stack && !page_aligned(addr) {
            return Err(Error::Inval);
        }
        // Exactly one of PRIVATE and SHARED.
        if flags.contains(MapFlags::PRIVATE) == flags.contains(MapFlags::SHARED) {
            return Err(Error::Inval);
        }
        // A stack is read-write, nothing more.
        if stack && prot != Prot::READ | Prot::WRITE {
            return Err(Error::Inval);
        }

        let len = page_round_up(len);
        let total = if stack { len + self.guard_len } else { len };
        let whence = if stack { Whence::Tail } else { Whence::Head };

        let start = if fixed {
            self.unmap(addr, total)?;
            addr
        } else {
            self.find_hole_at(addr, total, whence)?
        };

        let vm_flags = Vmr::flags_from_request(prot, flags);
        if stack {
            // Unreadable guard page below the usable range.
            let guard = Vmr::new(
                start,
                start + self.guard_len - 1,
                VmFlags::GUARD | VmFlags::GROWSDOWN | VmFlags::DONTEXPAND,
                self.user,
            );
            let body = Vmr::new(start + self.guard_len, start + total - 1, vm_flags, self.user);
            let base = body.start;
            self.insert(guard);
            self.insert(body);
            Ok(base)
        } else {
            self.insert(Vmr::new(start, start + len - 1, vm_flags, self.user));
            Ok(start)
        }
    }

    pub fn unmap(&mut self, addr: u64, len: u64) -> KResult<()> {
        if len == 0 || !page_aligned(addr) {
            return Err(Error::Inval);
        }
        let len = page_round_up(len);
        let end = addr.checked_add(len).ok_or(Error::Inval)?;
        if end - 1 > self.limit {
            return Err(Error::Inval);
        }

        let mut at = addr;
        while at < end {
            let Some(key) = self.key_containing(at) else {
                // Hole; skip to the next region or finish.
                match self.regions.range(at..).next().map(|(s, _)| *s) {
                    Some(next) if next < end => at = next,
                    _ => break,
                }
                continue;
            };

            let (r_start, r_up) = {
                let r = &self.regions[&key];
                (r.start, r.upper_bound())
            };

            if at == r_start && end >= r_up {
                // Exact or full cover: drop the region.
                self.remove_at(key);
                at = r_up;
            } else if at == r_start {
                // Head trim.
                let mut r = self.regions.remove(&key).expect("region key vanished");
                let cut = end - r_start;
                paging::unmap_range(self.pgdir, r_start, cut);
                self.used_space -= cut;
                r.start = end;
                if let Some(f) = &mut r.file {
                    f.off += cut;
                }
                self.regions.insert(end, r);
                at = end;
            } else if end >= r_up {
                // Tail trim.
                let cut = r_up - at;
                paging::unmap_range(self.pgdir, at, cut);
                self.used_space -= cut;
                self.regions.get_mut(&key).expect("region key vanished").end = at - 1;
                at = r_up;
            } else {
                // Cut out the middle: left piece keeps the key, right
                // piece is re-inserted past the cut.
                let mut left = self.regions.remove(&key).expect("region key vanished");
                let mut right = left.clone();
                left.end = at - 1;
                right.start = end;
                if let Some(f) = &mut right.file {
                    f.off += end - r_start;
                }
                paging::unmap_range(self.pgdir, at, end - at);
                self.used_space -= end - at;
                self.regions.insert(left.start, left);
                self.regions.insert(end, right);
                at = end;
            }
        }
        Ok(())
    }

    pub fn protect(&mut self, addr: u64, len: u64, prot: Prot) -> KResult<()> {
        if len == 0 || !page_aligned(addr) || !page_aligned(len) {
            return Err(Error::Inval);
        }
        let end = addr + len - 1;
        if end > self.limit {
            return Err(Error::NoMem);
        }

        // The whole range must fall inside a single region.
        let key = self.key_containing(addr).ok_or(Error::NoMem)?;
        let covering = self.regions[&key].clone();
        if covering.end < end {
            return Err(Error::NoMem);
        }
        if covering.is_stack() || covering.is_guard() {
            return Err(Error::Acces);
        }

        let current = covering.prot();
        if current == prot {
            return Ok(());
        }
        // W^X across the transition.
        if prot.contains(Prot::WRITE) && prot.contains(Prot::EXEC) {
            return Err(Error::Acces);
        }
        if prot.contains(Prot::WRITE) && current.contains(Prot::EXEC) {
            return Err(Error::Acces);
        }
        if prot.contains(Prot::EXEC) && current.contains(Prot::WRITE) {
            return Err(Error::Acces);
        }

        // Validation complete; every mutation below succeeds, so the
        // split never needs reversing.
        self.regions.remove(&key);

        let mut mid = covering.clone();
        mid.start = addr;
        mid.end = end;
        if let Some(f) = &mut mid.file {
            f.off += addr - covering.start;
        }
        mid.set_prot(prot, self.user);
        let mid_mmu = mid.mmu;

        if covering.start < addr {
            let mut left = covering.clone();
            left.end = addr - 1;
            self.regions.insert(left.start, left);
        }
        if covering.end > end {
            let mut right = covering.clone();
            right.start = end + 1;
            if let Some(f) = &mut right.file {
                f.off += (end + 1) - covering.start;
            }
            self.regions.insert(right.start, right);
        }
        self.regions.insert(mid.start, mid);

        paging::protect_range(self.pgdir, addr, len, mid_mmu)
    }

    /// Resize a region in place. Growth claims hole space adjacent to
    /// the region's growth end; shrinking to zero removes it. Regions
    /// marked DONTEXPAND refuse both.
    pub fn expand(&mut self, start: u64, incr: i64) -> KResult<()> {
        if incr == 0 {
            return Ok(());
        }
        let key = self.key_containing(start).ok_or(Error::NoEnt)?;
        let (r_start, r_up, size, flags) = {
            let r = &self.regions[&key];
            (r.start, r.upper_bound(), r.size(), r.flags)
        };
        if flags.contains(VmFlags::DONTEXPAND) {
            return Err(Error::Inval);
        }
        let grows_down = flags.contains(VmFlags::GROWSDOWN);

        if incr > 0 {
            let grow = page_round_up(incr as u64);
            if grows_down {
                let new_start = r_start.checked_sub(grow).ok_or(Error::NoMem)?;
                if !self.is_hole(new_start) || self.hole_size(new_start)? < grow {
                    return Err(Error::NoMem);
                }
                let mut r = self.regions.remove(&key).expect("region key vanished");
                r.start = new_start;
                self.regions.insert(new_start, r);
            } else {
                if !self.is_hole(r_up) || self.hole_size(r_up)? < grow {
                    return Err(Error::NoMem);
                }
                self.regions.get_mut(&key).expect("region key vanished").end = r_up + grow - 1;
            }
            self.used_space += grow;
            return Ok(());
        }

        let shrink = page_round_up((-incr) as u64);
        if shrink > size {
            return Err(Error::Inval);
        }
        if shrink == size {
            self.remove_at(key);
            return Ok(());
        }
        if grows_down {
            let mut r = self.regions.remove(&key).expect("region key vanished");
            paging::unmap_range(self.pgdir, r.start, shrink);
            r.start += shrink;
            if let Some(f) = &mut r.file {
                f.off += shrink;
            }
            self.regions.insert(r.start, r);
        } else {
            paging::unmap_range(self.pgdir, r_up - shrink, shrink);
            self.regions.get_mut(&key).expect("region key vanished").end = r_up - shrink - 1;
        }
        self.used_space -= shrink;
        Ok(())
    }

    /// Move the heap break; the heap region tracks it.
    pub fn sbrk(&mut self, incr: i64) -> KResult<u64> {
        let heap = self.heap.ok_or(Error::NoEnt)?;
        if incr != 0 {
            self.expand(heap, incr)?;
            // A fully collapsed heap loses its marker.
            if self.key_containing(heap).is_none() {
                self.heap = None;
                self.brk = heap;
                return Ok(heap);
            }
        }
        let brk = self.find(heap).map(|r| r.upper_bound()).ok_or(Error::NoEnt)?;
        self.brk = brk;
        Ok(brk)
    }

    /// Structural validator: ascending, non-overlapping, page-aligned,
    /// and `used_space` equals the byte sum of all regions.
    pub fn assert_consistent(&self) {
        let mut prev_end: Option<u64> = None;
        let mut total = 0u64;
        for (key, r) in self.regions.iter() {
            assert_eq!(*key, r.start, "region keyed off its start");
            assert!(page_aligned(r.start), "unaligned region start {:#x}", r.start);
            assert!(page_aligned(r.upper_bound()), "unaligned region end {:#x}", r.end);
            assert!(r.end >= r.start);
            if let Some(prev) = prev_end {
                assert!(r.start > prev, "overlapping regions at {:#x}", r.start);
            }
            prev_end = Some(r.end);
            total += r.size();
        }
        assert_eq!(total, self.used_space, "used_space out of sync");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 0x10_0000;

    fn space() -> Arc<AddressSpace> {
        AddressSpace::alloc().unwrap()
    }

    // Fixed placements land above the reserved null-guard region.
    const BASE: u64 = 0x4000_0000;

    #[test]
    fn map_fixed_and_find_round_trip() {
        let mm = space();
        let start = mm
            .map_region(BASE, 8 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        assert_eq!(start, BASE);

        let r = mm.find(BASE + 3 * PAGE_SIZE).expect("mapped address resolves");
        assert_eq!(r.start, BASE);
        assert_eq!(r.size(), 8 * PAGE_SIZE);

        // Every page-aligned address in [start, end] resolves to the
        // same region; addresses outside resolve to nothing.
        for page in 0..8 {
            let hit = mm.find(BASE + page * PAGE_SIZE).unwrap();
            assert_eq!(hit.start, r.start);
            assert_eq!(hit.end, r.end);
        }
        assert!(mm.find(BASE + 8 * PAGE_SIZE).is_none());
        assert!(mm.find(BASE - PAGE_SIZE).is_none());
    }

    #[test]
    fn private_xor_shared_enforced() {
        let mm = space();
        assert_eq!(
            mm.map_region(0, PAGE_SIZE, Prot::READ, MapFlags::PRIVATE | MapFlags::SHARED),
            Err(Error::Inval)
        );
        assert_eq!(mm.map_region(0, PAGE_SIZE, Prot::READ, MapFlags::empty()), Err(Error::Inval));
    }

    #[test]
    fn hint_placement_and_hole_reuse() {
        let mm = space();
        let a = mm.map_region(BASE, 4 * PAGE_SIZE, Prot::READ, MapFlags::FIXED | MapFlags::PRIVATE).unwrap();
        let b = mm
            .map_region(BASE + 16 * PAGE_SIZE, 4 * PAGE_SIZE, Prot::READ, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        // A hinted non-fixed map in the gap takes the hint.
        let c = mm
            .map_region(BASE + 8 * PAGE_SIZE, 2 * PAGE_SIZE, Prot::READ, MapFlags::PRIVATE)
            .unwrap();
        assert_eq!(c, BASE + 8 * PAGE_SIZE);
        assert!(a < c && c < b);
        mm.lock().assert_consistent();
    }

    #[test]
    fn unmap_cases_exact_trim_split() {
        let mm = space();
        mm.map_region(BASE, 8 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        let before = mm.used_space();

        // Middle cut splits into two.
        mm.unmap(BASE + 3 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
        assert_eq!(mm.used_space(), before - 2 * PAGE_SIZE);
        assert!(mm.find(BASE + 3 * PAGE_SIZE).is_none());
        assert_eq!(mm.find(BASE).unwrap().end, BASE + 3 * PAGE_SIZE - 1);
        assert_eq!(mm.find(BASE + 5 * PAGE_SIZE).unwrap().start, BASE + 5 * PAGE_SIZE);

        // Head trim of the right piece.
        mm.unmap(BASE + 5 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(mm.find(BASE + 6 * PAGE_SIZE).unwrap().start, BASE + 6 * PAGE_SIZE);

        // Tail trim of the left piece.
        mm.unmap(BASE + 2 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(mm.find(BASE).unwrap().end, BASE + 2 * PAGE_SIZE - 1);

        // Exact removal, spanning a hole on the way.
        mm.unmap(BASE, 8 * PAGE_SIZE).unwrap();
        assert!(mm.find(BASE).is_none());
        mm.lock().assert_consistent();
    }

    #[test]
    fn fixed_mapping_evicts_overlap() {
        let mm = space();
        mm.map_region(BASE, 4 * PAGE_SIZE, Prot::READ, MapFlags::FIXED | MapFlags::PRIVATE).unwrap();
        let count = mm.region_count();
        mm.map_region(BASE + 2 * PAGE_SIZE, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        // Old region trimmed to [BASE, BASE+2p), new one in place.
        assert_eq!(mm.region_count(), count + 1);
        assert_eq!(mm.find(BASE).unwrap().end, BASE + 2 * PAGE_SIZE - 1);
        let r = mm.find(BASE + 2 * PAGE_SIZE).unwrap();
        assert!(r.writable());
        mm.lock().assert_consistent();
    }

    #[test]
    fn protect_splits_into_three() {
        // Map [0x1000, 0x9000) RW at a fixed base, reprotect the middle
        // read-only, expect three regions and unchanged used_space.
        let mm = space();
        mm.map_region(BASE, 8 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        let used = mm.used_space();
        let count = mm.region_count();

        mm.protect(BASE + 2 * PAGE_SIZE, 2 * PAGE_SIZE, Prot::READ).unwrap();

        assert_eq!(mm.used_space(), used);
        assert_eq!(mm.region_count(), count + 2);

        let left = mm.find(BASE).unwrap();
        let mid = mm.find(BASE + 2 * PAGE_SIZE).unwrap();
        let right = mm.find(BASE + 4 * PAGE_SIZE).unwrap();
        assert_eq!((left.start, left.end), (BASE, BASE + 2 * PAGE_SIZE - 1));
        assert_eq!((mid.start, mid.end), (BASE + 2 * PAGE_SIZE, BASE + 4 * PAGE_SIZE - 1));
        assert_eq!((right.start, right.end), (BASE + 4 * PAGE_SIZE, BASE + 8 * PAGE_SIZE - 1));
        assert!(left.writable() && right.writable());
        assert!(mid.readable() && !mid.writable());
        mm.lock().assert_consistent();
    }

    #[test]
    fn protect_enforces_wx_and_stack_rules() {
        let mm = space();
        mm.map_region(BASE, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        // Writable region may not become executable.
        assert_eq!(mm.protect(BASE, PAGE_SIZE, Prot::READ | Prot::EXEC), Err(Error::Acces));
        assert_eq!(
            mm.protect(BASE, PAGE_SIZE, Prot::READ | Prot::WRITE | Prot::EXEC),
            Err(Error::Acces)
        );

        let (stack, len) = mm.alloc_stack(4 * PAGE_SIZE).unwrap();
        assert_eq!(mm.protect(stack, len, Prot::READ), Err(Error::Acces));

        // A failed protect leaves the region whole.
        let count = mm.region_count();
        assert_eq!(mm.protect(BASE, PAGE_SIZE, Prot::READ | Prot::EXEC), Err(Error::Acces));
        assert_eq!(mm.region_count(), count);
    }

    #[test]
    fn stack_carries_separate_guard_below() {
        let mm = space();
        let (base, len) = mm.alloc_stack(16 * 1024).unwrap();
        assert_eq!(len, 16 * 1024);

        let stack = mm.find(base).unwrap();
        assert!(stack.is_stack());
        assert!(stack.readable() && stack.writable());
        assert_eq!(stack.size(), len);

        let guard = mm.find(base - 1).unwrap();
        assert!(guard.is_guard());
        assert!(!guard.readable() && !guard.writable());
        assert_eq!(guard.size(), PAGE_SIZE);
        assert_eq!(guard.upper_bound(), stack.start);

        // Stacks live in high memory.
        assert!(base > USER_LIMIT / 2);
        mm.lock().assert_consistent();
    }

    #[test]
    fn no_overlap_invariant_under_mixed_ops() {
        let mm = space();
        let mut rng = 0x1234_5678u64;
        let mut next = || {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            rng
        };

        for _ in 0..300 {
            let addr = BASE + (next() % 512) * PAGE_SIZE;
            let pages = 1 + next() % 16;
            match next() % 3 {
                0 => {
                    let _ = mm.map_region(
                        addr,
                        pages * PAGE_SIZE,
                        Prot::READ | Prot::WRITE,
                        MapFlags::FIXED | MapFlags::PRIVATE,
                    );
                }
                1 => {
                    let _ = mm.unmap(addr, pages * PAGE_SIZE);
                }
                _ => {
                    let _ = mm.protect(addr, pages * PAGE_SIZE, Prot::READ);
                }
            }
            mm.lock().assert_consistent();
        }

        let regions = mm.regions_snapshot();
        for pair in regions.windows(2) {
            assert!(pair[0].end < pair[1].start);
        }
    }

    #[test]
    fn clone_duplicates_regions() {
        let mm = space();
        mm.map_region(BASE, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        mm.alloc_stack(8 * PAGE_SIZE).unwrap();

        let clone = mm.clone_space().unwrap();
        assert_eq!(clone.used_space(), mm.used_space());
        assert_eq!(clone.region_count(), mm.region_count());
        assert_ne!(clone.pgdir(), mm.pgdir());

        // Mutating the clone leaves the original alone.
        clone.unmap(BASE, PAGE_SIZE).unwrap();
        assert!(clone.find(BASE).is_none());
        assert!(mm.find(BASE).is_some());
    }

    #[test]
    fn argenvcpy_lays_out_tables() {
        let mm = space();
        let (argv_ptr, argc, envp_ptr) = mm.argenvcpy(&["/sbin/init", "-s"], &["TERM=corvus"]).unwrap();
        assert_eq!(argc, 2);
        assert_ne!(argv_ptr, 0);
        assert_ne!(envp_ptr, 0);
        assert_ne!(argv_ptr, envp_ptr);

        let arg_region = mm.find(argv_ptr).unwrap();
        assert!(arg_region.readable() && arg_region.writable());
        assert!(arg_region.flags.contains(VmFlags::DONTEXPAND));
        assert_eq!(mm.lock().arg, Some(argv_ptr));
        assert_eq!(mm.lock().env, Some(envp_ptr));
    }

    #[test]
    fn sbrk_grows_and_shrinks_the_heap() {
        let mm = space();
        mm.map_region(BASE, 4 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        mm.set_heap(BASE).unwrap();

        let brk = mm.sbrk(0).unwrap();
        assert_eq!(brk, BASE + 4 * PAGE_SIZE);

        let brk = mm.sbrk(3 * PAGE_SIZE as i64).unwrap();
        assert_eq!(brk, BASE + 7 * PAGE_SIZE);
        assert_eq!(mm.find(BASE).unwrap().size(), 7 * PAGE_SIZE);

        let brk = mm.sbrk(-(2 * PAGE_SIZE as i64)).unwrap();
        assert_eq!(brk, BASE + 5 * PAGE_SIZE);

        // Growth stops at the next mapping.
        mm.map_region(BASE + 6 * PAGE_SIZE, PAGE_SIZE, Prot::READ, MapFlags::FIXED | MapFlags::PRIVATE)
            .unwrap();
        assert_eq!(mm.sbrk(4 * PAGE_SIZE as i64), Err(Error::NoMem));
        mm.lock().assert_consistent();
    }

    #[test]
    fn used_space_tracks_region_sum() {
        let mm = space();
        let base_used = mm.used_space();
        mm.map_region(BASE, MB, Prot::READ, MapFlags::FIXED | MapFlags::PRIVATE).unwrap();
        assert_eq!(mm.used_space(), base_used + MB);
        mm.unmap(BASE, MB / 2).unwrap();
        assert_eq!(mm.used_space(), base_used + MB / 2);
        mm.lock().assert_consistent();
    }
}
