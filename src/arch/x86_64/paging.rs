//! MMU hooks consumed by the virtual-memory region manager.
//!
//! The region manager treats these as opaque: page-directory allocation
//! and switching, mapping/unmapping/reprotecting ranges, the lazy-copy
//! setup used by address-space cloning, and raw copy-out for the argument
//! and environment copier. Physical memory comes from the boot-provided
//! frame allocator (`pmman`); page tables are walked through the identity
//! mapping established by the bootloader.
//!
//! Hosted builds substitute bookkeeping stubs so the region manager's
//! logic runs unmodified under the test harness.

use crate::KResult;
use crate::memory::region::MmuFlags;

pub const PAGE_SIZE: u64 = 4096;

#[cfg(target_os = "none")]
pub mod pmman {
    //! Boot-time physical frame allocator: a bump cursor over the largest
    //! usable region with a single-linked free list for returned frames.

    use super::PAGE_SIZE;
    use crate::sync::spinlock::SpinLock;

    struct Pmm {
        next: u64,
        end: u64,
        free_head: u64,
    }

    static PMM: SpinLock<Pmm> = SpinLock::new(Pmm { next: 0, end: 0, free_head: 0 });

    /// Hand the allocator a physical range. Must be called once before any
    /// allocation, with a range the bootloader reports as usable.
    pub fn init(start: u64, len: u64) {
        let mut pmm = PMM.lock();
        pmm.next = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        pmm.end = start + len;
        log::info!("pmman: {:#x}..{:#x} ({} KiB)", pmm.next, pmm.end, (pmm.end - pmm.next) / 1024);
    }

    pub fn alloc() -> Option<u64> {
        let mut pmm = PMM.lock();
        if pmm.free_head != 0 {
            let frame = pmm.free_head;
            pmm.free_head = unsafe { *(frame as *const u64) };
            unsafe { core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE as usize) };
            return Some(frame);
        }
        if pmm.next + PAGE_SIZE > pmm.end {
            return None;
        }
        let frame = pmm.next;
        pmm.next += PAGE_SIZE;
        unsafe { core::ptr::write_bytes(frame as *mut u8, 0, PAGE_SIZE as usize) };
        Some(frame)
    }

    pub fn free(frame: u64) {
        let mut pmm = PMM.lock();
        unsafe { *(frame as *mut u64) = pmm.free_head };
        pmm.free_head = frame;
    }
}

#[cfg(target_os = "none")]
mod hw {
    use super::{PAGE_SIZE, pmman};
    use crate::KResult;
    use crate::errno::Error;
    use crate::memory::region::MmuFlags;

    const PTE_PRESENT: u64 = 1 << 0;
    const PTE_WRITE: u64 = 1 << 1;
    const PTE_USER: u64 = 1 << 2;
    const PTE_NX: u64 = 1 << 63;
    const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

    fn pte_flags(mmu: MmuFlags) -> u64 {
        let mut bits = PTE_PRESENT;
        if mmu.contains(MmuFlags::WRITE) {
            bits |= PTE_WRITE;
        }
        if mmu.contains(MmuFlags::USER) {
            bits |= PTE_USER;
        }
        if !mmu.contains(MmuFlags::EXEC) {
            bits |= PTE_NX;
        }
        bits
    }

    fn table(entry: &mut u64, user: bool) -> KResult<*mut u64> {
        if *entry & PTE_PRESENT == 0 {
            let frame = pmman::alloc().ok_or(Error::NoMem)?;
            *entry = frame | PTE_PRESENT | PTE_WRITE | if user { PTE_USER } else { 0 };
        }
        Ok((*entry & ADDR_MASK) as *mut u64)
    }

    unsafe fn walk(pgdir: u64, va: u64, create: bool, user: bool) -> KResult<*mut u64> {
        let mut tbl = pgdir as *mut u64;
        for level in (1..4).rev() {
            let idx = ((va >> (12 + 9 * level)) & 0x1ff) as usize;
            let entry = unsafe { &mut *tbl.add(idx) };
            if !create && *entry & PTE_PRESENT == 0 {
                return Err(Error::NoEnt);
            }
            tbl = table(entry, user)?;
        }
        Ok(unsafe { tbl.add(((va >> 12) & 0x1ff) as usize) })
    }

    pub fn map_range(pgdir: u64, va: u64, len: u64, mmu: MmuFlags) -> KResult<()> {
        let user = mmu.contains(MmuFlags::USER);
        let bits = pte_flags(mmu);
        let mut addr = va;
        while addr < va + len {
            let frame = pmman::alloc().ok_or(Error::NoMem)?;
            let pte = unsafe { walk(pgdir, addr, true, user)? };
            unsafe { *pte = frame | bits };
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    pub fn unmap_range(pgdir: u64, va: u64, len: u64) {
        let mut addr = va;
        while addr < va + len {
            if let Ok(pte) = unsafe { walk(pgdir, addr, false, false) } {
                let entry = unsafe { *pte };
                if entry & PTE_PRESENT != 0 {
                    pmman::free(entry & ADDR_MASK);
                    unsafe { *pte = 0 };
                    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(addr));
                }
            }
            addr += PAGE_SIZE;
        }
    }

    pub fn protect_range(pgdir: u64, va: u64, len: u64, mmu: MmuFlags) -> KResult<()> {
        let keep = pte_flags(mmu);
        let mut addr = va;
        while addr < va + len {
            if let Ok(pte) = unsafe { walk(pgdir, addr, false, false) } {
                let entry = unsafe { *pte };
                if entry & PTE_PRESENT != 0 {
                    unsafe { *pte = (entry & ADDR_MASK) | keep };
                    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(addr));
                }
            }
            addr += PAGE_SIZE;
        }
        Ok(())
    }

    pub fn alloc_pgdir() -> KResult<u64> {
        let pml4 = pmman::alloc().ok_or(Error::NoMem)?;
        // Share the kernel half so the kernel stays mapped in every
        // address space.
        let kernel = kernel_pgdir() as *const u64;
        let new = pml4 as *mut u64;
        for i in 256..512 {
            unsafe { *new.add(i) = *kernel.add(i) };
        }
        Ok(pml4)
    }

    pub fn free_pgdir(pgdir: u64) {
        pmman::free(pgdir);
    }

    pub fn kernel_pgdir() -> u64 {
        let (frame, _) = x86_64::registers::control::Cr3::read();
        frame.start_address().as_u64()
    }

    pub fn switch_pgdir(pgdir: u64) -> u64 {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        let (old, _) = Cr3::read();
        let old_addr = old.start_address().as_u64();
        if old_addr != pgdir {
            let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(pgdir));
            unsafe { Cr3::write(frame, Cr3Flags::empty()) };
        }
        old_addr
    }

    pub fn lazy_copy(dst: u64, src: u64) -> KResult<()> {
        // Copy-on-write setup for the user half: the child shares the
        // parent's lower-half tables with writes disabled at the top
        // level; faults repopulate per-page.
        let src_tbl = src as *const u64;
        let dst_tbl = dst as *mut u64;
        for i in 0..256 {
            let entry = unsafe { *src_tbl.add(i) };
            if entry & PTE_PRESENT != 0 {
                unsafe {
                    *dst_tbl.add(i) = entry & !PTE_WRITE;
                    *(src_tbl as *mut u64).add(i) = entry & !PTE_WRITE;
                }
            }
        }
        x86_64::instructions::tlb::flush_all();
        Ok(())
    }

    pub fn copy_out(pgdir: u64, va: u64, bytes: &[u8]) -> KResult<()> {
        let mut off = 0u64;
        while off < bytes.len() as u64 {
            let addr = va + off;
            let pte = unsafe { walk(pgdir, addr, false, false)? };
            let entry = unsafe { *pte };
            if entry & PTE_PRESENT == 0 {
                return Err(Error::Fault);
            }
            let page_off = addr & (PAGE_SIZE - 1);
            let chunk = core::cmp::min(PAGE_SIZE - page_off, bytes.len() as u64 - off);
            let dst = ((entry & ADDR_MASK) + page_off) as *mut u8;
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr().add(off as usize), dst, chunk as usize)
            };
            off += chunk;
        }
        Ok(())
    }
}

#[cfg(not(target_os = "none"))]
mod hw {
    use core::sync::atomic::{AtomicU64, Ordering};

    use crate::KResult;
    use crate::memory::region::MmuFlags;

    static NEXT_PGDIR: AtomicU64 = AtomicU64::new(0x1000);
    static CURRENT_PGDIR: AtomicU64 = AtomicU64::new(0);

    pub fn map_range(_pgdir: u64, _va: u64, _len: u64, _mmu: MmuFlags) -> KResult<()> {
        Ok(())
    }

    pub fn unmap_range(_pgdir: u64, _va: u64, _len: u64) {}

    pub fn protect_range(_pgdir: u64, _va: u64, _len: u64, _mmu: MmuFlags) -> KResult<()> {
        Ok(())
    }

    pub fn alloc_pgdir() -> KResult<u64> {
        Ok(NEXT_PGDIR.fetch_add(0x1000, Ordering::Relaxed))
    }

    pub fn free_pgdir(_pgdir: u64) {}

    pub fn kernel_pgdir() -> u64 {
        0
    }

    pub fn switch_pgdir(pgdir: u64) -> u64 {
        CURRENT_PGDIR.swap(pgdir, Ordering::Relaxed)
    }

    pub fn lazy_copy(_dst: u64, _src: u64) -> KResult<()> {
        Ok(())
    }

    pub fn copy_out(_pgdir: u64, _va: u64, _bytes: &[u8]) -> KResult<()> {
        Ok(())
    }
}

/// Map `len` bytes of fresh memory at `va` in `pgdir`.
pub fn map_range(pgdir: u64, va: u64, len: u64, mmu: MmuFlags) -> KResult<()> {
    hw::map_range(pgdir, va, len, mmu)
}

/// Tear down mappings in `[va, va + len)`, returning frames.
pub fn unmap_range(pgdir: u64, va: u64, len: u64) {
    hw::unmap_range(pgdir, va, len)
}

/// Reprogram permissions for `[va, va + len)`.
pub fn protect_range(pgdir: u64, va: u64, len: u64, mmu: MmuFlags) -> KResult<()> {
    hw::protect_range(pgdir, va, len, mmu)
}

/// Allocate a page directory pre-populated with the kernel half.
pub fn alloc_pgdir() -> KResult<u64> {
    hw::alloc_pgdir()
}

pub fn free_pgdir(pgdir: u64) {
    hw::free_pgdir(pgdir)
}

/// The page directory the kernel itself runs on.
pub fn kernel_pgdir() -> u64 {
    hw::kernel_pgdir()
}

/// Load `pgdir`, returning the previously loaded directory.
pub fn switch_pgdir(pgdir: u64) -> u64 {
    hw::switch_pgdir(pgdir)
}

/// Copy-on-write duplication of the user half of `src` into `dst`.
pub fn lazy_copy(dst: u64, src: u64) -> KResult<()> {
    hw::lazy_copy(dst, src)
}

/// Write `bytes` into `pgdir` at virtual address `va`.
pub fn copy_out(pgdir: u64, va: u64, bytes: &[u8]) -> KResult<()> {
    hw::copy_out(pgdir, va, bytes)
}
