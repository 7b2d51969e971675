//! Kernel heap.
//!
//! A fixed virtual range in the kernel half, mapped at boot and handed
//! to the linked-list allocator. The allocator static lives here; the
//! binary registers it as the global allocator on the bare-metal build.

use linked_list_allocator::LockedHeap;

use crate::KResult;

/// Virtual base of the kernel heap, in the high canonical half.
pub const HEAP_START: u64 = 0xffff_ffff_c000_0000;

/// 16 MiB: enough for every thread's 32 KiB stack plus kernel data.
pub const HEAP_SIZE: u64 = 16 * 1024 * 1024;

#[cfg_attr(target_os = "none", global_allocator)]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Map the heap range and initialize the allocator over it. Must run
/// once, after the frame allocator is up and before the first kernel
/// allocation.
pub fn init() -> KResult<()> {
    use crate::arch::x86_64::paging;
    use crate::memory::region::MmuFlags;

    paging::map_range(
        paging::kernel_pgdir(),
        HEAP_START,
        HEAP_SIZE,
        MmuFlags::READ | MmuFlags::WRITE,
    )?;

    unsafe {
        ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE as usize);
    }

    log::info!(
        "kernel heap: {:#x}..{:#x} ({} KiB)",
        HEAP_START,
        HEAP_START + HEAP_SIZE - 1,
        HEAP_SIZE / 1024
    );
    Ok(())
}
