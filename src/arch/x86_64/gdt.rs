//! Global Descriptor Table and TSS.
//!
//! Segment layout matches the selector constants in [`super::context`]:
//! kernel code 0x08, kernel data 0x10, user code 0x18, user data 0x20.
//! The TSS carries the ring-0 stack used when a user thread traps back
//! into the kernel; the scheduler updates it on every dispatch of a user
//! thread.

use core::cell::UnsafeCell;

use lazy_static::lazy_static;
use x86_64::VirtAddr;
use x86_64::instructions::segmentation::{CS, DS, ES, SS, Segment};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::SegmentSelector;
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;

struct TssCell(UnsafeCell<TaskStateSegment>);

// Written only by the executing CPU with interrupts disabled.
unsafe impl Sync for TssCell {}

static TSS: TssCell = TssCell(UnsafeCell::new(TaskStateSegment::new()));

struct Selectors {
    kernel_code: SegmentSelector,
    kernel_data: SegmentSelector,
    tss: SegmentSelector,
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        gdt.append(Descriptor::user_code_segment());
        gdt.append(Descriptor::user_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(unsafe { &*TSS.0.get() }));
        (gdt, Selectors { kernel_code, kernel_data, tss })
    };
}

/// Install the GDT, reload segment registers and load the TSS.
pub fn init() {
    GDT.0.load();
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        SS::set_reg(GDT.1.kernel_data);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
    log::info!("GDT loaded, TSS selector {:?}", GDT.1.tss);
}

/// Point the TSS ring-0 stack at `top`. Called with the dispatched user
/// thread's kernel stack before switching to it.
pub fn set_kernel_stack(top: u64) {
    unsafe {
        (*TSS.0.get()).privilege_stack_table[0] = VirtAddr::new(top);
    }
}
