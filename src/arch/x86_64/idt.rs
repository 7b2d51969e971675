//! Interrupt Descriptor Table.
//!
//! The table is built from raw gate descriptors and naked stubs rather
//! than typed handler ABIs: every stub saves the full general-purpose
//! register file, calls a Rust handler, restores and `iretq`s. The timer
//! stub is the preemption source; the scheduler may switch threads from
//! inside its handler after the EOI.

use core::arch::naked_asm;
use core::cell::UnsafeCell;
use core::mem::size_of;

use super::pic;

const IDT_ENTRIES: usize = 256;

/// One 16-byte interrupt gate.
#[repr(C)]
#[derive(Clone, Copy)]
struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    options: u16,
    offset_mid: u16,
    offset_high: u32,
    reserved: u32,
}

impl GateDescriptor {
    const fn missing() -> Self {
        GateDescriptor { offset_low: 0, selector: 0, options: 0, offset_mid: 0, offset_high: 0, reserved: 0 }
    }

    fn interrupt_gate(handler: u64) -> Self {
        GateDescriptor {
            offset_low: handler as u16,
            selector: super::context::KERNEL_CS as u16,
            // present | DPL 0 | 64-bit interrupt gate
            options: 0x8e00,
            offset_mid: (handler >> 16) as u16,
            offset_high: (handler >> 32) as u32,
            reserved: 0,
        }
    }
}

#[repr(C, packed)]
struct IdtPointer {
    limit: u16,
    base: u64,
}

struct IdtCell(UnsafeCell<[GateDescriptor; IDT_ENTRIES]>);

// Written once during init, before interrupts are enabled.
unsafe impl Sync for IdtCell {}

static IDT: IdtCell = IdtCell(UnsafeCell::new([GateDescriptor::missing(); IDT_ENTRIES]));

macro_rules! isr_stub {
    ($name:ident, $handler:path) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            naked_asm!(
                "push rax",
                "push rcx",
                "push rdx",
                "push rbx",
                "push rbp",
                "push rsi",
                "push rdi",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "cld",
                "call {handler}",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rdi",
                "pop rsi",
                "pop rbp",
                "pop rbx",
                "pop rdx",
                "pop rcx",
                "pop rax",
                "iretq",
                handler = sym $handler,
            )
        }
    };
}

isr_stub!(timer_stub, timer_handler);
isr_stub!(keyboard_stub, keyboard_handler);
isr_stub!(double_fault_stub, double_fault_handler);
isr_stub!(general_protection_stub, general_protection_handler);
isr_stub!(page_fault_stub, page_fault_handler);

extern "C" fn timer_handler() {
    pic::end_of_interrupt(pic::TIMER_VECTOR);
    crate::time::tick();
    // A thread that exhausted its quantum is preempted here, after the
    // EOI so the next tick can still fire.
    crate::scheduler::preempt();
}

extern "C" fn keyboard_handler() {
    let scancode: u8 = unsafe {
        use x86_64::instructions::port::Port;
        Port::new(0x60).read()
    };
    crate::console::keyboard::handle_scancode(scancode);
    pic::end_of_interrupt(pic::KEYBOARD_VECTOR);
}

extern "C" fn double_fault_handler() {
    panic!("double fault");
}

extern "C" fn general_protection_handler() {
    panic!("general protection fault");
}

extern "C" fn page_fault_handler() {
    let addr = x86_64::registers::control::Cr2::read_raw();
    panic!("page fault at {:#x}", addr);
}

fn set_gate(vector: usize, stub: unsafe extern "C" fn()) {
    unsafe {
        (*IDT.0.get())[vector] = GateDescriptor::interrupt_gate(stub as usize as u64);
    }
}

/// Build and load the IDT.
pub fn init() {
    set_gate(8, double_fault_stub);
    set_gate(13, general_protection_stub);
    set_gate(14, page_fault_stub);
    set_gate(pic::TIMER_VECTOR as usize, timer_stub);
    set_gate(pic::KEYBOARD_VECTOR as usize, keyboard_stub);

    let pointer = IdtPointer {
        limit: (IDT_ENTRIES * size_of::<GateDescriptor>() - 1) as u16,
        base: IDT.0.get() as u64,
    };
    unsafe {
        core::arch::asm!("lidt [{}]", in(reg) &pointer, options(readonly, nostack, preserves_flags));
    }
    log::info!("IDT loaded ({} gates)", IDT_ENTRIES);
}
