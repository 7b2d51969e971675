/*
 * CORVUS Kernel Entry Point
 *
 * Bare-metal bring-up for the x86_64 build: identify the bootstrap
 * processor, switch onto the kernel's own stack, and run the boot
 * sequence — console and logger, descriptor tables, physical and heap
 * allocators, scheduler, builtin threads, the init process, and finally
 * the per-CPU scheduler loop. Application processors are parked.
 *
 * On hosted targets this binary is a stub; the kernel library and its
 * test suite are the useful artifacts there.
 */

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::panic::PanicInfo;

    use corvus::arch::x86_64::{gdt, idt, interrupts, pic, paging};
    use corvus::memory::heap;
    use corvus::scheduler::process;
    use corvus::{builtin, console, percpu, scheduler, serial_println, utils};

    /// Physical range handed to the frame allocator. The bootloader's
    /// memory map is outside this core; conventional memory above the
    /// kernel image is assumed usable.
    const PHYS_POOL_START: u64 = 0x0200_0000;
    const PHYS_POOL_SIZE: u64 = 0x0e00_0000;

    #[repr(C, align(16))]
    struct AlignedBspStack([u8; 64 * 1024]);

    #[unsafe(no_mangle)]
    static mut BSP_STACK: AlignedBspStack = AlignedBspStack([0; 64 * 1024]);

    /// Entry from the bootloader on every core: APs park, the BSP moves
    /// to the kernel stack and enters `kstart`.
    #[unsafe(naked)]
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn _start() -> ! {
        core::arch::naked_asm!(
            // APIC id from CPUID leaf 1, EBX[31:24].
            "mov eax, 1",
            "cpuid",
            "shr ebx, 24",
            "test ebx, ebx",
            "jnz 2f",
            // BSP: own stack, then Rust.
            "lea rsp, [rip + BSP_STACK]",
            "add rsp, {stack_size}",
            "call {kstart}",
            // APs (and a returning kstart, which cannot happen) halt.
            "2:",
            "cli",
            "3:",
            "hlt",
            "jmp 3b",
            stack_size = const 64 * 1024,
            kstart = sym kstart,
        )
    }

    extern "C" fn kstart() -> ! {
        console::init();
        utils::logger::init();
        log::info!("CORVUS kernel starting");

        gdt::init();
        idt::init();
        pic::init();

        paging::pmman::init(PHYS_POOL_START, PHYS_POOL_SIZE);
        if let Err(err) = heap::init() {
            panic!("heap init failed: {}", err);
        }

        percpu::set_online(1);
        scheduler::init();

        match builtin::spawn_all() {
            Ok(count) => log::info!("{} builtin threads spawned", count),
            Err(err) => panic!("builtin spawn failed: {}", err),
        }

        // The init program needs a loader-registered image; without one
        // the system still comes up with the kernel shell.
        match process::proc_init("/sbin/init") {
            Ok(proc) => log::info!("init is pid {}", proc.pid()),
            Err(err) => log::warn!("no init process: {}", err),
        }

        interrupts::enable();
        scheduler::scheduler()
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        interrupts::disable();
        serial_println!("\nKERNEL PANIC: {}", info);
        loop {
            corvus::arch::halt();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("corvus-kernel targets bare-metal x86_64; build with the kernel target.");
    eprintln!("On hosted targets, run `cargo test` for the subsystem test suite.");
}
