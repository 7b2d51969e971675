//! Thread register contexts and the context switch primitive.
//!
//! A [`Context`] holds the callee-saved registers plus the return address,
//! which is all the kernel needs to suspend and resume a thread at a
//! cooperative switch point. The layout must match the push/pop order in
//! [`context_switch`].
//!
//! Signal dispatch chains saved contexts explicitly: instead of rewriting
//! link pointers inside frames, each thread keeps a stack of suspended
//! contexts ([`ArchThread::push_ctx`] / [`ArchThread::pop_ctx`]) and the
//! handler-return path restores the interrupted frame from it.

use alloc::vec::Vec;
use core::alloc::Layout;

use crate::KResult;
use crate::errno::Error;

/// Kernel code segment selector (GDT entry 1).
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector (GDT entry 2).
pub const KERNEL_SS: u64 = 0x10;
/// User code segment selector (GDT entry 3, RPL 3).
pub const USER_CS: u64 = 0x1b;
/// User data segment selector (GDT entry 4, RPL 3).
pub const USER_SS: u64 = 0x23;

/// RFLAGS with IF set and the always-one reserved bit.
pub const RFLAGS_IF: u64 = 0x202;

/// Callee-saved register frame, in the exact memory order the switch
/// primitive pops it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

/// Interrupt return frame used for the first hop into user mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct IretFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Swap execution: save the callee-saved state of the caller into a frame
/// on the current stack, store its address in `*old`, and resume `new`.
///
/// # Safety
/// `old` must be a valid slot and `new` must point at a well-formed
/// [`Context`] whose stack is alive.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut *mut Context, new: *mut Context) {
    core::arch::naked_asm!(
        // Build a Context on the current stack. The call pushed rip; push
        // the callee-saved registers so the stack top matches the struct.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Publish the saved frame and switch stacks.
        "mov [rdi], rsp",
        "mov rsp, rsi",
        // Unwind the new thread's frame.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    )
}

/// Hosted builds never perform a real switch; reaching this is a logic
/// error in the caller.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe extern "C" fn context_switch(_old: *mut *mut Context, _new: *mut Context) {
    unreachable!("context_switch on a hosted build");
}

/// First-run landing pad for kernel threads. `context_switch` pops the
/// prepared frame and returns here with the entry point in r12 and its
/// argument in r13.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[unsafe(naked)]
pub unsafe extern "C" fn kthread_trampoline() {
    core::arch::naked_asm!(
        "sti",
        "mov rdi, r13",
        "call r12",
        // Entry returned: exit with status 0.
        "xor edi, edi",
        "call {exit}",
        "ud2",
        exit = sym crate::scheduler::lifecycle::thread_exit_c,
    )
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe extern "C" fn kthread_trampoline() {
    unreachable!("kthread_trampoline on a hosted build");
}

/// Landing pad for the first entry into user mode: the prepared context
/// returns here with an [`IretFrame`] on the stack top and the entry
/// argument staged in r13, which becomes the user rdi.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[unsafe(naked)]
pub unsafe extern "C" fn uthread_trampoline() {
    core::arch::naked_asm!("mov rdi, r13", "iretq")
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe extern "C" fn uthread_trampoline() {
    unreachable!("uthread_trampoline on a hosted build");
}

/// A kernel stack: 16-byte aligned raw allocation, owned separately from
/// the thread control block.
pub struct KernelStack {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for KernelStack {}

impl KernelStack {
    pub fn new(size: usize) -> KResult<Self> {
        let layout = Layout::from_size_align(size, 16).map_err(|_| Error::Inval)?;
        // Zeroed so a fresh thread never observes stale stack contents.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if base.is_null() {
            return Err(Error::NoMem);
        }
        Ok(KernelStack { base, size })
    }

    pub fn base(&self) -> usize {
        self.base as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Highest usable address, 16-byte aligned.
    pub fn top(&self) -> usize {
        (self.base as usize + self.size) & !0xf
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, 16).unwrap();
        unsafe { alloc::alloc::dealloc(self.base, layout) };
    }
}

/// User stack descriptor adopted or allocated at thread creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserStack {
    /// Highest usable address.
    pub top: u64,
    pub size: u64,
}

/// Architecture-specific half of a thread: its kernel stack, the saved
/// context pointer, the optional user stack, and the suspended-context
/// stack used by signal dispatch.
pub struct ArchThread {
    pub kstack: KernelStack,
    /// Where execution was suspended; null until the first frame is built.
    pub ctx: *mut Context,
    pub ustack: Option<UserStack>,
    /// Alternate signal stack configured via sigaltstack.
    pub alt_stack: Option<UserStack>,
    /// Contexts suspended by signal dispatch, innermost last.
    ctx_stack: Vec<*mut Context>,
}

unsafe impl Send for ArchThread {}

impl ArchThread {
    pub fn new(kstack: KernelStack) -> Self {
        ArchThread {
            kstack,
            ctx: core::ptr::null_mut(),
            ustack: None,
            alt_stack: None,
            ctx_stack: Vec::new(),
        }
    }

    /// Suspend the current context in favor of `new`, remembering the old
    /// one for the matching [`ArchThread::pop_ctx`].
    pub fn push_ctx(&mut self, new: *mut Context) {
        self.ctx_stack.push(self.ctx);
        self.ctx = new;
    }

    /// Restore the most recently suspended context.
    pub fn pop_ctx(&mut self) -> KResult<()> {
        self.ctx = self.ctx_stack.pop().ok_or(Error::Inval)?;
        Ok(())
    }

    pub fn ctx_depth(&self) -> usize {
        self.ctx_stack.len()
    }
}

/// Place a [`Context`] so that unwinding it leaves rsp exactly at `sp`.
/// `sp` must be 16-byte aligned, which also gives the System V stack
/// alignment the trampolines expect.
fn place_ctx(sp: usize) -> *mut Context {
    debug_assert_eq!(sp & 0xf, 0);
    (sp - core::mem::size_of::<Context>()) as *mut Context
}

/// Prepare a fresh kernel thread frame: the first switch to it lands in
/// [`kthread_trampoline`] with `entry`/`arg` staged in callee-saved
/// registers.
pub fn kthread_init(arch: &mut ArchThread, entry: usize, arg: usize) {
    let top = arch.kstack.top();
    let ctx = place_ctx(top);
    unsafe {
        ctx.write(Context {
            rip: kthread_trampoline as usize as u64,
            r12: entry as u64,
            r13: arg as u64,
            rbp: top as u64,
            ..Context::default()
        });
    }
    arch.ctx = ctx;
}

/// Prepare a user thread frame: an [`IretFrame`] aimed at `user_entry` on
/// `user_rsp`, reached through [`uthread_trampoline`]; `arg` lands in the
/// user rdi.
pub fn uthread_init(arch: &mut ArchThread, user_entry: u64, user_rsp: u64, arg: u64) {
    let top = arch.kstack.top();
    let frame_at = (top - core::mem::size_of::<IretFrame>()) & !0xf;
    let frame = frame_at as *mut IretFrame;
    unsafe {
        frame.write(IretFrame {
            rip: user_entry,
            cs: USER_CS,
            rflags: RFLAGS_IF,
            rsp: user_rsp,
            ss: USER_SS,
        });
    }
    // Unwinding the context must leave rsp at the iret frame.
    let ctx = place_ctx(frame_at);
    unsafe {
        ctx.write(Context {
            rip: uthread_trampoline as usize as u64,
            rbp: frame_at as u64,
            r13: arg,
            ..Context::default()
        });
    }
    arch.ctx = ctx;
}
