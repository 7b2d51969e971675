//! Thread creation.
//!
//! `thread_alloc` builds the control block and kernel stack;
//! `thread_create` layers the creation-flag semantics on top: user
//! threads adopt or allocate a user stack in the caller's address space,
//! `GROUP` starts a fresh thread group (and process), `SCHED` queues the
//! new thread immediately.

use alloc::string::String;
use alloc::sync::{Arc, Weak};

use bitflags::bitflags;

use crate::KResult;
use crate::arch::x86_64::context::{ArchThread, KernelStack, UserStack, kthread_init, uthread_init};
use crate::errno::Error;
use crate::percpu;
use crate::scheduler::process;
use crate::scheduler::thread::{
    self, KSTACK_MAXSIZE, KSTACK_SIZE, SchedInfo, Thread, ThreadEntry, ThreadFlags, ThreadInner,
    ThreadState, USTACK_SIZE, WakeReason,
};
use crate::signal::SigSet;
use crate::time;

bitflags! {
    /// `thread_create` behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// Build a user thread in the caller's address space.
        const USER = 1 << 0;
        /// Start a new thread group (and process record).
        const GROUP = 1 << 1;
        /// No join necessary; reaped automatically.
        const DETACHED = 1 << 2;
        /// Queue for execution immediately.
        const SCHED = 1 << 3;
    }
}

/// Per-thread creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct ThreadAttr {
    pub detached: bool,
    /// Existing stack region to adopt; zero allocates a fresh one.
    pub stack_addr: u64,
    pub stack_size: usize,
    pub guard_size: usize,
}

impl ThreadAttr {
    pub fn kernel_default() -> Self {
        ThreadAttr { detached: false, stack_addr: 0, stack_size: KSTACK_SIZE, guard_size: 4096 }
    }

    pub fn user_default() -> Self {
        ThreadAttr { detached: false, stack_addr: 0, stack_size: USTACK_SIZE, guard_size: 4096 }
    }
}

/// Allocate and initialize a thread control block with its kernel stack.
/// The thread starts EMBRYO, soft-affine to all CPUs, and is entered in
/// the global registry.
pub fn thread_alloc(stack_size: usize, cflags: CreateFlags, name: &str) -> KResult<Arc<Thread>> {
    if stack_size < KSTACK_SIZE || stack_size > KSTACK_MAXSIZE {
        return Err(Error::Inval);
    }

    let kstack = KernelStack::new(stack_size)?;
    let arch = ArchThread::new(kstack);
    let tid = thread::alloc_tid();

    let inner = ThreadInner {
        state: ThreadState::Embryo,
        wakeup: WakeReason::Normal,
        killer: None,
        name: if name.is_empty() { alloc::format!("thread-{}", tid) } else { String::from(name) },
        entry: 0,
        exit_code: 0,
        sched: SchedInfo {
            ctime: time::jiffies(),
            prio: crate::scheduler::MLFQ_HIGH,
            ..SchedInfo::default()
        },
        sigmask: SigSet::empty(),
        sigpending: SigSet::empty(),
        wait_queue: None,
        alarm: None,
        saved_sigmasks: alloc::vec::Vec::new(),
        proc: None,
        mmap: None,
        signals: None,
        group: None,
        timers: None,
        main: Weak::new(),
    };

    let thread = Thread::construct(tid, arch, inner);
    if cflags.contains(CreateFlags::USER) {
        thread.set_flags(ThreadFlags::USER);
    }
    if cflags.contains(CreateFlags::DETACHED) {
        thread.set_flags(ThreadFlags::DETACHED);
    }

    thread::register_global(&thread)?;
    Ok(thread)
}

/// Create a thread.
///
/// Defaults are chosen from `cflags` when `attr` is absent. A caller
/// outside any group (early boot) implies `GROUP`. User threads require
/// a user caller and may not start their own group here; they adopt the
/// caller's address space and either a fresh stack region or the one
/// named by `attr.stack_addr`.
pub fn thread_create(
    attr: Option<&ThreadAttr>,
    entry: ThreadEntry,
    arg: usize,
    mut cflags: CreateFlags,
) -> KResult<Arc<Thread>> {
    let t_attr = match attr {
        Some(a) => *a,
        None if cflags.contains(CreateFlags::USER) => ThreadAttr::user_default(),
        None => ThreadAttr::kernel_default(),
    };

    let current = percpu::current();
    if current.is_none() {
        cflags |= CreateFlags::GROUP;
    }
    if t_attr.detached {
        cflags |= CreateFlags::DETACHED;
    }

    let thread = if cflags.contains(CreateFlags::USER) {
        let current = current.clone().ok_or(Error::Inval)?;
        if !current.has_flags(ThreadFlags::USER) || cflags.contains(CreateFlags::GROUP) {
            return Err(Error::Inval);
        }

        let mmap = current.lock().mmap.clone().ok_or(Error::Inval)?;
        let thread = thread_alloc(KSTACK_SIZE, cflags, "")?;

        let (stack_base, stack_len) = if t_attr.stack_addr == 0 {
            mmap.alloc_stack(t_attr.stack_size as u64)?
        } else {
            mmap.find_stack(t_attr.stack_addr)?
        };

        {
            let mut inner = thread.lock();
            inner.mmap = Some(mmap);
        }
        unsafe {
            let arch = thread.arch_mut();
            arch.ustack = Some(UserStack { top: stack_base + stack_len, size: stack_len });
            uthread_init(arch, entry as usize as u64, stack_base + stack_len, arg as u64);
        }

        process::join_group(&current, &thread)?;
        thread
    } else {
        let thread = thread_alloc(t_attr.stack_size, cflags, "")?;
        unsafe {
            kthread_init(thread.arch_mut(), entry as usize, arg);
        }

        if cflags.contains(CreateFlags::GROUP) {
            process::create_group(&thread, None)?;
        } else {
            let current = current.clone().ok_or(Error::Inval)?;
            process::join_group(&current, &thread)?;
        }
        thread
    };

    thread.lock().entry = entry as usize;

    if cflags.contains(CreateFlags::SCHED) {
        crate::scheduler::schedule_thread(&thread)?;
    }
    Ok(thread)
}

/// Spawn a named kernel thread and queue it immediately.
pub fn kthread_spawn(name: &str, entry: ThreadEntry, arg: usize) -> KResult<Arc<Thread>> {
    let thread = thread_create(None, entry, arg, CreateFlags::SCHED)?;
    thread.lock().name = String::from(name);
    Ok(thread)
}
