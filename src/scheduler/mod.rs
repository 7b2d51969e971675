/*
 * Thread Scheduler
 *
 * Per-CPU multi-level feedback queue scheduling. Each CPU runs the
 * `scheduler()` loop: pick the highest-priority runnable thread, focus
 * its address space, context-switch into it, and on return sort the
 * thread by its post-run state (re-enqueue, leave sleeping, collect a
 * zombie, or hand a terminated thread to the reaper).
 *
 * Housekeeping is split between the timer tick (priority boost, quantum
 * adjustment) and builtin threads (load balancing, aging, reaping).
 */

pub mod balancer;
pub mod config;
pub mod create;
pub mod lifecycle;
pub mod metrics;
pub mod mlfq;
pub mod process;
pub mod thread;
pub mod wait;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use lazy_static::lazy_static;

use crate::ds::queue::Queue;
use crate::percpu;
use crate::scheduler::thread::{Thread, ThreadFlags, ThreadQueue, ThreadState};

pub use mlfq::{MLFQ_HIGH, MLFQ_LOW, NSCHED_LEVELS};
pub use wait::{wait_on, wakeup_all_on, wakeup_on};

static ENABLED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    /// Threads past ZOMBIE, waiting for the reaper to drop their last
    /// references.
    static ref TERMINATED: ThreadQueue = Queue::new();
}

/// Ready the scheduler for use. The per-CPU queues themselves are
/// allocated lazily on first touch.
pub fn init() {
    let _ = mlfq::mlfq(0);
    log::info!("scheduler: {} level MLFQ, {} cpu(s)", NSCHED_LEVELS, percpu::online());
}

/// Allow timer-driven preemption and dispatch.
pub fn enable() {
    ENABLED.store(true, Ordering::Release);
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

/// Queue a READY thread at its current priority level.
pub fn enqueue_ready(thread: &Arc<Thread>) {
    if let Err(err) = mlfq::enqueue_on(percpu::cpu_id(), thread) {
        log::error!("sched: enqueue of thread {} failed: {}", thread.tid(), err);
    }
}

/// First scheduling of a thread: all threads start at the highest
/// priority level.
pub fn schedule_thread(thread: &Arc<Thread>) -> crate::KResult<()> {
    {
        let mut inner = thread.lock();
        inner.sched.prio = MLFQ_HIGH;
        inner.state = ThreadState::Ready;
    }
    mlfq::enqueue_on(percpu::cpu_id(), thread)
}

/// Yield the processor back to the scheduler loop, keeping READY state.
pub fn sched_yield() {
    let Some(current) = percpu::current() else { return };
    {
        let mut inner = current.lock();
        inner.state = ThreadState::Ready;
    }
    reschedule();
}

/// Called by the timer interrupt after the tick: preempt the running
/// thread once its quantum is spent, unless it opted out.
pub fn preempt() {
    if !enabled() {
        return;
    }
    let Some(current) = percpu::current() else { return };
    if current.timeslice() == 0 && !current.has_flags(ThreadFlags::NO_PREEMPT) {
        sched_yield();
    }
}

/// Switch from the current thread to this CPU's scheduler loop. Returns
/// when the thread is dispatched again.
///
/// A thread that exhausted its quantum is demoted one level on the way
/// out; a thread that blocked early keeps its level.
pub fn reschedule() {
    let cpu = percpu::this_cpu();
    let current = percpu::current().expect("reschedule with no current thread");

    // The scheduler loop runs with its own interrupt-nesting state;
    // ours is restored when the switch comes back.
    let ncli = cpu.ncli.load(Ordering::Relaxed);
    let intena = cpu.intena.load(Ordering::Relaxed);

    if current.timeslice() == 0 {
        let mut inner = current.lock();
        if inner.sched.prio > MLFQ_LOW {
            inner.sched.prio -= 1;
        }
    }

    crate::arch::x86_64::interrupts::disable();
    unsafe {
        let arch = current.arch_mut();
        let slot = &mut arch.ctx as *mut *mut _;
        crate::arch::x86_64::context::context_switch(slot, *cpu.sched_ctx_slot());
    }

    cpu.ncli.store(ncli, Ordering::Relaxed);
    cpu.intena.store(intena, Ordering::Relaxed);
}

/// Fold a pending forced termination into the thread's state. Returns
/// true when the thread is now a zombie and must not run.
pub fn check_killed(thread: &Arc<Thread>) -> bool {
    if !thread.killed() {
        return false;
    }
    let mut inner = thread.lock();
    match inner.state {
        ThreadState::Zombie | ThreadState::Terminated => true,
        _ => {
            if inner.exit_code == 0 {
                inner.exit_code = crate::errno::Error::Intr.code() as usize;
            }
            inner.state = ThreadState::Zombie;
            inner.sched.exit_time = crate::time::jiffies();
            true
        }
    }
}

/// A thread came back from execution (or was caught killed before it
/// ran); route it by state.
fn handle_thread_state(thread: &Arc<Thread>) {
    let state = thread.lock().state;
    match state {
        ThreadState::Running | ThreadState::Ready => {
            {
                let mut inner = thread.lock();
                inner.state = ThreadState::Ready;
            }
            enqueue_ready(thread);
        }
        ThreadState::Sleep | ThreadState::Stopped => {}
        ThreadState::Zombie => handle_zombie(thread),
        ThreadState::Terminated => {
            let _ = TERMINATED.lock().enqueue(thread.clone(), true);
        }
        other => panic!("thread {} returned to scheduler in state {}", thread.tid(), other.as_str()),
    }
}

/// Announce an exited thread: joiners wake on its event condition and
/// the owning process learns one of its threads is gone. Detached
/// zombies have no joiner, so they go straight to the reaper.
fn handle_zombie(thread: &Arc<Thread>) {
    thread.event.broadcast();
    process::notify_thread_zombie(thread);
    if thread.has_flags(ThreadFlags::DETACHED) {
        {
            let mut inner = thread.lock();
            inner.state = ThreadState::Terminated;
        }
        let _ = TERMINATED.lock().enqueue(thread.clone(), true);
    }
}

/// Drop every reference the scheduler still holds on terminated
/// threads; the reaper builtin calls this.
pub fn reap_terminated() -> usize {
    let mut reaped = 0;
    loop {
        let next = TERMINATED.lock().dequeue();
        match next {
            Ok(thread) => {
                let group = thread.lock().group.clone();
                if let Some(group) = group {
                    let _ = group.lock().remove(&thread);
                }
                thread::unregister_global(&thread);
                log::debug!("reaper: thread {} released", thread.tid());
                drop(thread);
                reaped += 1;
            }
            Err(_) => return reaped,
        }
    }
}

/// Per-CPU scheduler loop; never returns. Runs with no current thread
/// between dispatches, idling with interrupts enabled when every level
/// is empty and nothing can be stolen.
pub fn scheduler() -> ! {
    let cpu = percpu::this_cpu();
    enable();

    loop {
        cpu.ncli.store(0, Ordering::Relaxed);
        cpu.intena.store(false, Ordering::Relaxed);
        percpu::set_current(None);

        let thread = loop {
            crate::arch::x86_64::interrupts::enable();
            if let Some(t) = mlfq::pick_next(cpu.id) {
                break t;
            }
            // Nothing local: try to pull from the most loaded CPU, then
            // idle until a tick or IPI.
            mlfq::pull_to(cpu.id);
            if let Some(t) = mlfq::pick_next(cpu.id) {
                break t;
            }
            crate::arch::halt();
        };

        if check_killed(&thread) {
            handle_zombie(&thread);
            continue;
        }

        metrics::on_dispatch(&thread);

        // Focus the thread's address space; kernel threads run on the
        // kernel page directory.
        let mmap = thread.lock().mmap.clone();
        match mmap {
            Some(mm) => {
                mm.set_focus();
                #[cfg(target_os = "none")]
                if thread.has_flags(ThreadFlags::USER) {
                    crate::arch::x86_64::gdt::set_kernel_stack(unsafe {
                        thread.arch_mut().kstack.top() as u64
                    });
                }
            }
            None => {
                crate::arch::x86_64::paging::switch_pgdir(crate::arch::x86_64::paging::kernel_pgdir());
            }
        }

        percpu::set_current(Some(thread.clone()));

        crate::arch::x86_64::interrupts::disable();
        unsafe {
            let arch = thread.arch_mut();
            crate::arch::x86_64::context::context_switch(cpu.sched_ctx_slot(), arch.ctx);
        }

        metrics::on_return(&thread);
        handle_thread_state(&thread);
    }
}
