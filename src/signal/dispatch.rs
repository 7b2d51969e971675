//! Signal delivery.
//!
//! Called on the thread's own execution path (kernel-to-user return,
//! explicit checks in long-running kernel threads): dequeue deliverable
//! occurrences one at a time and act on each — discard, terminate, stop,
//! continue, or run a handler.
//!
//! Handler frames chain through the arch thread's saved-context stack:
//! dispatch pushes the interrupted context, `signal_return` pops it, so
//! a returning handler resumes the interrupted code rather than the
//! scheduler.

use alloc::sync::Arc;

use crate::KResult;
use crate::arch::x86_64::context::{Context, IretFrame, RFLAGS_IF, USER_CS, USER_SS};
use crate::percpu;
use crate::scheduler::lifecycle;
use crate::scheduler::thread::{Thread, ThreadFlags, ThreadState};
use crate::signal::{
    SaFlags, SigAction, SigDefault, SigHandler, SigInfo, sig_default_action,
};

/// Exit status for a default-terminated thread.
pub fn termination_status(signo: usize) -> usize {
    128 + signo
}

/// Sentinel return address a user handler returns through; the fault on
/// it routes into the sigreturn path.
pub const SIGRETURN_SENTINEL: u64 = 0x5109_0000_dead_c0de;

/// Deliver every deliverable signal for the calling thread. Returns the
/// number of signals acted on. `Terminate` defaults do not return.
pub fn dispatch_pending() -> usize {
    let Some(current) = percpu::current() else { return 0 };
    let mut delivered = 0;
    while let Some((info, act)) = super::queues::signal_dequeue(&current) {
        delivered += 1;
        deliver_one(&current, info, act);
    }
    delivered
}

/// Act on one dequeued occurrence according to its action snapshot.
pub fn deliver_one(thread: &Arc<Thread>, info: SigInfo, act: SigAction) {
    match act.handler {
        SigHandler::Ignore => {}
        SigHandler::Default => default_action(thread, &info),
        SigHandler::Handler(addr) => handler_action(thread, &info, addr, act),
    }
}

/// Execute the default disposition for `info.signo`.
pub fn default_action(thread: &Arc<Thread>, info: &SigInfo) {
    match sig_default_action(info.signo) {
        SigDefault::Ignore => {}
        SigDefault::Continue => {
            // Only meaningful for a stopped thread; running threads just
            // discard it.
            let mut inner = thread.lock();
            if inner.state == ThreadState::Stopped {
                inner.state = ThreadState::Ready;
                drop(inner);
                crate::scheduler::enqueue_ready(thread);
            }
        }
        SigDefault::Stop => {
            let is_current = percpu::current().map(|c| c.tid() == thread.tid()).unwrap_or(false);
            thread.set_flags(ThreadFlags::STOPPED);
            if is_current {
                {
                    let mut inner = thread.lock();
                    inner.state = ThreadState::Stopped;
                }
                crate::scheduler::reschedule();
                thread.clear_flags(ThreadFlags::STOPPED);
            } else {
                let mut inner = thread.lock();
                if inner.state == ThreadState::Ready {
                    inner.state = ThreadState::Stopped;
                }
            }
        }
        SigDefault::Terminate | SigDefault::TerminateCore | SigDefault::Abort => {
            let status = termination_status(info.signo);
            let is_current = percpu::current().map(|c| c.tid() == thread.tid()).unwrap_or(false);
            if is_current {
                lifecycle::thread_exit(status);
            }
            // Delivered on behalf of another thread (e.g. staged kill):
            // stage the status and let the scheduler collect it.
            let mut inner = thread.lock();
            inner.exit_code = status;
            drop(inner);
            thread.set_flags(ThreadFlags::KILL);
        }
    }
}

/// Run (or stage) a caught signal's handler.
///
/// Kernel threads invoke the handler directly: the address is a kernel
/// `fn(usize)`. User threads get a frame pushed so the next dispatch
/// enters the handler in user mode and `signal_return` resumes the
/// interrupted context.
fn handler_action(thread: &Arc<Thread>, info: &SigInfo, addr: usize, act: SigAction) {
    // Block the handler's mask plus the signal itself for the duration;
    // the saved mask is restored by `signal_return`.
    {
        let mut inner = thread.lock();
        let saved = inner.sigmask;
        let mut during = inner.sigmask.union(act.mask);
        if !act.flags.contains(SaFlags::NODEFER) {
            during.add(info.signo);
        }
        inner.sigmask = during;
        inner.saved_sigmasks.push(saved);
    }

    thread.set_flags(ThreadFlags::HANDLING_SIGNAL);

    if act.flags.contains(SaFlags::RESETHAND) {
        if let Some(desc) = thread.lock().signals.clone() {
            desc.set_action(info.signo, SigAction::default());
        }
    }

    if thread.has_flags(ThreadFlags::USER) {
        push_user_frame(thread, info, addr, &act);
    } else {
        // Kernel-mode handler: a plain call, the frame is the native one.
        let handler: fn(usize) = unsafe { core::mem::transmute(addr) };
        handler(info.signo);
        let _ = signal_return(thread);
    }
}

/// Build the user-mode handler frame.
///
/// The interrupted context is pushed on the arch context stack and a
/// fresh context is prepared whose unwind enters the handler via an
/// iret frame: rdi = signo, rsi = &siginfo (with SA_SIGINFO), return
/// address = the sigreturn sentinel.
fn push_user_frame(thread: &Arc<Thread>, info: &SigInfo, addr: usize, act: &SigAction) {
    let arch = unsafe { thread.arch_mut() };
    if arch.ctx.is_null() {
        // No suspended frame yet (embryonic thread); nothing to chain.
        return;
    }

    // Alternate stack only when requested, configured, and not already
    // in use by a nested handler.
    let ustack = if act.flags.contains(SaFlags::ONSTACK) && arch.ctx_depth() == 0 {
        arch.alt_stack.or(arch.ustack)
    } else {
        arch.ustack
    };
    let Some(ustack) = ustack else { return };

    let mut user_rsp = ustack.top & !0xf;

    // Optional siginfo block, then the sentinel return address.
    let mut siginfo_va = 0u64;
    if act.flags.contains(SaFlags::SIGINFO) {
        user_rsp -= core::mem::size_of::<SigInfo>() as u64;
        user_rsp &= !0xf;
        siginfo_va = user_rsp;
        let bytes = unsafe {
            core::slice::from_raw_parts(
                info as *const SigInfo as *const u8,
                core::mem::size_of::<SigInfo>(),
            )
        };
        if let Some(mmap) = thread.lock().mmap.clone() {
            let _ = crate::arch::x86_64::paging::copy_out(mmap.pgdir(), siginfo_va, bytes);
        }
    }
    user_rsp -= 8;
    if let Some(mmap) = thread.lock().mmap.clone() {
        let _ = crate::arch::x86_64::paging::copy_out(
            mmap.pgdir(),
            user_rsp,
            &SIGRETURN_SENTINEL.to_le_bytes(),
        );
    }

    // Carve the dispatch frame below the current saved context.
    let below = (arch.ctx as usize) & !0xf;
    let frame_at = below - core::mem::size_of::<IretFrame>();
    let frame = frame_at as *mut IretFrame;
    unsafe {
        frame.write(IretFrame {
            rip: addr as u64,
            cs: USER_CS,
            rflags: RFLAGS_IF,
            rsp: user_rsp,
            ss: USER_SS,
        });
    }
    let ctx_at = frame_at - core::mem::size_of::<Context>();
    let ctx = ctx_at as *mut Context;
    unsafe {
        ctx.write(Context {
            rip: crate::arch::x86_64::context::uthread_trampoline as usize as u64,
            rbp: frame_at as u64,
            r13: info.signo as u64,
            r12: siginfo_va,
            ..Context::default()
        });
    }

    arch.push_ctx(ctx);
}

/// Handler-return path: restore the interrupted context and the
/// pre-handler signal mask.
pub fn signal_return(thread: &Arc<Thread>) -> KResult<()> {
    {
        let arch = unsafe { thread.arch_mut() };
        if arch.ctx_depth() > 0 {
            arch.pop_ctx()?;
        }
    }
    let still_nested = {
        let mut inner = thread.lock();
        if let Some(mask) = inner.saved_sigmasks.pop() {
            inner.sigmask = mask;
        }
        !inner.saved_sigmasks.is_empty()
    };
    if !still_nested {
        thread.clear_flags(ThreadFlags::HANDLING_SIGNAL);
    }
    Ok(())
}

/// Deliverability probe used by wakeup paths.
pub fn has_deliverable(thread: &Arc<Thread>) -> bool {
    let inner = thread.lock();
    let blocked = inner.sigmask;
    let thread_pending = inner.sigpending;
    let proc_pending = inner
        .signals
        .as_ref()
        .map(|d| d.pending())
        .unwrap_or(crate::signal::SigSet::empty());
    !thread_pending.union(proc_pending).subtract(blocked).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use crate::scheduler::create::{CreateFlags, thread_create};
    use crate::signal::{SIGUSR1, SIGUSR2, SigVal};

    static HANDLER_HITS: AtomicUsize = AtomicUsize::new(0);
    static HANDLER_SAW_BLOCKED: AtomicUsize = AtomicUsize::new(0);

    fn noop(_: usize) {}

    fn make_thread() -> Arc<Thread> {
        thread_create(None, noop, 0, CreateFlags::GROUP).unwrap()
    }

    fn counting_handler(signo: usize) {
        assert_eq!(signo, SIGUSR1);
        HANDLER_HITS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn kernel_handler_runs_and_mask_is_restored() {
        HANDLER_HITS.store(0, Ordering::Relaxed);
        let t = make_thread();
        let act = SigAction {
            handler: SigHandler::Handler(counting_handler as usize),
            flags: SaFlags::empty(),
            mask: crate::signal::SigSet::of(SIGUSR2),
        };

        let before = t.lock().sigmask;
        deliver_one(&t, SigInfo::new(SIGUSR1, SigVal::Int(0)), act);

        assert_eq!(HANDLER_HITS.load(Ordering::Relaxed), 1);
        // Handler-duration mask (sa_mask + signo) is gone again.
        assert_eq!(t.lock().sigmask, before);
        assert!(!t.has_flags(ThreadFlags::HANDLING_SIGNAL));
    }

    #[test]
    fn resethand_restores_default_disposition() {
        HANDLER_HITS.store(0, Ordering::Relaxed);
        let t = make_thread();
        let desc = t.lock().signals.clone().unwrap();
        let act = SigAction {
            handler: SigHandler::Handler(counting_handler as usize),
            flags: SaFlags::RESETHAND,
            mask: crate::signal::SigSet::empty(),
        };
        desc.set_action(SIGUSR1, act);

        deliver_one(&t, SigInfo::new(SIGUSR1, SigVal::Int(0)), act);
        assert_eq!(HANDLER_HITS.load(Ordering::Relaxed), 1);
        assert_eq!(desc.action(SIGUSR1).handler, SigHandler::Default);
    }

    fn blocked_probe_handler(_signo: usize) {
        // The delivered signal itself is blocked while the handler runs
        // (no SA_NODEFER).
        if let Some(current) = percpu::current() {
            if current.lock().sigmask.contains(SIGUSR1) {
                HANDLER_SAW_BLOCKED.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    #[test]
    fn signal_blocked_during_its_own_handler() {
        // Installs a current thread; keep that window exclusive.
        let _serial = crate::test_support::SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        HANDLER_SAW_BLOCKED.store(0, Ordering::Relaxed);
        let t = make_thread();
        let act = SigAction {
            handler: SigHandler::Handler(blocked_probe_handler as usize),
            flags: SaFlags::empty(),
            mask: crate::signal::SigSet::empty(),
        };

        // Run with the target installed as current so the probe can see
        // its own mask.
        let old = percpu::set_current(Some(t.clone()));
        deliver_one(&t, SigInfo::new(SIGUSR1, SigVal::Int(0)), act);
        let _ = percpu::set_current(old);

        assert_eq!(HANDLER_SAW_BLOCKED.load(Ordering::Relaxed), 1);
        assert!(!t.lock().sigmask.contains(SIGUSR1));
    }
}
