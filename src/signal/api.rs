//! Signal system calls.
//!
//! Thread-directed sends queue on the target thread, process-directed
//! sends queue on the shared signal record; both wake eligible sleepers
//! so delivery happens at the target's next dispatch point.

use alloc::sync::Arc;

use crate::KResult;
use crate::ds::queue::Whence;
use crate::errno::Error;
use crate::percpu;
use crate::scheduler::lifecycle;
use crate::scheduler::process::{self, Pid};
use crate::scheduler::thread::{self, Thread, ThreadFlags, ThreadState, Tid, WakeReason};
use crate::scheduler::wait;
use crate::signal::queues::{self, SignalDesc};
use crate::signal::{
    SIGCONT, SIGKILL, SigAction, SigHow, SigInfo, SigSet, SigVal, dispatch, sig_bad,
};
use crate::time::{self, TimeSpec};

/// Builds the siginfo for a locally originated send.
fn local_siginfo(signo: usize, value: SigVal) -> SigInfo {
    let pid = percpu::current()
        .and_then(|t| t.lock().proc.as_ref().map(|p| p.pid()))
        .unwrap_or(0);
    SigInfo { signo, pid, value, ..SigInfo::default() }
}

/// Deliver a thread-directed occurrence to `target`.
pub fn send_to_thread(target: &Arc<Thread>, info: SigInfo) -> KResult<()> {
    if sig_bad(info.signo) {
        return Err(Error::Inval);
    }
    let signo = info.signo;

    // SIGKILL is not queued: it forces termination at the next dispatch.
    if signo == SIGKILL {
        if target.has_flags(ThreadFlags::KILL_EXEMPT) {
            return Ok(());
        }
        {
            let mut inner = target.lock();
            inner.exit_code = dispatch::termination_status(SIGKILL);
            inner.killer = percpu::current().map(|t| t.tid());
        }
        target.set_flags(ThreadFlags::KILL);
        let _ = lifecycle::thread_wakeup(target, WakeReason::Interrupt);
        return Ok(());
    }

    let desc = {
        let mut inner = target.lock();
        queues::thread_sigenqueue(target, &mut inner, info)?;
        inner.signals.clone()
    };

    // A stopped target resumes on SIGCONT regardless of disposition.
    if signo == SIGCONT {
        let _ = lifecycle::thread_wakeup(target, WakeReason::Normal);
    }

    // Wake sigwait sleepers and interrupt the target's sleep if it can
    // take the signal now.
    if let Some(desc) = desc {
        wait::wakeup_all_on(&desc.waiters, WakeReason::Normal);
    }
    let can_take = !target.lock().sigmask.contains(signo);
    if can_take {
        let _ = lifecycle::thread_wakeup(target, WakeReason::Interrupt);
    }
    Ok(())
}

/// `pthread_kill`: send `signo` to one thread.
pub fn pthread_kill(tid: Tid, signo: usize) -> KResult<()> {
    let target = thread::find_by_tid(tid)?;
    if signo == 0 {
        return Ok(());
    }
    send_to_thread(&target, local_siginfo(signo, SigVal::Int(0)))
}

/// `pthread_sigqueue`: like `pthread_kill` with a caller payload.
pub fn pthread_sigqueue(tid: Tid, signo: usize, value: SigVal) -> KResult<()> {
    let target = thread::find_by_tid(tid)?;
    if signo == 0 {
        return Ok(());
    }
    send_to_thread(&target, local_siginfo(signo, value))
}

/// `kill`: send `signo` to a process. The occurrence lands in the shared
/// record and any member able to take it is woken.
pub fn kill(pid: Pid, signo: usize) -> KResult<()> {
    let proc = process::find_by_pid(pid)?;
    if signo == 0 {
        return Ok(());
    }
    if sig_bad(signo) {
        return Err(Error::Inval);
    }

    if signo == SIGKILL {
        for member in proc.threads() {
            let _ = send_to_thread(&member, local_siginfo(SIGKILL, SigVal::Int(0)));
        }
        return Ok(());
    }

    proc.signals.enqueue(local_siginfo(signo, SigVal::Int(0)))?;

    if signo == SIGCONT {
        for member in proc.threads() {
            if member.lock().state == ThreadState::Stopped {
                let _ = lifecycle::thread_wakeup(&member, WakeReason::Normal);
            }
        }
    }

    wait::wakeup_all_on(&proc.signals.waiters, WakeReason::Normal);
    for member in proc.threads() {
        if !member.lock().sigmask.contains(signo) {
            let _ = lifecycle::thread_wakeup(&member, WakeReason::Interrupt);
            break;
        }
    }
    Ok(())
}

/// Install a new action for `signo` on `thread`'s group, returning the
/// old one. SIGKILL and SIGSTOP dispositions are immutable.
pub fn sigaction_for(thread: &Arc<Thread>, signo: usize, act: Option<SigAction>) -> KResult<SigAction> {
    if sig_bad(signo) || signo == SIGKILL || signo == crate::signal::SIGSTOP {
        return Err(Error::Inval);
    }
    let desc = thread.lock().signals.clone().ok_or(Error::Inval)?;
    match act {
        Some(act) => Ok(desc.set_action(signo, act)),
        None => Ok(desc.action(signo)),
    }
}

/// `sigaction` for the calling thread's group.
pub fn sigaction(signo: usize, act: Option<SigAction>) -> KResult<SigAction> {
    let current = percpu::current().ok_or(Error::Srch)?;
    sigaction_for(&current, signo, act)
}

/// Adjust `thread`'s blocked mask; SIGKILL and SIGSTOP can never be
/// blocked. Returns the previous mask.
pub fn sigmask_for(thread: &Arc<Thread>, how: SigHow, set: Option<SigSet>) -> KResult<SigSet> {
    let mut inner = thread.lock();
    let old = inner.sigmask;
    if let Some(set) = set {
        inner.sigmask.apply(how, set);
        inner.sigmask.del(SIGKILL);
        inner.sigmask.del(crate::signal::SIGSTOP);
    }
    Ok(old)
}

/// `sigprocmask` for the calling thread.
pub fn sigprocmask(how: SigHow, set: Option<SigSet>) -> KResult<SigSet> {
    let current = percpu::current().ok_or(Error::Srch)?;
    sigmask_for(&current, how, set)
}

/// `pthread_sigmask` is `sigprocmask` with per-thread scope, which is
/// the only scope masks have here.
pub fn pthread_sigmask(how: SigHow, set: Option<SigSet>) -> KResult<SigSet> {
    sigprocmask(how, set)
}

/// Signals pending against `thread` (own set plus the process set),
/// restricted to those currently blocked.
pub fn sigpending_for(thread: &Arc<Thread>) -> SigSet {
    let blocked = thread.lock().sigmask;
    queues::pending_union(thread).intersect(blocked)
}

pub fn sigpending() -> KResult<SigSet> {
    let current = percpu::current().ok_or(Error::Srch)?;
    Ok(sigpending_for(&current))
}

/// Non-blocking probe used by the wait entry points and tests: dequeue
/// the next pending signal from `set`, bypassing handlers.
pub fn sigwait_poll_for(thread: &Arc<Thread>, set: SigSet) -> Option<SigInfo> {
    queues::signal_dequeue_from_set(thread, set)
}

fn sigwait_block(set: SigSet, deadline: Option<u64>) -> KResult<SigInfo> {
    let current = percpu::current().ok_or(Error::Srch)?;
    let timer = deadline.map(time::posix::arm_thread_wakeup);

    let result = loop {
        if let Some(info) = queues::signal_dequeue_from_set(&current, set) {
            break Ok(info);
        }
        if current.killed() {
            break Err(Error::Intr);
        }
        if let Some(deadline) = deadline {
            if time::jiffies() >= deadline {
                break Err(Error::Again);
            }
        }

        let desc = current.lock().signals.clone().ok_or(Error::Inval)?;
        // Re-check under the record lock so a send between the poll and
        // the sleep cannot be lost.
        let thread_pending = current.lock().sigpending;
        let state = desc.lock_state();
        if !thread_pending.union(state.pending).intersect(set).is_empty() {
            continue;
        }
        let (state, woke) = wait::wait_on(&desc.waiters, ThreadState::Sleep, state);
        drop(state);
        match woke {
            Ok(()) | Err(Error::TimedOut) => {}
            Err(err) => break Err(err),
        }
    };

    if let Some(Ok(id)) = timer {
        let _ = time::posix::timer_delete(id);
    }
    result
}

/// Block until a signal in `set` is pending, then dequeue it without
/// running its handler.
pub fn sigwaitinfo(set: SigSet) -> KResult<SigInfo> {
    sigwait_block(set, None)
}

/// `sigwaitinfo` with a deadline; `Again` after it passes.
pub fn sigtimedwait(set: SigSet, timeout: &TimeSpec) -> KResult<SigInfo> {
    let deadline = time::jiffies() + time::jiffies_from_timespec(timeout);
    sigwait_block(set, Some(deadline))
}

/// Replace the mask, wait for any deliverable signal, dispatch it, and
/// restore the mask. Always returns `Err(Intr)`.
pub fn sigsuspend(mask: SigSet) -> KResult<()> {
    let current = percpu::current().ok_or(Error::Srch)?;
    let saved = sigmask_for(&current, SigHow::SetMask, Some(mask))?;

    loop {
        if dispatch::dispatch_pending() > 0 {
            break;
        }
        let desc = current.lock().signals.clone().ok_or(Error::Inval)?;
        let state = desc.lock_state();
        let (state, woke) = wait::wait_on(&desc.waiters, ThreadState::Sleep, state);
        drop(state);
        if woke == Err(Error::Intr) && current.killed() {
            break;
        }
    }

    let _ = sigmask_for(&current, SigHow::SetMask, Some(saved));
    Err(Error::Intr)
}

/// Wait until any signal is delivered.
pub fn pause() -> KResult<()> {
    let current = percpu::current().ok_or(Error::Srch)?;
    loop {
        if dispatch::dispatch_pending() > 0 {
            return Err(Error::Intr);
        }
        if current.killed() {
            return Err(Error::Intr);
        }
        let desc = current.lock().signals.clone().ok_or(Error::Inval)?;
        let state = desc.lock_state();
        let (state, _woke) = wait::wait_on(&desc.waiters, ThreadState::Sleep, state);
        drop(state);
    }
}

/// Arm (or cancel, with 0) a SIGALRM delivery to the calling thread in
/// `secs` seconds. Returns seconds remaining on a previously armed
/// alarm.
pub fn alarm(secs: u64) -> KResult<u64> {
    let current = percpu::current().ok_or(Error::Srch)?;
    time::posix::alarm_for(&current, secs)
}

/// Wake one sigwait sleeper on a record; timer expiry uses this.
pub fn wake_one_waiter(desc: &SignalDesc) {
    let _ = wait::wakeup_on(&desc.waiters, WakeReason::Normal, Whence::Head);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::create::{CreateFlags, thread_create};
    use crate::signal::{SIGUSR1, SigDefault, SigHandler, sig_default_action};

    fn noop_entry(_arg: usize) {}

    fn make_thread() -> Arc<Thread> {
        thread_create(None, noop_entry, 0, CreateFlags::GROUP).unwrap()
    }

    #[test]
    fn sigqueue_preserves_fifo_per_signal() {
        // 100 queued SIGUSR1 payloads come back in send order.
        let t = make_thread();
        for i in 0..100 {
            pthread_sigqueue(t.tid(), SIGUSR1, SigVal::Int(i)).unwrap();
        }
        for i in 0..100 {
            let info = sigwait_poll_for(&t, SigSet::of(SIGUSR1)).expect("queued signal");
            assert_eq!(info.signo, SIGUSR1);
            assert_eq!(info.value, SigVal::Int(i));
        }
        assert!(sigwait_poll_for(&t, SigSet::of(SIGUSR1)).is_none());
    }

    #[test]
    fn pending_bit_is_sticky_until_queue_drains() {
        let t = make_thread();
        pthread_sigqueue(t.tid(), SIGUSR1, SigVal::Int(1)).unwrap();
        pthread_sigqueue(t.tid(), SIGUSR1, SigVal::Int(2)).unwrap();
        assert!(t.lock().sigpending.contains(SIGUSR1));

        let _ = sigwait_poll_for(&t, SigSet::of(SIGUSR1)).unwrap();
        assert!(t.lock().sigpending.contains(SIGUSR1), "bit cleared with records queued");
        let _ = sigwait_poll_for(&t, SigSet::of(SIGUSR1)).unwrap();
        assert!(!t.lock().sigpending.contains(SIGUSR1));
    }

    #[test]
    fn blocked_signal_stays_pending_and_bypasses_handler() {
        // Blocked SIGUSR1 with payload 7 is invisible to ordinary
        // delivery but retrievable via the sigwait path.
        let t = make_thread();
        sigmask_for(&t, SigHow::Block, Some(SigSet::of(SIGUSR1))).unwrap();
        pthread_sigqueue(t.tid(), SIGUSR1, SigVal::Int(7)).unwrap();

        assert!(queues::signal_dequeue(&t).is_none(), "blocked signal delivered");
        assert!(sigpending_for(&t).contains(SIGUSR1));

        let info = sigwait_poll_for(&t, SigSet::of(SIGUSR1)).expect("sigwait sees it");
        assert_eq!(info.value, SigVal::Int(7));
    }

    #[test]
    fn kill_and_stop_are_unblockable_and_unhandlable() {
        let t = make_thread();
        sigmask_for(&t, SigHow::Block, Some(SigSet::full())).unwrap();
        let mask = t.lock().sigmask;
        assert!(!mask.contains(SIGKILL));
        assert!(!mask.contains(crate::signal::SIGSTOP));

        assert_eq!(sigaction_for(&t, SIGKILL, Some(SigAction::default())), Err(Error::Inval));
        assert_eq!(
            sigaction_for(&t, crate::signal::SIGSTOP, Some(SigAction::default())),
            Err(Error::Inval)
        );
    }

    #[test]
    fn sigkill_forces_zombie_with_termination_status() {
        // A killed thread reaches ZOMBIE at the next scheduler pass,
        // exit status 128 + SIGKILL.
        let t = make_thread();
        pthread_kill(t.tid(), SIGKILL).unwrap();
        assert!(t.killed());

        assert!(crate::scheduler::check_killed(&t));
        let inner = t.lock();
        assert_eq!(inner.state, ThreadState::Zombie);
        assert_eq!(inner.exit_code, 128 + SIGKILL);
    }

    #[test]
    fn process_directed_signals_land_in_shared_record() {
        let t = make_thread();
        let pid = t.lock().proc.as_ref().unwrap().pid();
        kill(pid, SIGUSR1).unwrap();

        // Not on the thread's own queue, but visible and dequeueable.
        assert!(!t.lock().sigpending.contains(SIGUSR1));
        let info = sigwait_poll_for(&t, SigSet::of(SIGUSR1)).expect("process-wide pending");
        assert_eq!(info.signo, SIGUSR1);
    }

    #[test]
    fn thread_directed_precedes_process_directed() {
        let t = make_thread();
        let pid = t.lock().proc.as_ref().unwrap().pid();
        kill(pid, SIGUSR1).unwrap();
        pthread_sigqueue(t.tid(), SIGUSR1, SigVal::Int(42)).unwrap();

        let first = queues::signal_dequeue(&t).expect("deliverable").0;
        assert_eq!(first.value, SigVal::Int(42), "thread-directed must win");
        let second = queues::signal_dequeue(&t).expect("process record next").0;
        assert_eq!(second.value, SigVal::Int(0));
    }

    #[test]
    fn lowest_signal_number_delivered_first() {
        let t = make_thread();
        pthread_sigqueue(t.tid(), crate::signal::SIGUSR2, SigVal::Int(0)).unwrap();
        pthread_sigqueue(t.tid(), crate::signal::SIGHUP, SigVal::Int(0)).unwrap();
        pthread_sigqueue(t.tid(), SIGUSR1, SigVal::Int(0)).unwrap();

        let order: alloc::vec::Vec<usize> = core::iter::from_fn(|| {
            queues::signal_dequeue(&t).map(|(info, _)| info.signo)
        })
        .collect();
        assert_eq!(order, [crate::signal::SIGHUP, SIGUSR1, crate::signal::SIGUSR2]);
    }

    #[test]
    fn ignored_default_is_discarded() {
        let t = make_thread();
        assert_eq!(sig_default_action(crate::signal::SIGCHLD), SigDefault::Ignore);
        pthread_kill(t.tid(), crate::signal::SIGCHLD).unwrap();
        let (info, act) = queues::signal_dequeue(&t).unwrap();
        assert_eq!(act.handler, SigHandler::Default);
        dispatch::deliver_one(&t, info, act);
        // Still alive, nothing staged.
        assert!(!t.killed());
        assert_eq!(t.lock().state, ThreadState::Embryo);
    }

    #[test]
    fn default_terminate_stages_kill_for_non_current() {
        let t = make_thread();
        pthread_kill(t.tid(), crate::signal::SIGTERM).unwrap();
        let (info, act) = queues::signal_dequeue(&t).unwrap();
        dispatch::deliver_one(&t, info, act);
        assert!(t.killed());
        assert_eq!(t.lock().exit_code, 128 + crate::signal::SIGTERM);
    }
}
