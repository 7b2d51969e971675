//! Thread lifecycle: exit, join, cancellation, wakeup.

use alloc::sync::Arc;

use crate::KResult;
use crate::errno::Error;
use crate::percpu;
use crate::scheduler::{self, thread};
use crate::scheduler::thread::{
    Thread, ThreadFlags, ThreadInfo, ThreadState, Tid, WakeReason,
};
use crate::time;

/// Terminate the calling thread. The exit status is published, the
/// thread becomes a ZOMBIE, and the scheduler broadcasts its event
/// condition so joiners can reap it. Never returns.
pub fn thread_exit(status: usize) -> ! {
    let current = percpu::current().expect("thread_exit outside a thread");
    {
        let mut inner = current.lock();
        inner.exit_code = status;
        inner.state = ThreadState::Zombie;
        inner.sched.exit_time = time::jiffies();
    }
    scheduler::reschedule();
    unreachable!("zombie thread rescheduled");
}

/// C-ABI wrapper used by the first-run trampoline when a kernel thread's
/// entry function returns.
pub extern "C" fn thread_exit_c(status: usize) {
    thread_exit(status);
}

/// Wait for `tid` to exit, then reap it: copy out its info and return
/// value, promote it to TERMINATED, and release its registry references.
pub fn thread_join(tid: Tid) -> KResult<(ThreadInfo, usize)> {
    let target = thread::find_by_tid(tid)?;
    if target.has_flags(ThreadFlags::DETACHED) {
        return Err(Error::Inval);
    }
    if let Some(current) = percpu::current() {
        if current.tid() == tid {
            return Err(Error::Inval);
        }
    }

    loop {
        let inner = target.lock();
        match inner.state {
            ThreadState::Zombie => {
                drop(inner);
                return Ok(reap(&target));
            }
            ThreadState::Terminated => return Err(Error::Srch),
            _ => {
                // Sleep on the target's event condition until it exits.
                let (inner, woke) = target.event.wait(inner);
                drop(inner);
                woke?;
            }
        }
    }
}

/// Promote a zombie to TERMINATED and strip it from the registries.
fn reap(target: &Arc<Thread>) -> (ThreadInfo, usize) {
    let info = target.info();
    let retval = {
        let mut inner = target.lock();
        inner.state = ThreadState::Terminated;
        inner.exit_code
    };
    let group = target.lock().group.clone();
    if let Some(group) = group {
        let _ = group.lock().remove(target);
    }
    thread::unregister_global(target);
    (info, retval)
}

/// Request asynchronous cancellation of `tid`: the KILL flag is set and
/// a sleeping target is woken with the interrupt reason. The target
/// observes the flag at its next suspension point or dispatch.
pub fn thread_cancel(tid: Tid) -> KResult<()> {
    let target = thread::find_by_tid(tid)?;
    if target.has_flags(ThreadFlags::KILL_EXEMPT) {
        return Err(Error::Perm);
    }
    target.set_flags(ThreadFlags::KILL | ThreadFlags::CANCELED);
    {
        let mut inner = target.lock();
        inner.killer = percpu::current().map(|t| t.tid());
    }
    let _ = thread_wakeup(&target, WakeReason::Interrupt);
    Ok(())
}

/// Set KILL on every peer of the calling thread's group (exempt threads
/// excluded) and wake any sleepers. Used during process teardown.
pub fn thread_kill_all() -> KResult<usize> {
    let current = percpu::current().ok_or(Error::Srch)?;
    let group = current.lock().group.clone().ok_or(Error::Srch)?;

    let peers: alloc::vec::Vec<Arc<Thread>> = group.lock().iter().cloned().collect();
    let mut killed = 0;
    for peer in peers {
        if peer.tid() == current.tid() || peer.has_flags(ThreadFlags::KILL_EXEMPT) {
            continue;
        }
        peer.set_flags(ThreadFlags::KILL);
        {
            let mut inner = peer.lock();
            inner.killer = Some(current.tid());
        }
        let _ = thread_wakeup(&peer, WakeReason::Interrupt);
        killed += 1;
    }
    Ok(killed)
}

/// Make a blocked thread runnable, recording why it was woken.
///
/// The wait-queue reference is re-read after taking the queue lock so a
/// concurrent waker that beat us cannot leave the thread linked on a
/// queue it no longer sleeps on (queue lock before thread lock).
pub fn thread_wakeup(target: &Arc<Thread>, reason: WakeReason) -> KResult<()> {
    loop {
        let wq = {
            let inner = target.lock();
            match inner.state {
                ThreadState::Sleep | ThreadState::Stopped => inner.wait_queue.clone(),
                _ => return Ok(()),
            }
        };

        match wq {
            None => {
                let mut inner = target.lock();
                if !matches!(inner.state, ThreadState::Sleep | ThreadState::Stopped) {
                    return Ok(());
                }
                inner.wakeup = reason;
                inner.state = ThreadState::Ready;
                drop(inner);
                scheduler::enqueue_ready(target);
                return Ok(());
            }
            Some(wq) => {
                let mut q = wq.lock();
                let mut inner = target.lock();
                let still_here = inner
                    .wait_queue
                    .as_ref()
                    .map(|cur| Arc::ptr_eq(cur, &wq))
                    .unwrap_or(false);
                if !still_here {
                    continue;
                }
                if q.remove(target).is_err() {
                    continue;
                }
                inner.wait_queue = None;
                inner.wakeup = reason;
                inner.state = ThreadState::Ready;
                drop(inner);
                drop(q);
                scheduler::enqueue_ready(target);
                return Ok(());
            }
        }
    }
}

/// Whether the calling thread has a pending cancellation; clears and
/// reports the wake reason of an interrupted sleep.
pub fn current_interrupted() -> Option<WakeReason> {
    let current = percpu::current()?;
    if current.killed() {
        return Some(WakeReason::Interrupt);
    }
    let inner = current.lock();
    match inner.wakeup {
        WakeReason::Normal => None,
        reason => Some(reason),
    }
}

/// Final hop into user mode after an exec-style load: focus the target
/// address space and jump through the prepared user frame.
pub fn switch_to_userspace(target: &Arc<Thread>) -> KResult<u64> {
    let mmap = target.lock().mmap.clone().ok_or(Error::Inval)?;
    let old_pdbr = mmap.set_focus();
    #[cfg(target_os = "none")]
    {
        crate::arch::x86_64::gdt::set_kernel_stack(unsafe { target.arch_mut().kstack.top() as u64 });
    }
    Ok(old_pdbr)
}

/// Sleep the calling thread for `jiffies` ticks.
pub fn sleep_jiffies(jiffies: u64) -> KResult<()> {
    time::posix::sleep_until(time::jiffies() + jiffies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::create::{CreateFlags, thread_create};
    use crate::scheduler::mlfq;
    use crate::test_support::SCHED_SERIAL;

    fn noop(_: usize) {}

    fn make_thread() -> Arc<Thread> {
        thread_create(None, noop, 0, CreateFlags::GROUP).unwrap()
    }

    #[test]
    fn join_reaps_a_zombie_without_blocking() {
        let target = make_thread();
        let tid = target.tid();
        {
            let mut inner = target.lock();
            inner.state = ThreadState::Zombie;
            inner.exit_code = 42;
        }

        let (info, status) = thread_join(tid).unwrap();
        assert_eq!(status, 42);
        assert_eq!(info.tid, tid);
        assert_eq!(target.lock().state, ThreadState::Terminated);
        // Reaped out of the registry and its group.
        assert!(thread::find_by_tid(tid).is_err());
        let group = target.lock().group.clone().unwrap();
        assert!(!group.lock().contains(&target));
    }

    #[test]
    fn join_refuses_detached_threads() {
        let target = thread_create(None, noop, 0, CreateFlags::GROUP | CreateFlags::DETACHED).unwrap();
        assert_eq!(thread_join(target.tid()).err(), Some(Error::Inval));
    }

    #[test]
    fn cancel_sets_kill_and_cancel_flags() {
        let target = make_thread();
        thread_cancel(target.tid()).unwrap();
        assert!(target.has_flags(ThreadFlags::KILL));
        assert!(target.has_flags(ThreadFlags::CANCELED));
        assert!(target.killed());
    }

    #[test]
    fn cancel_respects_kill_exemption() {
        let target = make_thread();
        target.set_flags(ThreadFlags::KILL_EXEMPT);
        assert_eq!(thread_cancel(target.tid()), Err(Error::Perm));
        assert!(!target.killed());
    }

    #[test]
    fn wakeup_of_a_runnable_thread_is_a_noop() {
        let target = make_thread();
        thread_wakeup(&target, WakeReason::Normal).unwrap();
        assert_eq!(target.lock().state, ThreadState::Embryo);
    }

    #[test]
    fn wakeup_requeues_a_sleeper() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        crate::percpu::set_online(1);

        let target = make_thread();
        {
            let mut inner = target.lock();
            inner.state = ThreadState::Sleep;
            inner.wait_queue = None;
        }
        thread_wakeup(&target, WakeReason::Timeout).unwrap();
        {
            let inner = target.lock();
            assert_eq!(inner.state, ThreadState::Ready);
            assert_eq!(inner.wakeup, WakeReason::Timeout);
        }

        // It landed on the run queue; clean it back off.
        let picked = mlfq::pick_next(0).expect("woken thread queued");
        assert_eq!(picked.tid(), target.tid());
    }

    #[test]
    fn wakeup_removes_sleeper_from_its_wait_queue() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        crate::percpu::set_online(1);

        let target = make_thread();
        let wq: Arc<crate::scheduler::thread::ThreadQueue> =
            Arc::new(crate::ds::queue::Queue::new());
        {
            let mut q = wq.lock();
            q.enqueue(target.clone(), true).unwrap();
        }
        {
            let mut inner = target.lock();
            inner.state = ThreadState::Sleep;
            inner.wait_queue = Some(wq.clone());
        }

        thread_wakeup(&target, WakeReason::Interrupt).unwrap();
        assert_eq!(wq.count(), 0, "sleeper must leave the wait queue");
        assert_eq!(target.lock().state, ThreadState::Ready);

        let picked = mlfq::pick_next(0).expect("woken thread queued");
        assert_eq!(picked.tid(), target.tid());
    }

    #[test]
    fn info_lookup_by_tid() {
        let target = make_thread();
        let info = thread::thread_get_info_by_id(target.tid()).unwrap();
        assert_eq!(info.tid, target.tid());
        assert_eq!(info.state, ThreadState::Embryo);
        assert!(thread::thread_get_info_by_id(usize::MAX).is_err());
    }
}
