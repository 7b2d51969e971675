//! POSIX timers.
//!
//! Timers live on two queues: their owner's per-process list and the
//! global list, which is kept sorted by absolute expiry jiffy. A
//! dedicated worker thread dispatches expired timers — a signal to a
//! thread or process, a spawned thread, an in-place callback, or a plain
//! owner wakeup for timed sleeps — and re-arms periodic ones.
//! Destruction removes the per-process entry first, then the global one.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use lazy_static::lazy_static;

use crate::KResult;
use crate::ds::queue::{Queue, SortOrder};
use crate::errno::Error;
use crate::percpu;
use crate::scheduler::create::{CreateFlags, thread_create};
use crate::scheduler::lifecycle;
use crate::scheduler::thread::{Thread, ThreadEntry, ThreadState, WakeReason};
use crate::signal::{SIGALRM, SigInfo, SigVal};
use crate::sync::event::AwaitEvent;
use crate::sync::spinlock::SpinLock;
use crate::time::{self, SYS_HZ, TimeSpec};

pub type TimerId = usize;

/// Queue of timers owned by one process.
pub type TimerQueue = Queue<Arc<PosixTimer>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockId {
    Monotonic,
    Realtime,
}

/// What an expired timer does.
#[derive(Clone, Copy)]
pub enum TimerAction {
    /// Queue a signal on the owner thread.
    SignalThread { signo: usize, value: SigVal },
    /// Queue a signal on the owner's process.
    SignalProcess { signo: usize },
    /// Spawn a kernel thread running `entry(arg)`.
    SpawnThread { entry: ThreadEntry, arg: usize },
    /// Call `func(arg)` on the worker thread.
    Callback { func: fn(usize), arg: usize },
    /// Wake the owner from a timed sleep.
    WakeOwner,
}

pub struct TimerState {
    /// Absolute expiry jiffy; zero while disarmed.
    pub expiry: u64,
    /// Re-arm interval in jiffies; zero for one-shot.
    pub interval: u64,
}

pub struct PosixTimer {
    id: TimerId,
    pub owner: Arc<Thread>,
    pub clockid: ClockId,
    pub action: TimerAction,
    pub state: SpinLock<TimerState>,
}

impl PartialEq for PosixTimer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl PosixTimer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    fn expiry(&self) -> u64 {
        self.state.lock().expiry
    }
}

static NEXT_TIMER_ID: AtomicUsize = AtomicUsize::new(1);

lazy_static! {
    /// All armed timers, sorted by expiry.
    static ref KTIMERS: TimerQueue = Queue::new();
    /// Every live timer, armed or not; id lookups scan this.
    static ref TIMERS: TimerQueue = Queue::new();
    /// Kicked by the tick when the head timer expires.
    static ref WORKER_EVENT: AwaitEvent = AwaitEvent::new();
}

fn owner_queue(owner: &Arc<Thread>) -> Option<Arc<TimerQueue>> {
    owner.lock().timers.clone()
}

/// Create a timer owned by `owner`. Disarmed until `timer_settime`.
pub fn timer_create_for(
    owner: &Arc<Thread>,
    clockid: ClockId,
    action: TimerAction,
) -> KResult<TimerId> {
    let timer = Arc::new(PosixTimer {
        id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
        owner: owner.clone(),
        clockid,
        action,
        state: SpinLock::new(TimerState { expiry: 0, interval: 0 }),
    });

    if let Some(q) = owner_queue(owner) {
        q.lock().enqueue(timer.clone(), true)?;
    }
    TIMERS.lock().enqueue(timer.clone(), true)?;
    Ok(timer.id)
}

/// Create a timer for the calling thread.
pub fn timer_create(clockid: ClockId, action: TimerAction) -> KResult<TimerId> {
    let current = percpu::current().ok_or(Error::Srch)?;
    timer_create_for(&current, clockid, action)
}

fn find_by_id(id: TimerId) -> KResult<Arc<PosixTimer>> {
    let q = TIMERS.lock();
    q.iter().find(|t| t.id == id).cloned().ok_or(Error::NoEnt)
}

fn arm(timer: &Arc<PosixTimer>) -> KResult<()> {
    let mut q = KTIMERS.lock();
    let _ = q.remove(timer);
    q.enqueue_sorted(timer.clone(), true, SortOrder::Ascending, |a, b| {
        a.expiry().cmp(&b.expiry())
    })
}

/// Arm or rearm: `value` is the first expiry (absolute when `abstime`),
/// `interval` the period. Returns the previous settings.
pub fn timer_settime(
    id: TimerId,
    abstime: bool,
    value: &TimeSpec,
    interval: &TimeSpec,
) -> KResult<(TimeSpec, TimeSpec)> {
    if !value.valid() || !interval.valid() {
        return Err(Error::Inval);
    }
    let timer = find_by_id(id)?;

    let old = {
        let mut state = timer.state.lock();
        let old = (
            time::timespec_from_jiffies(state.expiry.saturating_sub(time::jiffies())),
            time::timespec_from_jiffies(state.interval),
        );
        let mut expiry = time::jiffies_from_timespec(value);
        if !abstime {
            expiry += time::jiffies();
        }
        state.expiry = expiry;
        state.interval = time::jiffies_from_timespec(interval);
        old
    };

    arm(&timer)?;
    Ok(old)
}

/// Remaining time and interval of an armed timer.
pub fn timer_gettime(id: TimerId) -> KResult<(TimeSpec, TimeSpec)> {
    let timer = find_by_id(id)?;
    let state = timer.state.lock();
    Ok((
        time::timespec_from_jiffies(state.expiry.saturating_sub(time::jiffies())),
        time::timespec_from_jiffies(state.interval),
    ))
}

/// Destroy a timer: the owner's list entry goes first, then the global
/// entry.
pub fn timer_delete(id: TimerId) -> KResult<()> {
    let timer = find_by_id(id)?;
    if let Some(q) = owner_queue(&timer.owner) {
        let _ = q.lock().remove(&timer);
    }
    let _ = KTIMERS.lock().remove(&timer);
    let _ = TIMERS.lock().remove(&timer);
    Ok(())
}

/// Internal: one-shot wakeup of the calling thread at `deadline`, used
/// by timed waits. Returns the timer id for cancellation.
pub fn arm_thread_wakeup(deadline: u64) -> KResult<TimerId> {
    let current = percpu::current().ok_or(Error::Srch)?;
    let id = timer_create_for(&current, ClockId::Monotonic, TimerAction::WakeOwner)?;
    let timer = find_timer_on_owner(&current, id)?;
    timer.state.lock().expiry = deadline;
    arm(&timer)?;
    Ok(id)
}

fn find_timer_on_owner(owner: &Arc<Thread>, id: TimerId) -> KResult<Arc<PosixTimer>> {
    let q = owner_queue(owner).ok_or(Error::NoEnt)?;
    let q = q.lock();
    q.iter().find(|t| t.id == id).cloned().ok_or(Error::NoEnt)
}

/// Pop the first expired timer off the global queue.
fn get_expired(now: u64) -> Option<Arc<PosixTimer>> {
    let mut q = KTIMERS.lock();
    let head_expired = q.peek(crate::ds::queue::Whence::Head).map(|t| t.expiry() <= now).unwrap_or(false);
    if head_expired { q.dequeue().ok() } else { None }
}

/// Tick hook: kick the worker when the head timer is due.
pub fn check_expiry(now: u64) {
    let due = {
        let q = KTIMERS.lock();
        q.peek(crate::ds::queue::Whence::Head).map(|t| t.expiry() <= now).unwrap_or(false)
    };
    if due {
        WORKER_EVENT.wakeup();
    }
}

fn dispatch(timer: &Arc<PosixTimer>) {
    match timer.action {
        TimerAction::SignalThread { signo, value } => {
            let info = SigInfo { signo, value, ..SigInfo::default() };
            let _ = crate::signal::api::send_to_thread(&timer.owner, info);
        }
        TimerAction::SignalProcess { signo } => {
            let pid = timer.owner.lock().proc.as_ref().map(|p| p.pid());
            if let Some(pid) = pid {
                let _ = crate::signal::kill(pid, signo);
            }
        }
        TimerAction::SpawnThread { entry, arg } => {
            let _ = thread_create(None, entry, arg, CreateFlags::SCHED);
        }
        TimerAction::Callback { func, arg } => func(arg),
        TimerAction::WakeOwner => {
            let _ = lifecycle::thread_wakeup(&timer.owner, WakeReason::Timeout);
        }
    }
}

/// Timer worker builtin thread: dispatch everything due, re-arm
/// periodic timers, sleep until the next expiry kick.
pub fn timer_worker_entry(_arg: usize) {
    log::info!("timer worker running");
    loop {
        let _ = WORKER_EVENT.await_event();
        while let Some(timer) = get_expired(time::jiffies()) {
            dispatch(&timer);
            let rearm = {
                let mut state = timer.state.lock();
                if state.interval > 0 {
                    state.expiry += state.interval;
                    true
                } else {
                    state.expiry = 0;
                    false
                }
            };
            if rearm {
                let _ = arm(&timer);
            }
        }
    }
}

/// `alarm(2)` backend: one SIGALRM to `thread` in `secs` seconds;
/// `secs == 0` cancels. Returns whole seconds remaining on the
/// previously armed alarm.
pub fn alarm_for(thread: &Arc<Thread>, secs: u64) -> KResult<u64> {
    let previous = thread.lock().alarm;
    let remaining = match previous {
        Some(id) => {
            let left = timer_gettime(id).map(|(value, _)| value.sec.max(0) as u64).unwrap_or(0);
            let _ = timer_delete(id);
            left
        }
        None => 0,
    };

    if secs == 0 {
        thread.lock().alarm = None;
        return Ok(remaining);
    }

    let id = timer_create_for(
        thread,
        ClockId::Realtime,
        TimerAction::SignalThread { signo: SIGALRM, value: SigVal::Int(0) },
    )?;
    let timer = find_timer_on_owner(thread, id)?;
    timer.state.lock().expiry = time::jiffies() + secs * SYS_HZ;
    arm(&timer)?;
    thread.lock().alarm = Some(id);
    Ok(remaining)
}

/// Sleep the calling thread until `deadline` (absolute jiffies).
pub fn sleep_until(deadline: u64) -> KResult<()> {
    let current = percpu::current().ok_or(Error::Srch)?;
    let timer = arm_thread_wakeup(deadline)?;

    let result = loop {
        if time::jiffies() >= deadline {
            break Ok(());
        }
        if current.killed() {
            break Err(Error::Intr);
        }
        {
            let mut inner = current.lock();
            inner.state = ThreadState::Sleep;
            inner.wakeup = WakeReason::Normal;
            inner.wait_queue = None;
        }
        crate::scheduler::reschedule();
        let reason = current.lock().wakeup;
        if reason == WakeReason::Interrupt {
            break Err(Error::Intr);
        }
    };

    let _ = timer_delete(timer);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::create::{CreateFlags, thread_create};
    use crate::signal::{SIGUSR1, SigSet};

    fn noop(_: usize) {}

    fn make_thread() -> Arc<Thread> {
        thread_create(None, noop, 0, CreateFlags::GROUP).unwrap()
    }

    #[test]
    fn timers_sort_by_expiry() {
        let owner = make_thread();
        let mut ids = alloc::vec::Vec::new();
        for ms in [300u64, 100, 200] {
            let id = timer_create_for(
                &owner,
                ClockId::Monotonic,
                TimerAction::SignalThread { signo: SIGUSR1, value: SigVal::Int(ms as i64) },
            )
            .unwrap();
            timer_settime(id, false, &TimeSpec::from_ms(ms), &TimeSpec::default()).unwrap();
            ids.push(id);
        }

        {
            let q = KTIMERS.lock();
            let expiries: alloc::vec::Vec<u64> = q.iter().map(|t| t.expiry()).collect();
            let mut sorted = expiries.clone();
            sorted.sort_unstable();
            assert_eq!(expiries, sorted, "global timer queue must stay expiry-sorted");
        }

        for id in ids {
            timer_delete(id).unwrap();
        }
    }

    #[test]
    fn expired_timer_delivers_signal_and_rearms() {
        let owner = make_thread();
        let id = timer_create_for(
            &owner,
            ClockId::Monotonic,
            TimerAction::SignalThread { signo: SIGUSR1, value: SigVal::Int(9) },
        )
        .unwrap();
        timer_settime(id, true, &TimeSpec::default(), &TimeSpec::from_ms(50)).unwrap();

        // Expiry at jiffy zero is immediately due; emulate one worker
        // pass.
        let timer = find_timer_on_owner(&owner, id).unwrap();
        let popped = get_expired(time::jiffies() + 1).expect("timer due");
        assert!(Arc::ptr_eq(&popped, &timer));
        dispatch(&popped);
        {
            let mut state = popped.state.lock();
            assert!(state.interval > 0);
            state.expiry += state.interval;
        }
        arm(&popped).unwrap();

        let info = crate::signal::api::sigwait_poll_for(&owner, SigSet::of(SIGUSR1)).unwrap();
        assert_eq!(info.value, SigVal::Int(9));

        timer_delete(id).unwrap();
        assert_eq!(timer_gettime(id), Err(Error::NoEnt));
    }

    #[test]
    fn delete_removes_both_memberships() {
        let owner = make_thread();
        let id = timer_create_for(&owner, ClockId::Monotonic, TimerAction::WakeOwner).unwrap();
        timer_settime(id, false, &TimeSpec::from_ms(1000), &TimeSpec::default()).unwrap();

        timer_delete(id).unwrap();
        let own = owner.lock().timers.clone().unwrap();
        assert_eq!(own.count(), 0);
        assert!(KTIMERS.lock().iter().all(|t| t.id() != id));
    }
}
