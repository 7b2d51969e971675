//! Thread control block and the global thread registry.
//!
//! A thread is a separately allocated, reference-counted control block;
//! its kernel stack is an owned sibling resource inside the architecture
//! half. All mutable state lives behind the per-thread spinlock except
//! the flag word and remaining timeslice, which interrupt-context code
//! reads and writes atomically.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bitflags::bitflags;
use lazy_static::lazy_static;

use crate::KResult;
use crate::arch::x86_64::context::ArchThread;
use crate::ds::queue::Queue;
use crate::errno::Error;
use crate::memory::mmap::AddressSpace;
use crate::scheduler::process::Process;
use crate::signal::queues::SignalDesc;
use crate::signal::{NSIG, SigInfo, SigSet};
use crate::sync::cond::Cond;
use crate::sync::spinlock::{SpinGuard, SpinLock};
use crate::time::posix::TimerQueue;

pub type Tid = usize;

/// Thread entry point. Returning from it exits the thread with status 0.
pub type ThreadEntry = fn(usize);

/// Queue of thread handles; run queues, wait queues, groups, registries.
pub type ThreadQueue = Queue<Arc<Thread>>;

/// Per-signal FIFO of queued occurrences.
pub type SigQueue = Queue<SigInfo>;

/// Default and maximum kernel stack sizes.
pub const KSTACK_SIZE: usize = 32 * 1024;
pub const KSTACK_MAXSIZE: usize = 256 * 1024;

/// Default and maximum user stack sizes.
pub const USTACK_SIZE: usize = 32 * 1024;
pub const USTACK_MAXSIZE: usize = 256 * 1024;

/// Thread lifecycle states. `Zombie` retains its kernel stack until
/// reaped; `Terminated` resources are fully reclaimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Embryo,
    Ready,
    Running,
    Sleep,
    Stopped,
    Zombie,
    Terminated,
}

impl ThreadState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadState::Embryo => "EMBRYO",
            ThreadState::Ready => "READY",
            ThreadState::Running => "RUNNING",
            ThreadState::Sleep => "SLEEP",
            ThreadState::Stopped => "STOPPED",
            ThreadState::Zombie => "ZOMBIE",
            ThreadState::Terminated => "TERMINATED",
        }
    }
}

/// Why a sleeping thread was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WakeReason {
    #[default]
    Normal,
    Interrupt,
    Timeout,
    Error,
}

bitflags! {
    /// Atomic per-thread flag word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u64 {
        const USER             = 1 << 0;
        const DETACHED         = 1 << 1;
        const CANCELED         = 1 << 2;
        const STOPPED          = 1 << 3;
        const SUSPENDED        = 1 << 4;
        const INTERRUPTED      = 1 << 5;
        const KILL_EXEMPT      = 1 << 6;
        const STATE_TRANSITION = 1 << 7;
        const NEEDS_FPU_STATE  = 1 << 8;
        const IS_MAIN          = 1 << 9;
        const NO_PREEMPT       = 1 << 10;
        const NO_MIGRATE       = 1 << 11;
        const HANDLING_SIGNAL  = 1 << 12;
        const KILL             = 1 << 13;
        /// Thread belongs to the scheduler machinery itself.
        const SCHEDULER        = 1 << 14;
    }
}

/// CPU placement constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffinityKind {
    /// Prefer the current CPU, migration allowed.
    Soft,
    /// Run only on CPUs in the mask.
    Hard,
}

#[derive(Debug, Clone, Copy)]
pub struct Affinity {
    pub kind: AffinityKind,
    pub cpu_mask: u64,
}

impl Default for Affinity {
    fn default() -> Self {
        Affinity { kind: AffinityKind::Soft, cpu_mask: u64::MAX }
    }
}

/// Scheduling bookkeeping, all in jiffies unless noted.
#[derive(Debug, Clone, Default)]
pub struct SchedInfo {
    /// Quantum granted at the last dispatch.
    pub last_timeslice: u64,
    /// CPU time consumed.
    pub cpu_time: u64,
    /// Cumulative run time.
    pub total_time: u64,
    /// Passes spent waiting on a run queue; drives aging.
    pub age: u32,
    /// Creation, last-dispatch and exit timestamps.
    pub ctime: u64,
    pub last_sched: u64,
    pub exit_time: u64,
    pub sched_count: u64,
    /// MLFQ level, 0 (low) ..= 3 (high).
    pub prio: usize,
    /// CPU whose queues this thread last belonged to.
    pub cpu: usize,
    pub affinity: Affinity,
}

/// Mutable thread state, guarded by the thread lock.
pub struct ThreadInner {
    pub state: ThreadState,
    pub wakeup: WakeReason,
    /// Tid of the thread that terminated this one, if any.
    pub killer: Option<Tid>,
    pub name: String,
    pub entry: usize,
    pub exit_code: usize,
    pub sched: SchedInfo,
    pub sigmask: SigSet,
    /// Sticky per-thread pending set; a bit clears only when its queue
    /// drains.
    pub sigpending: SigSet,
    /// Wait queue currently holding this thread, while sleeping.
    pub wait_queue: Option<Arc<ThreadQueue>>,
    /// Armed `alarm(2)` timer, if any.
    pub alarm: Option<usize>,
    /// Signal masks saved across nested handler dispatches.
    pub saved_sigmasks: alloc::vec::Vec<SigSet>,
    // Shared with the thread group:
    pub proc: Option<Arc<Process>>,
    pub mmap: Option<Arc<AddressSpace>>,
    pub signals: Option<Arc<SignalDesc>>,
    pub group: Option<Arc<ThreadQueue>>,
    pub timers: Option<Arc<TimerQueue>>,
    pub main: Weak<Thread>,
}

/// Snapshot returned by join/get_info.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub ktid: Option<Tid>,
    pub tgid: usize,
    pub state: ThreadState,
    pub exit_code: usize,
    pub cpu_time: u64,
    pub total_time: u64,
    pub sched_count: u64,
    pub ctime: u64,
    pub exit_time: u64,
    pub name: String,
}

pub struct Thread {
    tid: Tid,
    flags: AtomicU64,
    /// Remaining quantum in jiffies; the tick decrements it.
    timeslice: AtomicU64,
    /// Broadcast on exit; join sleeps here.
    pub event: Cond,
    /// Per-thread per-signal FIFOs.
    pub sigqueue: [SigQueue; NSIG],
    /// Architecture half: kernel stack, saved context, user stack.
    /// Touched only by the owning CPU and the dispatch path.
    arch: UnsafeCell<ArchThread>,
    inner: SpinLock<ThreadInner>,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.tid == other.tid
    }
}

impl Eq for Thread {}

static NEXT_TID: AtomicUsize = AtomicUsize::new(1);

pub(super) fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

impl Thread {
    pub(super) fn construct(tid: Tid, arch: ArchThread, inner: ThreadInner) -> Arc<Thread> {
        Arc::new(Thread {
            tid,
            flags: AtomicU64::new(0),
            timeslice: AtomicU64::new(0),
            event: Cond::new(),
            sigqueue: [const { Queue::new() }; NSIG],
            arch: UnsafeCell::new(arch),
            inner: SpinLock::new(inner),
        })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn lock(&self) -> SpinGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, ThreadInner>> {
        self.inner.try_lock()
    }

    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub fn clear_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Relaxed);
    }

    pub fn has_flags(&self, flags: ThreadFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Pending forced termination that this thread may not ignore.
    pub fn killed(&self) -> bool {
        self.has_flags(ThreadFlags::KILL) && !self.has_flags(ThreadFlags::KILL_EXEMPT)
    }

    pub fn timeslice(&self) -> u64 {
        self.timeslice.load(Ordering::Relaxed)
    }

    pub fn set_timeslice(&self, jiffies: u64) {
        self.timeslice.store(jiffies, Ordering::Relaxed);
    }

    /// Burn one jiffy of quantum; saturates at zero.
    pub fn timeslice_drop(&self) {
        let _ = self
            .timeslice
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| t.checked_sub(1));
    }

    /// Architecture half. Callers must be the owning CPU's dispatch or
    /// signal path; the thread lock does not cover this.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn arch_mut(&self) -> &mut ArchThread {
        unsafe { &mut *self.arch.get() }
    }

    pub fn state(&self) -> ThreadState {
        self.lock().state
    }

    pub fn info(&self) -> ThreadInfo {
        let inner = self.lock();
        ThreadInfo {
            tid: self.tid,
            ktid: inner.killer,
            tgid: inner.proc.as_ref().map(|p| p.pid()).unwrap_or(0),
            state: inner.state,
            exit_code: inner.exit_code,
            cpu_time: inner.sched.cpu_time,
            total_time: inner.sched.total_time,
            sched_count: inner.sched.sched_count,
            ctime: inner.sched.ctime,
            exit_time: inner.sched.exit_time,
            name: inner.name.clone(),
        }
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread").field("tid", &self.tid).finish()
    }
}

lazy_static! {
    /// Every live thread in the system.
    static ref GLOBAL_THREADS: ThreadQueue = Queue::new();
}

pub fn register_global(thread: &Arc<Thread>) -> KResult<()> {
    GLOBAL_THREADS.lock().enqueue(thread.clone(), true)
}

pub fn unregister_global(thread: &Arc<Thread>) {
    let _ = GLOBAL_THREADS.lock().remove(thread);
}

/// Look a thread up by id in the global registry.
pub fn find_by_tid(tid: Tid) -> KResult<Arc<Thread>> {
    let q = GLOBAL_THREADS.lock();
    q.iter().find(|t| t.tid() == tid).cloned().ok_or(Error::Srch)
}

/// Snapshot of all registered threads, for diagnostics.
pub fn all_threads() -> alloc::vec::Vec<Arc<Thread>> {
    GLOBAL_THREADS.lock().iter().cloned().collect()
}

/// Info lookup by id.
pub fn thread_get_info_by_id(tid: Tid) -> KResult<ThreadInfo> {
    Ok(find_by_tid(tid)?.info())
}
