//! Processes: thread groups plus their shared resources.
//!
//! A process is the set of threads sharing one address space, signal
//! record, credentials and POSIX timer list. It is created by
//! `proc_init` (the initial user program) or `fork`, and freed when the
//! last reference — child, waiter or member thread — drops.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use lazy_static::lazy_static;

use crate::KResult;
use crate::ds::bitmap::Bitmap;
use crate::ds::queue::Queue;
use crate::errno::Error;
use crate::memory::mmap::AddressSpace;
use crate::scheduler::create::{self, CreateFlags};
use crate::scheduler::thread::{
    KSTACK_SIZE, Thread, ThreadFlags, ThreadQueue, ThreadState, USTACK_SIZE,
};
use crate::signal::queues::SignalDesc;
use crate::sync::cond::Cond;
use crate::sync::spinlock::{SpinGuard, SpinLock};
use crate::time::posix::TimerQueue;

pub type Pid = usize;

/// Upper bound on live processes; bounds the pid bitmap.
pub const NPROC: usize = 4096;

/// Credentials shared by a thread group.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

pub struct ProcInner {
    pub pgid: Pid,
    pub sid: Pid,
    pub parent: Option<Weak<Process>>,
    /// Set when every member thread has exited.
    pub exit_code: Option<i32>,
    pub zombie: bool,
    /// Program entry point recorded by the loader.
    pub entry: u64,
    pub main: Weak<Thread>,
}

pub struct Process {
    pid: Pid,
    name: String,
    pub inner: SpinLock<ProcInner>,
    pub children: Queue<Arc<Process>>,
    /// Broadcast whenever a child changes status; wait sleeps here.
    pub child_event: Cond,
    /// The thread group queue, shared with every member thread.
    pub threads: Arc<ThreadQueue>,
    pub signals: Arc<SignalDesc>,
    pub timers: Arc<TimerQueue>,
    /// User address space; kernel-only groups have none.
    pub mmap: Option<Arc<AddressSpace>>,
    pub cred: SpinLock<Cred>,
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid
    }
}

impl Eq for Process {}

impl Process {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> SpinGuard<'_, ProcInner> {
        self.inner.lock()
    }

    pub fn is_zombie(&self) -> bool {
        self.lock().zombie
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Member threads snapshot.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().iter().cloned().collect()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).field("name", &self.name).finish()
    }
}

lazy_static! {
    static ref PIDS: Bitmap = {
        let bm = Bitmap::new(NPROC);
        // Pid 0 belongs to the kernel group.
        let _ = bm.lock().set(0, 1);
        bm
    };
    static ref PROCQ: Queue<Arc<Process>> = Queue::new();
}

fn alloc_pid() -> KResult<Pid> {
    PIDS.lock().alloc_range(1).map_err(|_| Error::Again)
}

fn free_pid(pid: Pid) {
    let _ = PIDS.lock().unset(pid, 1);
}

impl Drop for Process {
    fn drop(&mut self) {
        free_pid(self.pid);
    }
}

/// Register a process in the global queue.
fn procq_insert(proc: &Arc<Process>) -> KResult<()> {
    PROCQ.lock().enqueue(proc.clone(), true)
}

fn procq_remove(proc: &Arc<Process>) {
    let _ = PROCQ.lock().remove(proc);
}

pub fn find_by_pid(pid: Pid) -> KResult<Arc<Process>> {
    let q = PROCQ.lock();
    q.iter().find(|p| p.pid() == pid).cloned().ok_or(Error::Srch)
}

pub fn all_processes() -> Vec<Arc<Process>> {
    PROCQ.lock().iter().cloned().collect()
}

/// Turn `thread` into the main thread of a fresh group, allocating the
/// process record and the shared resources. `mmap` is the new group's
/// address space, absent for kernel-only groups.
pub fn create_group(thread: &Arc<Thread>, mmap: Option<Arc<AddressSpace>>) -> KResult<Arc<Process>> {
    let pid = alloc_pid()?;
    let name = thread.lock().name.clone();

    let proc = Arc::new(Process {
        pid,
        name,
        inner: SpinLock::new(ProcInner {
            pgid: pid,
            sid: pid,
            parent: None,
            exit_code: None,
            zombie: false,
            entry: 0,
            main: Arc::downgrade(thread),
        }),
        children: Queue::new(),
        child_event: Cond::new(),
        threads: Arc::new(Queue::new()),
        signals: SignalDesc::alloc(),
        timers: Arc::new(Queue::new()),
        mmap: mmap.clone(),
        cred: SpinLock::new(Cred::default()),
    });

    proc.threads.lock().enqueue(thread.clone(), true)?;
    {
        let mut inner = thread.lock();
        inner.proc = Some(proc.clone());
        inner.group = Some(proc.threads.clone());
        inner.signals = Some(proc.signals.clone());
        inner.timers = Some(proc.timers.clone());
        inner.main = Arc::downgrade(thread);
        if inner.mmap.is_none() {
            inner.mmap = mmap;
        }
    }
    thread.set_flags(ThreadFlags::IS_MAIN);

    procq_insert(&proc)?;
    Ok(proc)
}

/// Add `thread` to `peer`'s group, inheriting the shared resources.
pub fn join_group(peer: &Arc<Thread>, thread: &Arc<Thread>) -> KResult<()> {
    let (proc, group, signals, timers, mmap, main) = {
        let inner = peer.lock();
        (
            inner.proc.clone(),
            inner.group.clone().ok_or(Error::Inval)?,
            inner.signals.clone(),
            inner.timers.clone(),
            inner.mmap.clone(),
            inner.main.clone(),
        )
    };

    group.lock().enqueue(thread.clone(), true)?;
    let mut inner = thread.lock();
    inner.proc = proc;
    inner.group = Some(group);
    inner.signals = signals;
    inner.timers = timers;
    if inner.mmap.is_none() {
        inner.mmap = mmap;
    }
    inner.main = main;
    Ok(())
}

/// A member thread reached ZOMBIE. When it was the last live member the
/// process itself becomes a zombie, the main thread's status becomes the
/// process status, and anyone waiting on the parent is told.
pub fn notify_thread_zombie(thread: &Arc<Thread>) {
    let (proc, group) = {
        let inner = thread.lock();
        (inner.proc.clone(), inner.group.clone())
    };
    let (Some(proc), Some(group)) = (proc, group) else { return };

    let all_dead = {
        let q = group.lock();
        q.iter().all(|t| {
            matches!(t.lock().state, ThreadState::Zombie | ThreadState::Terminated)
        })
    };
    if !all_dead {
        return;
    }

    let parent = {
        let mut inner = proc.lock();
        if inner.zombie {
            return;
        }
        inner.zombie = true;
        let status = inner
            .main
            .upgrade()
            .map(|main| main.lock().exit_code as i32)
            .unwrap_or(thread.lock().exit_code as i32);
        inner.exit_code = Some(status);
        inner.parent.clone()
    };

    log::debug!("process {} ({}) exited", proc.pid(), proc.name());
    proc.child_event.broadcast();
    if let Some(parent) = parent.and_then(|w| w.upgrade()) {
        parent.child_event.broadcast();
        let _ = crate::signal::kill(parent.pid(), crate::signal::SIGCHLD);
    }
}

/// Establish a parent/child link.
pub fn add_child(parent: &Arc<Process>, child: &Arc<Process>) -> KResult<()> {
    parent.children.lock().enqueue(child.clone(), true)?;
    child.lock().parent = Some(Arc::downgrade(parent));
    Ok(())
}

/// Reap one zombie child of `proc`, blocking on the child-status
/// condition until one is available. Returns (pid, status).
pub fn wait_child(proc: &Arc<Process>) -> KResult<(Pid, i32)> {
    loop {
        {
            let children = proc.children.lock();
            if children.is_empty() {
                return Err(Error::Child);
            }
            if let Some(zombie) = children.iter().find(|c| c.is_zombie()).cloned() {
                drop(children);
                let status = zombie.exit_code().unwrap_or(0);
                let pid = zombie.pid();
                let _ = proc.children.lock().remove(&zombie);
                procq_remove(&zombie);
                return Ok((pid, status));
            }
        }
        // Nothing yet; sleep until a child announces a status change.
        let guard = proc.inner.lock();
        let (guard, woke) = proc.child_event.wait(guard);
        drop(guard);
        woke?;
    }
}

/// Loader hook: builds the program image in the given address space and
/// returns the entry point. Stands in for the binary loader, which is
/// outside this core.
pub type InitImage = fn(&Arc<AddressSpace>) -> KResult<u64>;

static INIT_IMAGE: SpinLock<Option<InitImage>> = SpinLock::new(None);

pub fn register_init_image(loader: InitImage) {
    *INIT_IMAGE.lock() = Some(loader);
}

/// Build and schedule the initial user process.
///
/// Allocates the address space and main thread, loads the program image
/// through the registered loader, copies argv/envp into the new address
/// space, points the main thread at the entry, and queues it.
pub fn proc_init(path: &str) -> KResult<Arc<Process>> {
    let loader = (*INIT_IMAGE.lock()).ok_or(Error::NoEnt)?;

    let mmap = AddressSpace::alloc()?;
    let thread = create::thread_alloc(KSTACK_SIZE, CreateFlags::USER, path)?;
    {
        let mut inner = thread.lock();
        inner.mmap = Some(mmap.clone());
    }
    let proc = create_group(&thread, Some(mmap.clone()))?;

    let entry = loader(&mmap)?;
    proc.lock().entry = entry;

    let argv = [path];
    let envp: [&str; 0] = [];
    let (argv_ptr, argc, _envp_ptr) = mmap.argenvcpy(&argv, &envp)?;

    // User stack for the main thread.
    let (stack_base, stack_len) = mmap.alloc_stack(USTACK_SIZE as u64)?;
    let stack_top = stack_base + stack_len;
    {
        let mut inner = thread.lock();
        inner.entry = entry as usize;
        inner.name = String::from(path);
    }
    unsafe {
        let arch = thread.arch_mut();
        arch.ustack = Some(crate::arch::x86_64::context::UserStack {
            top: stack_top,
            size: stack_len,
        });
        // rdi = argc, staged through the user trampoline.
        crate::arch::x86_64::context::uthread_init(arch, entry, stack_top, argc as u64);
        let _ = argv_ptr;
    }

    crate::scheduler::schedule_thread(&thread)?;
    log::info!("init process {} ({}) scheduled, entry {:#x}", proc.pid(), path, entry);
    Ok(proc)
}

/// Duplicate the calling thread's process: cloned address space
/// (copy-on-write via the architecture hook), fresh main thread entering
/// at the parent's recorded entry point, inherited signal actions.
/// Returns the child process; the caller is the parent.
pub fn fork() -> KResult<Arc<Process>> {
    let current = crate::percpu::current().ok_or(Error::Srch)?;
    let (parent_proc, parent_mmap) = {
        let inner = current.lock();
        (inner.proc.clone().ok_or(Error::Srch)?, inner.mmap.clone().ok_or(Error::Inval)?)
    };

    let child_mmap = parent_mmap.clone_space()?;
    let name = parent_proc.name();
    let thread = create::thread_alloc(KSTACK_SIZE, CreateFlags::USER, name)?;
    {
        let mut inner = thread.lock();
        inner.mmap = Some(child_mmap.clone());
    }
    let child = create_group(&thread, Some(child_mmap))?;

    // The child resumes at the recorded program entry with the parent's
    // user stack image (shared copy-on-write).
    let entry = parent_proc.lock().entry;
    child.lock().entry = entry;
    let ustack = unsafe { current.arch_mut().ustack };
    if let Some(ustack) = ustack {
        unsafe {
            let arch = thread.arch_mut();
            arch.ustack = Some(ustack);
            crate::arch::x86_64::context::uthread_init(arch, entry, ustack.top, 0);
        }
    }

    child.signals.copy_actions_from(&parent_proc.signals);
    add_child(&parent_proc, &child)?;
    crate::scheduler::schedule_thread(&thread)?;
    Ok(child)
}

/// Kill every peer in the calling thread's group, then exit the calling
/// thread itself: the process-level `exit(2)`.
pub fn exit_group(status: usize) -> ! {
    let _ = crate::scheduler::lifecycle::thread_kill_all();
    crate::scheduler::lifecycle::thread_exit(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::region::{PAGE_SIZE, Prot, MapFlags};
    use crate::scheduler::create::thread_create;
    use crate::scheduler::mlfq;
    use crate::test_support::SCHED_SERIAL;

    fn noop(_: usize) {}

    #[test]
    fn group_members_share_resources() {
        let main = thread_create(None, noop, 0, CreateFlags::GROUP).unwrap();
        let peer = crate::scheduler::create::thread_alloc(KSTACK_SIZE, CreateFlags::empty(), "peer")
            .unwrap();
        join_group(&main, &peer).unwrap();

        let (main_inner, peer_inner) = (main.lock(), peer.lock());
        assert!(Arc::ptr_eq(
            main_inner.signals.as_ref().unwrap(),
            peer_inner.signals.as_ref().unwrap()
        ));
        assert!(Arc::ptr_eq(
            main_inner.group.as_ref().unwrap(),
            peer_inner.group.as_ref().unwrap()
        ));
        assert!(Arc::ptr_eq(
            main_inner.proc.as_ref().unwrap(),
            peer_inner.proc.as_ref().unwrap()
        ));
        drop((main_inner, peer_inner));

        let proc = main.lock().proc.clone().unwrap();
        assert_eq!(proc.threads().len(), 2);
        assert!(main.has_flags(ThreadFlags::IS_MAIN));
        assert!(!peer.has_flags(ThreadFlags::IS_MAIN));
    }

    #[test]
    fn last_zombie_member_marks_process_zombie() {
        let main = thread_create(None, noop, 0, CreateFlags::GROUP).unwrap();
        let proc = main.lock().proc.clone().unwrap();
        assert!(!proc.is_zombie());

        {
            let mut inner = main.lock();
            inner.state = ThreadState::Zombie;
            inner.exit_code = 42;
        }
        notify_thread_zombie(&main);

        assert!(proc.is_zombie());
        assert_eq!(proc.exit_code(), Some(42));
    }

    #[test]
    fn wait_child_reaps_zombie_child() {
        let parent_main = thread_create(None, noop, 0, CreateFlags::GROUP).unwrap();
        let parent = parent_main.lock().proc.clone().unwrap();

        let child_main = thread_create(None, noop, 0, CreateFlags::GROUP).unwrap();
        let child = child_main.lock().proc.clone().unwrap();
        let child_pid = child.pid();
        add_child(&parent, &child).unwrap();

        {
            let mut inner = child_main.lock();
            inner.state = ThreadState::Zombie;
            inner.exit_code = 7;
        }
        notify_thread_zombie(&child_main);

        let (pid, status) = wait_child(&parent).unwrap();
        assert_eq!(pid, child_pid);
        assert_eq!(status, 7);
        assert!(parent.children.lock().is_empty());
        assert!(find_by_pid(child_pid).is_err());
    }

    #[test]
    fn wait_child_without_children_fails() {
        let main = thread_create(None, noop, 0, CreateFlags::GROUP).unwrap();
        let proc = main.lock().proc.clone().unwrap();
        assert_eq!(wait_child(&proc), Err(Error::Child));
    }

    #[test]
    fn proc_init_builds_and_schedules_init() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        crate::percpu::set_online(1);

        fn image(mmap: &Arc<AddressSpace>) -> crate::KResult<u64> {
            let entry = 0x0040_0000u64;
            mmap.map_region(
                entry,
                2 * PAGE_SIZE,
                Prot::READ | Prot::EXEC,
                MapFlags::FIXED | MapFlags::PRIVATE,
            )?;
            Ok(entry)
        }
        register_init_image(image);

        let proc = proc_init("/sbin/init").unwrap();
        assert_eq!(proc.name(), "/sbin/init");
        assert_eq!(proc.lock().entry, 0x0040_0000);

        let mmap = proc.mmap.as_ref().unwrap();
        let code = mmap.find(0x0040_0000).expect("code region mapped");
        assert!(code.executable() && !code.writable());
        assert!(mmap.lock().arg.is_some());

        let main = proc.lock().main.upgrade().expect("main thread");
        assert!(main.has_flags(ThreadFlags::IS_MAIN));
        assert!(main.has_flags(ThreadFlags::USER));
        assert_eq!(main.lock().state, ThreadState::Ready);

        // The main thread went onto the run queue; take it back off so
        // the scheduler-global tests see a clean slate.
        let picked = mlfq::pick_next(0).expect("init main queued");
        assert_eq!(picked.tid(), main.tid());
    }

    #[test]
    fn fork_clones_address_space_shape() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        crate::percpu::set_online(1);

        fn image(mmap: &Arc<AddressSpace>) -> crate::KResult<u64> {
            let entry = 0x0040_0000u64;
            mmap.map_region(
                entry,
                PAGE_SIZE,
                Prot::READ | Prot::EXEC,
                MapFlags::FIXED | MapFlags::PRIVATE,
            )?;
            Ok(entry)
        }
        register_init_image(image);
        let parent = proc_init("/sbin/init").unwrap();
        let parent_main = parent.lock().main.upgrade().unwrap();

        // Run fork as the parent's main thread.
        let old = crate::percpu::set_current(Some(parent_main.clone()));
        let child = fork();
        let _ = crate::percpu::set_current(old);
        let child = child.unwrap();

        assert_ne!(child.pid(), parent.pid());
        let (pm, cm) = (parent.mmap.as_ref().unwrap(), child.mmap.as_ref().unwrap());
        assert_eq!(pm.region_count(), cm.region_count());
        assert_ne!(pm.pgdir(), cm.pgdir());
        assert!(parent.children.lock().contains(&child));

        // Drain the run queue entries both inits left behind.
        while mlfq::pick_next(0).is_some() {}
    }
}
