//! Builtin kernel threads.
//!
//! Kernel-internal threads are declared in one static registry and
//! spawned together at boot: the timer worker, the load balancer, the
//! ager, the reaper and the console shell. Every builtin runs
//! KILL-exempt so stray terminations cannot take the machinery down.

use crate::KResult;
use crate::scheduler::balancer;
use crate::scheduler::create::kthread_spawn;
use crate::scheduler::thread::{ThreadEntry, ThreadFlags};
use crate::shell;
use crate::time::posix;

pub struct BuiltinThread {
    pub name: &'static str,
    pub entry: ThreadEntry,
    pub arg: usize,
}

/// The registry. Order is spawn order.
pub static BUILTIN_THREADS: &[BuiltinThread] = &[
    BuiltinThread { name: "timer-worker", entry: posix::timer_worker_entry, arg: 0 },
    BuiltinThread { name: "load-balancer", entry: balancer::load_balancer_entry, arg: 0 },
    BuiltinThread { name: "ager", entry: balancer::aging_entry, arg: 0 },
    BuiltinThread { name: "reaper", entry: balancer::reaper_entry, arg: 0 },
    BuiltinThread { name: "kshell", entry: shell::shell_entry, arg: 0 },
];

/// Spawn every registered builtin; returns how many were started.
pub fn spawn_all() -> KResult<usize> {
    let mut spawned = 0;
    for builtin in BUILTIN_THREADS {
        let thread = kthread_spawn(builtin.name, builtin.entry, builtin.arg)?;
        thread.set_flags(ThreadFlags::KILL_EXEMPT | ThreadFlags::SCHEDULER);
        log::info!("builtin thread \"{}\" tid {}", builtin.name, thread.tid());
        spawned += 1;
    }
    Ok(spawned)
}
