//! Scheduler housekeeping threads.
//!
//! The load balancer pushes and pulls work between CPUs every balance
//! interval; the ager promotes long-waiting threads; the reaper frees
//! terminated threads. All three run KILL-exempt with every signal but
//! the unblockable pair masked, and yield between passes.

use crate::percpu;
use crate::scheduler::{self, config, lifecycle, mlfq};
use crate::signal::{SIGKILL, SIGSTOP, SigHow, SigSet};
use crate::time;

/// Mask every signal this housekeeping thread may legally block.
fn mask_signals() {
    let mut set = SigSet::full();
    set.del(SIGKILL);
    set.del(SIGSTOP);
    let _ = crate::signal::pthread_sigmask(SigHow::Block, Some(set));
}

/// Load balancer main loop.
pub fn load_balancer_entry(_arg: usize) {
    mask_signals();
    log::info!("load balancer running");
    loop {
        let interval = time::jiffies_from_ms(config::balance_interval_ms()).max(1);
        let _ = lifecycle::sleep_jiffies(interval);
        mlfq::balance(percpu::cpu_id());
    }
}

/// System-wide aging loop; one pass per balance-sized nap.
pub fn aging_entry(_arg: usize) {
    mask_signals();
    log::info!("ager running");
    loop {
        let interval = time::jiffies_from_ms(config::balance_interval_ms()).max(1);
        let _ = lifecycle::sleep_jiffies(interval);
        mlfq::age_scan();
    }
}

/// Reaper: drop the scheduler's references to terminated threads.
pub fn reaper_entry(_arg: usize) {
    mask_signals();
    log::info!("reaper running");
    loop {
        let _ = lifecycle::sleep_jiffies(time::jiffies_from_ms(100));
        scheduler::reap_terminated();
    }
}
