//! Per-CPU multi-level feedback queues.
//!
//! Four levels per CPU, indexed 0 (low) to 3 (high). The high level has
//! the smallest quantum. Placement honors affinity, selection walks from
//! high to low, aging and the periodic boost push waiting threads back
//! up, and the balancer migrates runs of threads between CPUs with both
//! level locks held.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;

use crate::KResult;
use crate::ds::queue::{Queue, QueueList, Whence};
use crate::percpu::{self, MAX_CPUS};
use crate::scheduler::config;
use crate::scheduler::thread::{
    AffinityKind, Thread, ThreadFlags, ThreadQueue, ThreadState,
};
use crate::time;

pub const NSCHED_LEVELS: usize = 4;
pub const MLFQ_LOW: usize = 0;
pub const MLFQ_HIGH: usize = NSCHED_LEVELS - 1;

pub const LEVEL_NAMES: [&str; NSCHED_LEVELS] = ["LOWEST", "MID-L1", "MID-L2", "HIGHEST"];

/// One priority level: its run queue and the quantum granted on dispatch.
pub struct SchedLevel {
    pub quantum: AtomicU64,
    pub run_queue: ThreadQueue,
}

pub struct Mlfq {
    pub levels: [SchedLevel; NSCHED_LEVELS],
}

impl Mlfq {
    fn new() -> Self {
        // 30 ms at the lowest level, shrinking by 5 ms per level up.
        let levels = core::array::from_fn(|i| SchedLevel {
            quantum: AtomicU64::new(time::jiffies_from_ms(30 - 5 * i as u64)),
            run_queue: Queue::new(),
        });
        Mlfq { levels }
    }
}

lazy_static! {
    static ref MLFQ: Vec<Mlfq> = (0..MAX_CPUS).map(|_| Mlfq::new()).collect();
}

pub fn mlfq(cpu: usize) -> &'static Mlfq {
    &MLFQ[cpu]
}

/// Number of runnable threads queued on `cpu`.
pub fn load(cpu: usize) -> usize {
    mlfq(cpu).levels.iter().map(|l| l.run_queue.count()).sum()
}

fn total_load() -> usize {
    (0..percpu::online()).map(load).sum()
}

/// Pick the CPU a waking thread should be queued on.
///
/// Soft affinity keeps the thread where it is; hard affinity picks the
/// least-loaded CPU in the mask, preferring others over `current` unless
/// it is the only candidate.
fn target_cpu(current: usize, kind: AffinityKind, mask: u64) -> usize {
    match kind {
        AffinityKind::Soft => current,
        AffinityKind::Hard => {
            let mut best: Option<(usize, usize)> = None;
            for cpu in 0..percpu::online() {
                if cpu == current || mask & (1 << cpu) == 0 {
                    continue;
                }
                let l = load(cpu);
                if best.map(|(_, bl)| l < bl).unwrap_or(true) {
                    best = Some((cpu, l));
                }
            }
            match best {
                Some((cpu, _)) => cpu,
                None if mask & (1 << current) != 0 => current,
                None => current,
            }
        }
    }
}

/// Queue a READY thread at its current priority level, on the CPU its
/// affinity selects. The thread's timeslice is recharged to the level's
/// quantum.
pub fn enqueue_on(cpu: usize, thread: &Arc<Thread>) -> KResult<()> {
    let (prio, kind, mask) = {
        let inner = thread.lock();
        (inner.sched.prio.min(MLFQ_HIGH), inner.sched.affinity.kind, inner.sched.affinity.cpu_mask)
    };

    let target = if thread.has_flags(ThreadFlags::NO_MIGRATE) { cpu } else { target_cpu(cpu, kind, mask) };

    let level = &mlfq(target).levels[prio];
    level.run_queue.lock().enqueue(thread.clone(), true)?;

    let quantum = level.quantum.load(Ordering::Relaxed);
    thread.set_timeslice(quantum);
    {
        let mut inner = thread.lock();
        inner.sched.cpu = target;
        inner.sched.last_timeslice = quantum;
    }
    Ok(())
}

/// Dequeue the highest-priority runnable thread on `cpu`, marking it
/// RUNNING and charging it the level's quantum. Threads whose lock is
/// contended are skipped for this pass.
pub fn pick_next(cpu: usize) -> Option<Arc<Thread>> {
    for prio in (MLFQ_LOW..=MLFQ_HIGH).rev() {
        let level = &mlfq(cpu).levels[prio];
        let quantum = level.quantum.load(Ordering::Relaxed);
        let mut q = level.run_queue.lock();
        let picked = q.remove_first_match(|t| {
            let Some(mut inner) = t.try_lock() else { return false };
            inner.state = ThreadState::Running;
            inner.sched.cpu = cpu;
            inner.sched.age = 0;
            inner.sched.last_timeslice = quantum;
            t.set_timeslice(quantum);
            true
        });
        if let Some(thread) = picked {
            return Some(thread);
        }
    }
    None
}

/// Promote every thread waiting below HIGH by one level. Runs every
/// boost interval so misconfigured aging can never starve a level
/// permanently.
pub fn priority_boost(cpu: usize) {
    for prio in MLFQ_LOW..MLFQ_HIGH {
        let src = &mlfq(cpu).levels[prio];
        let dst = &mlfq(cpu).levels[prio + 1];
        let dst_quantum = dst.quantum.load(Ordering::Relaxed);

        let mut src_q = src.run_queue.lock();
        if src_q.is_empty() {
            continue;
        }
        for t in src_q.iter() {
            let mut inner = t.lock();
            inner.sched.prio = prio + 1;
            inner.sched.last_timeslice = dst_quantum;
            t.set_timeslice(dst_quantum);
        }
        let mut dst_q = dst.run_queue.lock();
        let _ = QueueList::drain_to(&mut dst_q, &mut src_q, Whence::Tail);
    }
}

/// One system-wide aging pass: bump the age of every queued thread below
/// HIGH, promoting those whose age passed the threshold. Contended level
/// locks are skipped until the next pass.
pub fn age_scan() {
    let threshold = config::aging_threshold();
    for cpu in 0..percpu::online() {
        for prio in MLFQ_LOW..MLFQ_HIGH {
            let src = &mlfq(cpu).levels[prio];
            let Some(mut src_q) = src.run_queue.try_lock() else { continue };

            let mut promote: Vec<Arc<Thread>> = Vec::new();
            for t in src_q.iter() {
                let mut inner = t.lock();
                inner.sched.age += 1;
                if inner.sched.age > threshold {
                    promote.push(t.clone());
                }
            }

            if promote.is_empty() {
                continue;
            }
            let dst = &mlfq(cpu).levels[prio + 1];
            let Some(mut dst_q) = dst.run_queue.try_lock() else { continue };
            let dst_quantum = dst.quantum.load(Ordering::Relaxed);

            for t in promote {
                if src_q.remove(&t).is_err() {
                    continue;
                }
                if dst_q.enqueue(t.clone(), true).is_ok() {
                    let mut inner = t.lock();
                    inner.sched.prio = prio + 1;
                    inner.sched.age = 0;
                    inner.sched.last_timeslice = dst_quantum;
                    t.set_timeslice(dst_quantum);
                }
            }
        }
    }
}

/// Re-fit level quanta to the current queue population, within the
/// configured clamp.
pub fn adjust_quantum(cpu: usize) {
    let total = load(cpu);
    let min = time::jiffies_from_ms(config::QUANTUM_MIN_MS);
    let max = time::jiffies_from_ms(config::QUANTUM_MAX_MS);
    let step = time::jiffies_from_ms(5);

    for level in mlfq(cpu).levels.iter() {
        let qsize = level.run_queue.count();
        let quantum = level.quantum.load(Ordering::Relaxed);
        let next = if qsize > total / 2 {
            (quantum + step).min(max)
        } else if total > 0 && qsize < total / 4 {
            quantum.saturating_sub(step).max(min)
        } else {
            quantum
        };
        level.quantum.store(next, Ordering::Relaxed);
    }
}

/// After a block migration, fix each moved thread's CPU field and send
/// back any thread the destination may not legally hold.
fn settle_migrated(src: &ThreadQueue, dst: &ThreadQueue, dst_cpu: usize) {
    let mut bounced: Vec<Arc<Thread>> = Vec::new();
    {
        let dst_q = dst.lock();
        for t in dst_q.iter() {
            let mut inner = t.lock();
            let pinned = t.has_flags(ThreadFlags::NO_MIGRATE)
                || (inner.sched.affinity.kind == AffinityKind::Hard
                    && inner.sched.affinity.cpu_mask & (1 << dst_cpu) == 0);
            if pinned {
                bounced.push(t.clone());
            } else {
                inner.sched.cpu = dst_cpu;
            }
        }
    }
    for t in bounced {
        let moved = dst.lock().remove(&t);
        if moved.is_ok() {
            let _ = src.lock().enqueue_head(t, true);
        }
    }
}

/// Push half of each level to the least-loaded CPU when this CPU's load
/// exceeds the average by more than two. Lock failures skip the pair.
pub fn push_from(cpu: usize) {
    let online = percpu::online();
    if online < 2 {
        return;
    }
    let my_load = load(cpu);
    let avg = total_load() / online;
    if my_load <= avg + 2 {
        return;
    }

    let target = match (0..online).filter(|&c| c != cpu).min_by_key(|&c| load(c)) {
        Some(t) => t,
        None => return,
    };
    if load(target) >= my_load {
        return;
    }

    let mut pushed = 0;
    for prio in (MLFQ_LOW..=MLFQ_HIGH).rev() {
        if pushed >= my_load / 2 {
            break;
        }
        let src = &mlfq(cpu).levels[prio].run_queue;
        let dst = &mlfq(target).levels[prio].run_queue;

        let Some(mut src_q) = src.try_lock() else { continue };
        let Some(mut dst_q) = dst.try_lock() else { continue };

        let count = src_q.len() / 2;
        if count == 0 {
            continue;
        }
        if QueueList::migrate(&mut dst_q, &mut src_q, 0, count, Whence::Head).is_ok() {
            pushed += count;
        }
        drop(dst_q);
        drop(src_q);
        settle_migrated(src, dst, target);
    }
}

/// Steal work from the most-loaded CPU when this CPU's load is more than
/// two below the average. Lower levels are stolen first so the victim
/// keeps its highest-priority work; total stolen stays within half the
/// victim's load.
pub fn pull_to(cpu: usize) {
    let online = percpu::online();
    if online < 2 {
        return;
    }
    let my_load = load(cpu);
    let avg = total_load() / online;
    if my_load + 2 >= avg {
        return;
    }

    let (victim, victim_load) = match (0..online)
        .filter(|&c| c != cpu)
        .map(|c| (c, load(c)))
        .max_by_key(|&(_, l)| l)
    {
        Some(v) => v,
        None => return,
    };
    if victim_load < 2 {
        return;
    }

    let mut pulled = 0;
    for prio in MLFQ_LOW..=MLFQ_HIGH {
        if pulled >= victim_load / 2 {
            break;
        }
        let src = &mlfq(victim).levels[prio].run_queue;
        let dst = &mlfq(cpu).levels[prio].run_queue;

        let Some(mut dst_q) = dst.try_lock() else { continue };
        let Some(mut src_q) = src.try_lock() else { continue };

        let avail = src_q.len();
        if avail == 0 {
            continue;
        }
        let count = (avail / 2).max(1).min(victim_load / 2 - pulled);
        if count == 0 {
            break;
        }
        let start = avail - count;
        if QueueList::migrate(&mut dst_q, &mut src_q, start, count, Whence::Tail).is_ok() {
            pulled += count;
        }
        drop(src_q);
        drop(dst_q);
        settle_migrated(src, dst, cpu);
    }
}

/// One balance pass for `cpu`: shed load or steal it, depending on which
/// side of the average this CPU sits.
pub fn balance(cpu: usize) {
    let online = percpu::online();
    if online < 2 {
        return;
    }
    let my_load = load(cpu);
    let avg = total_load() / online;
    if my_load > avg + 2 {
        push_from(cpu);
    } else if my_load + 2 < avg {
        pull_to(cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::create::{CreateFlags, thread_create};
    use crate::scheduler::thread::ThreadState;
    use crate::test_support::SCHED_SERIAL;

    fn idle_entry(_arg: usize) {}

    fn spawn_on(cpu: usize) -> Arc<Thread> {
        let t = thread_create(None, idle_entry, 0, CreateFlags::GROUP).unwrap();
        {
            let mut inner = t.lock();
            inner.state = ThreadState::Ready;
            inner.sched.prio = MLFQ_HIGH;
        }
        enqueue_on(cpu, &t).unwrap();
        t
    }

    fn drain_all() {
        for cpu in 0..percpu::online() {
            for level in mlfq(cpu).levels.iter() {
                level.run_queue.lock().clear();
            }
        }
    }

    #[test]
    fn new_threads_enter_high_and_decay_to_low() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        percpu::set_online(1);
        drain_all();

        let t = spawn_on(0);
        // Four consecutive quantum exhaustions walk HIGH down to LOW.
        for step in 0..4 {
            let picked = pick_next(0).expect("runnable thread");
            assert_eq!(picked.tid(), t.tid());
            let expect_prio = MLFQ_HIGH - step;
            assert_eq!(picked.lock().sched.prio, expect_prio);
            let level_quantum =
                mlfq(0).levels[expect_prio].quantum.load(Ordering::Relaxed);
            assert_eq!(picked.timeslice(), level_quantum);

            // Burn the whole quantum, then let the yield path demote.
            picked.set_timeslice(0);
            {
                let mut inner = picked.lock();
                if inner.sched.prio > MLFQ_LOW {
                    inner.sched.prio -= 1;
                }
                inner.state = ThreadState::Ready;
            }
            enqueue_on(0, &picked).unwrap();
        }

        let picked = pick_next(0).unwrap();
        assert_eq!(picked.lock().sched.prio, MLFQ_LOW);
        assert_eq!(
            picked.timeslice(),
            mlfq(0).levels[MLFQ_LOW].quantum.load(Ordering::Relaxed)
        );
        drain_all();
    }

    #[test]
    fn balance_converges_from_one_hot_cpu() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        percpu::set_online(4);
        drain_all();

        let mut threads = Vec::new();
        for _ in 0..32 {
            threads.push(spawn_on(0));
        }
        assert_eq!(load(0), 32);

        // The spread must settle within 100 passes.
        for _ in 0..100 {
            for cpu in 0..4 {
                balance(cpu);
            }
            let loads: Vec<usize> = (0..4).map(load).collect();
            let max = *loads.iter().max().unwrap();
            let min = *loads.iter().min().unwrap();
            if max - min <= 2 {
                break;
            }
        }

        let loads: Vec<usize> = (0..4).map(load).collect();
        let total: usize = loads.iter().sum();
        assert_eq!(total, 32, "threads lost or duplicated: {:?}", loads);
        let max = *loads.iter().max().unwrap();
        let min = *loads.iter().min().unwrap();
        assert!(max - min <= 2, "unbalanced after 100 passes: {:?}", loads);

        // Membership stayed exclusive.
        for cpu in 0..4 {
            for level in mlfq(cpu).levels.iter() {
                level.run_queue.lock().assert_consistent();
            }
        }
        drain_all();
        percpu::set_online(1);
    }

    #[test]
    fn boost_lifts_threads_one_level() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        percpu::set_online(1);
        drain_all();

        let t = spawn_on(0);
        {
            // Park the thread at the lowest level.
            let picked = pick_next(0).unwrap();
            let mut inner = picked.lock();
            inner.sched.prio = MLFQ_LOW;
            inner.state = ThreadState::Ready;
        }
        enqueue_on(0, &t).unwrap();
        assert_eq!(mlfq(0).levels[MLFQ_LOW].run_queue.count(), 1);

        priority_boost(0);
        assert_eq!(mlfq(0).levels[MLFQ_LOW].run_queue.count(), 0);
        assert_eq!(mlfq(0).levels[MLFQ_LOW + 1].run_queue.count(), 1);
        assert_eq!(t.lock().sched.prio, MLFQ_LOW + 1);

        // Boosting repeatedly clamps at HIGH.
        priority_boost(0);
        priority_boost(0);
        priority_boost(0);
        assert_eq!(t.lock().sched.prio, MLFQ_HIGH);
        assert_eq!(mlfq(0).levels[MLFQ_HIGH].run_queue.count(), 1);
        drain_all();
    }

    #[test]
    fn aging_promotes_past_threshold() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        percpu::set_online(1);
        drain_all();
        let old = config::aging_threshold();
        config::set_aging_threshold(3);

        let t = spawn_on(0);
        {
            let picked = pick_next(0).unwrap();
            let mut inner = picked.lock();
            inner.sched.prio = 1;
            inner.state = ThreadState::Ready;
        }
        enqueue_on(0, &t).unwrap();

        for _ in 0..4 {
            age_scan();
        }
        assert_eq!(t.lock().sched.prio, 2);
        assert_eq!(t.lock().sched.age, 0);
        assert_eq!(mlfq(0).levels[2].run_queue.count(), 1);

        config::set_aging_threshold(old);
        drain_all();
    }

    #[test]
    fn fairness_under_boost() {
        let _serial = SCHED_SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        // Equal-priority busy threads must accumulate CPU time within
        // 20% of the mean over repeated full quanta with boosts folded
        // in.
        percpu::set_online(1);
        drain_all();

        let threads: Vec<_> = (0..4).map(|_| spawn_on(0)).collect();

        for round in 0..1000 {
            let picked = pick_next(0).expect("runnable");
            let slice = picked.timeslice();
            {
                let mut inner = picked.lock();
                inner.sched.cpu_time += slice;
                if inner.sched.prio > MLFQ_LOW {
                    inner.sched.prio -= 1;
                }
                inner.state = ThreadState::Ready;
            }
            picked.set_timeslice(0);
            enqueue_on(0, &picked).unwrap();
            if round % 10 == 9 {
                priority_boost(0);
            }
        }

        let times: Vec<u64> = threads.iter().map(|t| t.lock().sched.cpu_time).collect();
        let mean = times.iter().sum::<u64>() / times.len() as u64;
        for &t in &times {
            let dev = t.abs_diff(mean);
            assert!(dev * 5 <= mean, "cpu time {} deviates from mean {}: {:?}", t, mean, times);
        }
        drain_all();
    }
}
