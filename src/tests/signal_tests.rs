//! Signal suite: blocked-signal sigwait round-trip and queued-payload
//! ordering against a live sibling thread.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::scheduler::create::{CreateFlags, thread_create};
use crate::scheduler::lifecycle;
use crate::signal::{self, SIGUSR1, SigHow, SigSet, SigVal};
use crate::tests::TestTally;

static RECEIVED_VALUE: AtomicUsize = AtomicUsize::new(usize::MAX);
static FIFO_ERRORS: AtomicUsize = AtomicUsize::new(0);

const FIFO_COUNT: i64 = 100;

/// Block SIGUSR1, wait for it with sigwaitinfo, record the payload.
fn sigwait_receiver_entry(_arg: usize) {
    let set = SigSet::of(SIGUSR1);
    let _ = signal::pthread_sigmask(SigHow::Block, Some(set));
    match signal::sigwaitinfo(set) {
        Ok(info) => {
            if let SigVal::Int(v) = info.value {
                RECEIVED_VALUE.store(v as usize, Ordering::Relaxed);
            }
        }
        Err(err) => log::error!("sigwaitinfo: {}", err),
    }
}

/// Drain queued SIGUSR1 payloads and verify arrival order.
fn fifo_receiver_entry(_arg: usize) {
    let set = SigSet::of(SIGUSR1);
    let _ = signal::pthread_sigmask(SigHow::Block, Some(set));
    for expect in 0..FIFO_COUNT {
        match signal::sigwaitinfo(set) {
            Ok(info) => {
                if info.value != SigVal::Int(expect) {
                    FIFO_ERRORS.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(_) => {
                FIFO_ERRORS.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn blocked_sigwait_round_trip(tally: &TestTally) {
    RECEIVED_VALUE.store(usize::MAX, Ordering::Relaxed);
    let Ok(receiver) = thread_create(None, sigwait_receiver_entry, 0, CreateFlags::SCHED) else {
        tally.check("sigwait: spawn", false);
        return;
    };

    // Give the receiver a chance to block, then queue the payload.
    let _ = lifecycle::sleep_jiffies(5);
    let sent = signal::pthread_sigqueue(receiver.tid(), SIGUSR1, SigVal::Int(7));
    tally.check("sigwait: payload sent", sent.is_ok());

    let _ = lifecycle::thread_join(receiver.tid());
    tally.check(
        "sigwait: blocked signal received with payload, no handler run",
        RECEIVED_VALUE.load(Ordering::Relaxed) == 7,
    );
}

fn fifo_ordering(tally: &TestTally) {
    FIFO_ERRORS.store(0, Ordering::Relaxed);
    let Ok(receiver) = thread_create(None, fifo_receiver_entry, 0, CreateFlags::SCHED) else {
        tally.check("fifo: spawn", false);
        return;
    };
    let _ = lifecycle::sleep_jiffies(5);
    for i in 0..FIFO_COUNT {
        if signal::pthread_sigqueue(receiver.tid(), SIGUSR1, SigVal::Int(i)).is_err() {
            tally.check("fifo: send", false);
            return;
        }
    }
    let _ = lifecycle::thread_join(receiver.tid());
    tally.check("fifo: 100 payloads in order", FIFO_ERRORS.load(Ordering::Relaxed) == 0);
}

pub fn run() -> bool {
    let tally = TestTally::new();
    log::info!("-- signal suite --");
    blocked_sigwait_round_trip(&tally);
    fifo_ordering(&tally);
    tally.report("signal suite")
}
