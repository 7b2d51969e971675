//! Memory suite: region invariants exercised on a scratch address
//! space. Everything here is synchronous, so it doubles as a smoke test
//! on the hosted build.

use crate::memory::mmap::AddressSpace;
use crate::memory::region::{MapFlags, PAGE_SIZE, Prot};
use crate::tests::TestTally;

const BASE: u64 = 0x4000_0000;

fn stack_guard(tally: &TestTally) {
    let Ok(mm) = AddressSpace::alloc() else {
        tally.check("vm: address space alloc", false);
        return;
    };

    let Ok((base, len)) = mm.alloc_stack(16 * 1024) else {
        tally.check("vm: stack alloc", false);
        return;
    };
    tally.check("vm: stack covers the requested range", len == 16 * 1024);

    let stack = mm.find(base);
    let guard = mm.find(base - 1);
    tally.check(
        "vm: stack region mapped rw",
        stack.as_ref().map(|r| r.readable() && r.writable()).unwrap_or(false),
    );
    tally.check(
        "vm: separate unreadable guard page below",
        guard.map(|g| g.is_guard() && !g.readable() && g.size() == PAGE_SIZE).unwrap_or(false),
    );
}

fn protect_split(tally: &TestTally) {
    let Ok(mm) = AddressSpace::alloc() else {
        tally.check("vm: address space alloc", false);
        return;
    };
    if mm
        .map_region(BASE, 8 * PAGE_SIZE, Prot::READ | Prot::WRITE, MapFlags::FIXED | MapFlags::PRIVATE)
        .is_err()
    {
        tally.check("vm: map", false);
        return;
    }
    let used = mm.used_space();

    let split = mm.protect(BASE + 2 * PAGE_SIZE, 2 * PAGE_SIZE, Prot::READ);
    tally.check("vm: mprotect split", split.is_ok());
    tally.check("vm: used_space unchanged by split", mm.used_space() == used);

    let mid = mm.find(BASE + 2 * PAGE_SIZE);
    tally.check(
        "vm: middle read-only, edges rw",
        mid.map(|m| m.readable() && !m.writable()).unwrap_or(false)
            && mm.find(BASE).map(|l| l.writable()).unwrap_or(false)
            && mm.find(BASE + 5 * PAGE_SIZE).map(|r| r.writable()).unwrap_or(false),
    );

    // Region list stays strictly increasing and non-overlapping.
    let regions = mm.regions_snapshot();
    let sorted = regions.windows(2).all(|w| w[0].end < w[1].start);
    tally.check("vm: regions non-overlapping", sorted);
}

pub fn run() -> bool {
    let tally = TestTally::new();
    log::info!("-- memory suite --");
    stack_guard(&tally);
    protect_split(&tally);
    tally.report("memory suite")
}
