//! Virtual memory regions.
//!
//! A region is one contiguous mapping `[start, end]` (inclusive,
//! page-aligned bounds) with semantic flags, the MMU flags derived from
//! them, and optional file backing.

use bitflags::bitflags;

pub const PAGE_SIZE: u64 = 4096;

pub const fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

pub const fn page_round_up(len: u64) -> u64 {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

bitflags! {
    /// Access protection requested by callers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    /// Placement and sharing flags for `map_region`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MapFlags: u32 {
        const PRIVATE    = 1 << 0;
        const SHARED     = 1 << 1;
        const FIXED      = 1 << 2;
        const STACK      = 1 << 3;
        const ZERO       = 1 << 4;
        const DONTEXPAND = 1 << 5;
    }
}

bitflags! {
    /// Semantic region flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VmFlags: u32 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const EXEC       = 1 << 2;
        const ZERO       = 1 << 3;
        const SHARED     = 1 << 4;
        const GROWSDOWN  = 1 << 5;
        const DONTEXPAND = 1 << 6;
        /// Unreadable guard page below a stack.
        const GUARD      = 1 << 7;
        const FILE       = 1 << 8;
    }
}

bitflags! {
    /// Flags handed to the MMU hooks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MmuFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

/// File backing of a region; the inode lives with the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileBacking {
    pub ino: u64,
    pub off: u64,
    pub filesz: u64,
    pub memsz: u64,
}

/// One virtual memory region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vmr {
    /// First byte, page-aligned.
    pub start: u64,
    /// Last byte, inclusive; `end + 1` is page-aligned.
    pub end: u64,
    pub flags: VmFlags,
    pub mmu: MmuFlags,
    pub file: Option<FileBacking>,
}

impl Vmr {
    pub fn new(start: u64, end: u64, flags: VmFlags, user: bool) -> Self {
        let mut vmr = Vmr { start, end, flags, mmu: MmuFlags::empty(), file: None };
        vmr.refresh_mmu(user);
        vmr
    }

    /// Bytes covered.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// One past the last byte.
    pub fn upper_bound(&self) -> u64 {
        self.end + 1
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }

    pub fn is_stack(&self) -> bool {
        self.flags.contains(VmFlags::GROWSDOWN) && !self.flags.contains(VmFlags::GUARD)
    }

    pub fn is_guard(&self) -> bool {
        self.flags.contains(VmFlags::GUARD)
    }

    pub fn readable(&self) -> bool {
        self.flags.contains(VmFlags::READ)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(VmFlags::WRITE)
    }

    pub fn executable(&self) -> bool {
        self.flags.contains(VmFlags::EXEC)
    }

    /// Current protection as a `Prot` value.
    pub fn prot(&self) -> Prot {
        let mut prot = Prot::empty();
        if self.readable() {
            prot |= Prot::READ;
        }
        if self.writable() {
            prot |= Prot::WRITE;
        }
        if self.executable() {
            prot |= Prot::EXEC;
        }
        prot
    }

    /// Rewrite protection bits, rederiving the MMU flags.
    pub fn set_prot(&mut self, prot: Prot, user: bool) {
        self.flags.remove(VmFlags::READ | VmFlags::WRITE | VmFlags::EXEC);
        if prot.contains(Prot::READ) {
            self.flags |= VmFlags::READ;
        }
        if prot.contains(Prot::WRITE) {
            self.flags |= VmFlags::WRITE;
        }
        if prot.contains(Prot::EXEC) {
            self.flags |= VmFlags::EXEC;
        }
        self.refresh_mmu(user);
    }

    fn refresh_mmu(&mut self, user: bool) {
        let mut mmu = MmuFlags::empty();
        if self.readable() {
            mmu |= MmuFlags::READ;
        }
        if self.writable() {
            mmu |= MmuFlags::WRITE;
        }
        if self.executable() {
            mmu |= MmuFlags::EXEC;
        }
        if user {
            mmu |= MmuFlags::USER;
        }
        self.mmu = mmu;
    }

    /// Region flags derived from a `map_region` request.
    pub fn flags_from_request(prot: Prot, flags: MapFlags) -> VmFlags {
        let mut vm = VmFlags::empty();
        if prot.contains(Prot::READ) {
            vm |= VmFlags::READ;
        }
        if prot.contains(Prot::WRITE) {
            vm |= VmFlags::WRITE;
        }
        if prot.contains(Prot::EXEC) {
            vm |= VmFlags::EXEC;
        }
        if flags.contains(MapFlags::ZERO) {
            vm |= VmFlags::ZERO;
        }
        if flags.contains(MapFlags::SHARED) {
            vm |= VmFlags::SHARED;
        }
        if flags.contains(MapFlags::STACK) {
            vm |= VmFlags::GROWSDOWN;
        }
        if flags.contains(MapFlags::DONTEXPAND) {
            vm |= VmFlags::DONTEXPAND;
        }
        vm
    }
}
