/*
 * Signal Subsystem
 *
 * Standard Unix signals with POSIX-like semantics: per-thread and
 * per-process pending sets backed by per-signal FIFO queues, ordered
 * delivery (thread-directed before process-directed, lowest number
 * first), default actions, and handler dispatch frames.
 */

pub mod api;
pub mod dispatch;
pub mod queues;

pub use api::{
    alarm, kill, pause, pthread_kill, pthread_sigmask, pthread_sigqueue, sigaction, sigpending,
    sigprocmask, sigsuspend, sigtimedwait, sigwaitinfo,
};
pub use queues::SignalDesc;

use bitflags::bitflags;

/// Number of signals.
pub const NSIG: usize = 32;

pub const SIGABRT: usize = 1; //  abnormal termination (abort)         | terminate+core
pub const SIGALRM: usize = 2; //  timer expired (alarm)                | terminate
pub const SIGBUS: usize = 3; //   hardware fault                       | terminate+core
pub const SIGCANCEL: usize = 4; // threads library internal use        | ignore
pub const SIGCHLD: usize = 5; //  change in status of child            | ignore
pub const SIGCONT: usize = 6; //  continue stopped process             | continue/ignore
pub const SIGEMT: usize = 7; //   hardware fault                       | terminate+core
pub const SIGFPE: usize = 8; //   arithmetic exception                 | terminate+core
pub const SIGHUP: usize = 9; //   hangup                               | terminate
pub const SIGILL: usize = 10; //  illegal instruction                  | terminate+core
pub const SIGINT: usize = 11; //  terminal interrupt character         | terminate
pub const SIGIO: usize = 12; //   asynchronous I/O                     | terminate
pub const SIGIOT: usize = 13; //  hardware fault                       | terminate+core
pub const SIGKILL: usize = 14; // termination                          | terminate
pub const SIGPIPE: usize = 15; // write to pipe with no readers        | terminate
pub const SIGPROF: usize = 16; // profiling time alarm                 | terminate
pub const SIGQUIT: usize = 17; // terminal quit character              | terminate+core
pub const SIGSEGV: usize = 18; // invalid memory reference             | terminate+core
pub const SIGSTOP: usize = 19; // stop                                 | stop process
pub const SIGSYS: usize = 20; //  invalid system call                  | terminate+core
pub const SIGTERM: usize = 21; // termination                          | terminate
pub const SIGTRAP: usize = 22; // hardware fault                       | terminate+core
pub const SIGTSTP: usize = 23; // terminal stop character              | stop process
pub const SIGTTIN: usize = 24; // background read from control tty     | stop process
pub const SIGTTOU: usize = 25; // background write to control tty      | stop process
pub const SIGURG: usize = 26; //  urgent condition (sockets)           | ignore
pub const SIGUSR1: usize = 27; // user-defined signal                  | terminate
pub const SIGUSR2: usize = 28; // user-defined signal                  | terminate
pub const SIGVTALRM: usize = 29; // virtual time alarm                 | terminate
pub const SIGWINCH: usize = 30; // terminal window size change         | ignore
pub const SIGXCPU: usize = 31; // CPU limit exceeded                   | terminate
pub const SIGXFSZ: usize = 32; // file size limit exceeded             | terminate

/// True for signal numbers outside `1..=NSIG`.
pub const fn sig_bad(signo: usize) -> bool {
    signo < 1 || signo > NSIG
}

pub const SIGNAL_NAMES: [&str; NSIG] = [
    "SIGABRT", "SIGALRM", "SIGBUS", "SIGCANCEL", "SIGCHLD", "SIGCONT", "SIGEMT", "SIGFPE",
    "SIGHUP", "SIGILL", "SIGINT", "SIGIO", "SIGIOT", "SIGKILL", "SIGPIPE", "SIGPROF", "SIGQUIT",
    "SIGSEGV", "SIGSTOP", "SIGSYS", "SIGTERM", "SIGTRAP", "SIGTSTP", "SIGTTIN", "SIGTTOU",
    "SIGURG", "SIGUSR1", "SIGUSR2", "SIGVTALRM", "SIGWINCH", "SIGXCPU", "SIGXFSZ",
];

/// Default disposition classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigDefault {
    Ignore,
    Abort,
    Terminate,
    TerminateCore,
    Stop,
    Continue,
}

const SIG_DEFAULTS: [SigDefault; NSIG] = {
    use SigDefault::*;
    [
        TerminateCore, // SIGABRT
        Terminate,     // SIGALRM
        TerminateCore, // SIGBUS
        Ignore,        // SIGCANCEL
        Ignore,        // SIGCHLD
        Continue,      // SIGCONT
        TerminateCore, // SIGEMT
        TerminateCore, // SIGFPE
        Terminate,     // SIGHUP
        TerminateCore, // SIGILL
        Terminate,     // SIGINT
        Terminate,     // SIGIO
        TerminateCore, // SIGIOT
        Terminate,     // SIGKILL
        Terminate,     // SIGPIPE
        Terminate,     // SIGPROF
        TerminateCore, // SIGQUIT
        TerminateCore, // SIGSEGV
        Stop,          // SIGSTOP
        TerminateCore, // SIGSYS
        Terminate,     // SIGTERM
        TerminateCore, // SIGTRAP
        Stop,          // SIGTSTP
        Stop,          // SIGTTIN
        Stop,          // SIGTTOU
        Ignore,        // SIGURG
        Terminate,     // SIGUSR1
        Terminate,     // SIGUSR2
        Terminate,     // SIGVTALRM
        Ignore,        // SIGWINCH
        Terminate,     // SIGXCPU
        Terminate,     // SIGXFSZ
    ]
};

/// Default action for `signo`.
pub fn sig_default_action(signo: usize) -> SigDefault {
    SIG_DEFAULTS[signo - 1]
}

/// How `sigprocmask`-style calls combine a set with the current mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigHow {
    Block,
    Unblock,
    SetMask,
}

/// A set of signals, one bit per signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(pub u64);

impl SigSet {
    pub const fn empty() -> Self {
        SigSet(0)
    }

    pub const fn full() -> Self {
        SigSet((1u64 << NSIG) - 1)
    }

    pub const fn of(signo: usize) -> Self {
        SigSet(1u64 << (signo - 1))
    }

    pub fn add(&mut self, signo: usize) {
        self.0 |= 1u64 << (signo - 1);
    }

    pub fn del(&mut self, signo: usize) {
        self.0 &= !(1u64 << (signo - 1));
    }

    pub fn contains(&self, signo: usize) -> bool {
        self.0 & (1u64 << (signo - 1)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: SigSet) -> SigSet {
        SigSet(self.0 | other.0)
    }

    pub fn intersect(self, other: SigSet) -> SigSet {
        SigSet(self.0 & other.0)
    }

    pub fn subtract(self, other: SigSet) -> SigSet {
        SigSet(self.0 & !other.0)
    }

    /// Lowest-numbered member, if any. Delivery prefers low numbers.
    pub fn first(self) -> Option<usize> {
        if self.0 == 0 { None } else { Some(self.0.trailing_zeros() as usize + 1) }
    }

    /// Apply a `SigHow` update, returning the previous value.
    pub fn apply(&mut self, how: SigHow, set: SigSet) -> SigSet {
        let old = *self;
        match how {
            SigHow::Block => self.0 |= set.0,
            SigHow::Unblock => self.0 &= !set.0,
            SigHow::SetMask => self.0 = set.0,
        }
        old
    }
}

bitflags! {
    /// `sigaction` option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SaFlags: u32 {
        const NOCLDSTOP = 1 << 0;
        const NOCLDWAIT = 1 << 1;
        const NODEFER   = 1 << 2;
        const ONSTACK   = 1 << 3;
        const RESETHAND = 1 << 4;
        const RESTART   = 1 << 5;
        const SIGINFO   = 1 << 6;
    }
}

/// Disposition of one signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigHandler {
    /// Take the default action.
    #[default]
    Default,
    /// Discard the signal.
    Ignore,
    /// Invoke a handler at this address.
    Handler(usize),
}

/// Handler configuration for one signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    pub handler: SigHandler,
    pub flags: SaFlags,
    pub mask: SigSet,
}

/// Value payload carried by queued signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigVal {
    Int(i64),
    Ptr(usize),
}

impl Default for SigVal {
    fn default() -> Self {
        SigVal::Int(0)
    }
}

/// One signal occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigInfo {
    pub signo: usize,
    pub code: i32,
    /// Sending process.
    pub pid: usize,
    /// Real uid of the sender.
    pub uid: u32,
    /// Faulting address for hardware-originated signals.
    pub addr: usize,
    /// Exit value or signal for SIGCHLD.
    pub status: i32,
    pub value: SigVal,
}

impl SigInfo {
    pub fn new(signo: usize, value: SigVal) -> Self {
        SigInfo { signo, value, ..SigInfo::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigset_algebra() {
        let mut set = SigSet::empty();
        set.add(SIGUSR1);
        set.add(SIGKILL);
        assert!(set.contains(SIGUSR1));
        assert!(!set.contains(SIGUSR2));
        assert_eq!(set.first(), Some(SIGKILL)); // 14 < 27
        set.del(SIGKILL);
        assert_eq!(set.first(), Some(SIGUSR1));
    }

    #[test]
    fn apply_follows_how() {
        let mut mask = SigSet::of(SIGINT);
        mask.apply(SigHow::Block, SigSet::of(SIGUSR1));
        assert!(mask.contains(SIGINT) && mask.contains(SIGUSR1));
        mask.apply(SigHow::Unblock, SigSet::of(SIGINT));
        assert!(!mask.contains(SIGINT));
        mask.apply(SigHow::SetMask, SigSet::of(SIGHUP));
        assert_eq!(mask, SigSet::of(SIGHUP));
    }

    #[test]
    fn defaults_match_classification() {
        assert_eq!(sig_default_action(SIGCHLD), SigDefault::Ignore);
        assert_eq!(sig_default_action(SIGSEGV), SigDefault::TerminateCore);
        assert_eq!(sig_default_action(SIGSTOP), SigDefault::Stop);
        assert_eq!(sig_default_action(SIGCONT), SigDefault::Continue);
        assert_eq!(sig_default_action(SIGKILL), SigDefault::Terminate);
    }
}
