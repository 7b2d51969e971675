//! Kernel error kinds.
//!
//! Every fallible operation in the core returns `Result<T, Error>`. The
//! syscall layer translates these to the user ABI errno convention via
//! [`Error::code`], which yields the conventional negative value.

/// Kernel-wide error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument.
    Inval,
    /// Out of memory.
    NoMem,
    /// No such entry.
    NoEnt,
    /// No such process or thread.
    Srch,
    /// Operation interrupted by signal or cancellation.
    Intr,
    /// A timed wait expired.
    TimedOut,
    /// Entry already exists.
    Exist,
    /// Permission denied by protection rules.
    Acces,
    /// Bad address.
    Fault,
    /// Resource temporarily unavailable.
    Again,
    /// Operation not permitted.
    Perm,
    /// Resource busy.
    Busy,
    /// Not an executable image.
    NoExec,
    /// No child processes.
    Child,
    /// Operation not supported.
    NoSys,
}

impl Error {
    /// Negative errno value for the user ABI boundary.
    pub const fn code(self) -> i32 {
        match self {
            Error::Perm => -1,
            Error::NoEnt => -2,
            Error::Srch => -3,
            Error::Intr => -4,
            Error::NoMem => -12,
            Error::Acces => -13,
            Error::Fault => -14,
            Error::Busy => -16,
            Error::Exist => -17,
            Error::Inval => -22,
            Error::NoExec => -8,
            Error::Child => -10,
            Error::Again => -11,
            Error::NoSys => -38,
            Error::TimedOut => -110,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Error::Inval => "invalid argument",
            Error::NoMem => "out of memory",
            Error::NoEnt => "no such entry",
            Error::Srch => "no such process",
            Error::Intr => "interrupted",
            Error::TimedOut => "timed out",
            Error::Exist => "already exists",
            Error::Acces => "permission denied",
            Error::Fault => "bad address",
            Error::Again => "try again",
            Error::Perm => "operation not permitted",
            Error::Busy => "resource busy",
            Error::NoExec => "exec format error",
            Error::Child => "no child processes",
            Error::NoSys => "not supported",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
