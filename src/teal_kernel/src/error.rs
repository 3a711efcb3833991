//! Error taxonomy
//!
//! Every recoverable failure in the public API maps to one variant of
//! [`Error`]. The discriminants are stable negative integers (success is
//! `Ok(())`, i.e. code `0`) so that values can cross an FFI or syscall
//! boundary unchanged. Invariant breaches do not produce an `Error`; they go
//! through [`fatal`], which never returns.
use core::fmt;

/// A recoverable kernel error.
///
/// The integer representation of each variant is part of the kernel ABI and
/// must not change.
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Generic failure; also returned for operations attempted from an
    /// invalid context (e.g. a blocking call inside a timer callback).
    Fail = -1,
    /// The object is busy: re-lock by the mutex owner, destruction of an
    /// owned or contended object, a full message queue.
    TaskBusy = -2,
    /// No task (or timer) with the given id exists.
    TaskNotFound = -3,
    /// The task cannot be cancelled (it is running, or it is the idle task).
    TaskCantRemove = -4,
    /// The task cannot be suspended (already suspended, or it is the idle
    /// task).
    TaskCantSuspend = -5,
    /// The task cannot be resumed (it is not suspended).
    TaskCantResume = -6,
    /// The priority value is not one of the eight named priorities.
    TaskInvalidPrio = -7,
    /// Invalid semaphore parameters or semaphore destruction with waiters.
    SemOperation = -8,
    /// A mutex operation that requires ownership was attempted by a task
    /// that does not own the mutex.
    NotOwner = -9,
    /// A timed acquisition reached its deadline.
    Timeout = -10,
    /// Message queue destruction was attempted while messages are pending.
    MqNotEmpty = -11,
    /// Stack canary mismatch.
    StackCheck = -12,
    /// Task stack allocation failed.
    StackAlloc = -13,
    /// Task control block allocation failed.
    TcbAlloc = -14,
    /// Kernel control block allocation failed.
    KcbAlloc = -15,
    /// The ready-task search exhausted its iteration bound.
    NoTasks = -16,
    /// Internal state desynchronization.
    Unknown = -17,
}

impl Error {
    /// The stable integer code of this error.
    #[inline]
    pub const fn code(self) -> i16 {
        self as i16
    }

    /// A short human-readable description, used by [`fatal`] and `Display`.
    pub const fn description(self) -> &'static str {
        match self {
            Error::Fail => "operation failed",
            Error::TaskBusy => "object is busy",
            Error::TaskNotFound => "no such task",
            Error::TaskCantRemove => "task cannot be cancelled",
            Error::TaskCantSuspend => "task cannot be suspended",
            Error::TaskCantResume => "task cannot be resumed",
            Error::TaskInvalidPrio => "invalid priority",
            Error::SemOperation => "invalid semaphore operation",
            Error::NotOwner => "caller does not own the mutex",
            Error::Timeout => "timed out",
            Error::MqNotEmpty => "message queue is not empty",
            Error::StackCheck => "stack canary mismatch",
            Error::StackAlloc => "stack allocation failed",
            Error::TcbAlloc => "task control block allocation failed",
            Error::KcbAlloc => "kernel control block allocation failed",
            Error::NoTasks => "no runnable tasks",
            Error::Unknown => "kernel state desynchronized",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// Halt the system with a coded reason.
///
/// Used for invariant breaches only: stack canary mismatch, exhausted
/// scheduler iteration bound, operations on destroyed object handles, state
/// machine desync. Emits the code over the port's diagnostic channel,
/// disables interrupts and never returns. API misuse with a recoverable path
/// returns an [`Error`] instead.
#[cold]
pub(crate) fn fatal(code: Error, msg: &str) -> ! {
    log::error!("kernel panic: {msg}: {code}");
    crate::hal::port().halt()
}
