//! Kernel state locking mechanism
//!
//! Every access to the [`Kcb`] or to a synchronization object's internal
//! state happens inside a critical section bracketed by `irq_save` +
//! spinlock acquisition and the matching release. On a single core the
//! spinlock is degenerate - masking the tick interrupt is the real mutual
//! exclusion - but the pattern is preserved so the locking discipline stays
//! visible at every call site.
//!
//! # Hand-over-hand release
//!
//! A blocking operation enters a critical section, moves the running task
//! onto a wait set, and context-switches away *without dropping its guard*:
//! the guard lives in the suspended stack frame, and the next task - which
//! resumes inside a frame holding a guard of its own (or, for a first
//! dispatch, inside [`crate::task_entry_hook`]) - performs the release.
//! Guard objects are interchangeable tokens on the single global lock
//! state, so this balances: every switch transfers exactly one outstanding
//! acquisition to the resumed context. This is what makes the
//! block-then-switch sequence atomic with respect to the tick interrupt.
use core::cell::UnsafeCell;
use core::ops;

use crate::hal::{self, IrqToken};
use crate::state::Kcb;

/// The spinlock half of the critical-section discipline.
static KCB_LOCK: spin::Mutex<()> = spin::Mutex::new(());

struct KcbCell(UnsafeCell<Option<Kcb>>);

// Safety: the contents are only reachable through a `CpuLockGuard`, whose
// construction requires holding `KCB_LOCK` with interrupts masked.
unsafe impl Sync for KcbCell {}

static KCB: KcbCell = KcbCell(UnsafeCell::new(None));

/// (Re-)initialize the kernel control block. Called by [`crate::start`]
/// while the system is still single-threaded.
pub(crate) fn init_kcb(kcb: Kcb) {
    let guard = lock();
    // Safety: we hold the CPU lock, so no other reference to the cell
    // contents exists.
    unsafe { *KCB.0.get() = Some(kcb) };
    drop(guard);
}

/// Enter a critical section and return an RAII guard granting access to the
/// [`Kcb`].
pub(crate) fn lock() -> CpuLockGuard {
    let irq = hal::port().irq_save();
    core::mem::forget(KCB_LOCK.lock());
    CpuLockGuard { irq }
}

/// Assume a critical section that was transferred across a context switch
/// and materialize a guard for it. Dropping the guard leaves interrupts
/// enabled, which is the state a task runs in outside of kernel calls.
///
/// # Safety
///
/// The calling context must have been resumed by a switch performed under
/// the CPU lock, and no guard for that acquisition may exist elsewhere.
pub(crate) unsafe fn assume_transferred() -> CpuLockGuard {
    CpuLockGuard {
        irq: IrqToken::ENABLED,
    }
}

/// RAII guard for a critical section.
///
/// Derefs to the [`Kcb`]. Dropping it releases the spinlock and restores
/// the saved interrupt state (which may immediately deliver a pended tick).
pub(crate) struct CpuLockGuard {
    irq: IrqToken,
}

impl Drop for CpuLockGuard {
    fn drop(&mut self) {
        // Safety: a live guard implies the lock is held by this context.
        unsafe { KCB_LOCK.force_unlock() };
        hal::port().irq_restore(self.irq);
    }
}

impl ops::Deref for CpuLockGuard {
    type Target = Kcb;

    fn deref(&self) -> &Kcb {
        // Safety: the guard proves the critical section is active.
        match unsafe { &*KCB.0.get() } {
            Some(kcb) => kcb,
            None => panic!("kernel is not booted"),
        }
    }
}

impl ops::DerefMut for CpuLockGuard {
    fn deref_mut(&mut self) -> &mut Kcb {
        // Safety: the guard proves the critical section is active, and a
        // `&mut` guard is unique.
        match unsafe { &mut *KCB.0.get() } {
            Some(kcb) => kcb,
            None => panic!("kernel is not booted"),
        }
    }
}
