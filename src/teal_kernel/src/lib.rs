//! The teal kernel
//!
//! A small preemptive real-time kernel for 32-bit single-core targets. The
//! machine is multiplexed across a dynamic set of tasks, each with its own
//! stack and saved context, scheduled by a weighted round-robin dispatcher
//! with an optional real-time hook. Tasks coordinate through counting
//! semaphores, non-recursive mutexes, condition variables, message queues,
//! byte pipes and software timers.
//!
//! Architecture-specific machinery (trap trampolines, register
//! save/restore, the tick source, the heap) stays behind the [`Port`]
//! trait; `teal_port_std` implements it on a hosted machine for
//! development and testing.
//!
//! # Boot
//!
//! The platform entry point calls [`start`] with its port and an
//! `app_main` function. `app_main` spawns the initial tasks and returns
//! `true` for preemptive or `false` for cooperative scheduling; `start`
//! then spawns the idle task, enables the tick source and dispatches the
//! first task. It never returns.
//!
//! ```no_run
//! fn app_main() -> bool {
//!     teal_kernel::task::spawn(worker, 4096);
//!     true // preemptive
//! }
//!
//! fn worker() {
//!     loop {
//!         // ...
//!         teal_kernel::task::delay(10);
//!     }
//! }
//! ```
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)

extern crate alloc;

mod condvar;
mod error;
mod hal;
mod klock;
mod mqueue;
mod mutex;
mod pipe;
mod sched;
mod semaphore;
mod state;
pub mod task;
mod time;
pub mod timer;
mod wait;

pub use condvar::Condvar;
pub use error::Error;
pub use hal::{IrqToken, Port, PortContext};
pub use mqueue::{Message, MessageQueue};
pub use mutex::Mutex;
pub use pipe::Pipe;
pub use sched::{set_rt_scheduler, RtScheduler, RtTask, RtView};
pub use semaphore::{Semaphore, SEM_MAX_COUNT};
pub use task::{Priority, TaskId, ISR_RED_ZONE, MIN_STACK_SIZE};
pub use time::{ms_to_ticks, ticks, uptime_ms};
pub use timer::{TimerCallback, TimerId, TimerMode};

#[doc(hidden)]
pub use sched::timer_tick;
#[doc(hidden)]
pub use task::{task_entry_hook, task_exit_hook};

use state::{Kcb, KernelFlags};

/// Boot the kernel and never return.
///
/// Sequence: bring up the platform, initialize the kernel control block,
/// run `app_main` (which spawns the initial tasks and selects the
/// scheduling mode), spawn the idle task, enable the tick source, and
/// dispatch the first ready task.
pub fn start(port: &'static dyn Port, app_main: fn() -> bool) -> ! {
    hal::install(port);
    port.hardware_init();
    time::reset();
    klock::init_kcb(Kcb::new());
    log::info!("teal: kernel control block initialized");

    let preemptive = app_main();
    {
        let mut guard = klock::lock();
        guard.flags.set(KernelFlags::PREEMPTIVE, preemptive);
    }
    log::info!(
        "teal: scheduling mode: {}",
        if preemptive { "preemptive" } else { "cooperative" }
    );

    let idle = task::spawn(idle_entry, MIN_STACK_SIZE);
    let _ = task::set_priority(idle, Priority::Idle);
    {
        let mut guard = klock::lock();
        guard.idle_task = Some(idle);
    }

    port.timer_enable();

    let mut guard = klock::lock();
    guard.flags.insert(KernelFlags::STARTED);
    let first = sched::select_ready(&mut guard);
    guard.current = Some(first);
    let ctx = guard.tasks[first].ctx;
    log::info!(
        "teal: dispatching first task {}",
        guard.tasks[first].id.as_u16()
    );
    // The boot context never resumes; its lock acquisition is transferred
    // to the first task, which releases it in `task_entry_hook`.
    core::mem::forget(guard);
    // Safety: CPU lock held, called once at the end of boot.
    unsafe { port.dispatch_first(ctx) }
}

/// Request an orderly shutdown of the machine through the port.
pub fn shutdown() -> ! {
    log::info!("teal: shutdown requested");
    hal::port().system_off()
}

/// The idle task: relinquish the processor, then wait for an interrupt.
/// Always ready, so the dispatcher's search has a terminus while every
/// other task is blocked.
fn idle_entry() {
    loop {
        task::yield_now();
        task::wfi();
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use crate::hal::PortContext;
    use crate::state::Kcb;
    use crate::task::{Prio, Priority, TaskId, TaskStack, TaskState, Tcb, MIN_STACK_SIZE};

    pub(crate) fn entry() {}

    /// Insert a Ready task directly into an unbooted `Kcb`, bypassing the
    /// port. Returns its arena slot and id.
    pub(crate) fn stub_task(kcb: &mut Kcb, priority: Priority) -> (usize, TaskId) {
        let tid = kcb.alloc_tid();
        let mut tcb = Tcb::new(
            TaskId::from_raw(tid),
            entry,
            TaskStack::new(MIN_STACK_SIZE),
            PortContext::from_raw(0),
        );
        tcb.state = TaskState::Ready;
        tcb.prio = Prio::new(priority);
        let slot = kcb.tasks.insert(tcb);
        (slot, TaskId::from_raw(tid))
    }
}
