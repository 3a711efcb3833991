//! The kernel control block
//!
//! A process-wide singleton holding every piece of mutable kernel state:
//! the task arena, the running-task pointer, scheduling mode flags, the
//! synchronization object arenas and the timer lists. It is only reachable
//! through [`crate::klock::CpuLockGuard`], so everything in here may assume
//! mutual exclusion with the tick interrupt.
use alloc::vec::Vec;
use bitflags::bitflags;
use slab::Slab;

use crate::condvar::CondvarCb;
use crate::error::Error;
use crate::mqueue::MqCb;
use crate::mutex::MutexCb;
use crate::pipe::PipeCb;
use crate::sched::RtScheduler;
use crate::semaphore::SemCb;
use crate::task::{TaskId, Tcb};
use crate::timer::{TimerCb, TimerDeadline};

bitflags! {
    /// Kernel lifecycle and mode flags.
    pub(crate) struct KernelFlags: u8 {
        /// The dispatcher reschedules on every tick. Cleared for
        /// cooperative mode, where rescheduling happens only at yields.
        const PREEMPTIVE = 1 << 0;
        /// The first task has been dispatched.
        const STARTED = 1 << 1;
        /// A tick interrupt is being serviced; timer callbacks run under
        /// this flag and must not block.
        const IN_TICK = 1 << 2;
    }
}

/// Kernel control block.
pub(crate) struct Kcb {
    pub(crate) flags: KernelFlags,

    /// All live tasks, keyed by arena slot. Wait sets refer to tasks by
    /// [`TaskId`], never by slot, so a cancelled task can be detected.
    pub(crate) tasks: Slab<Tcb>,

    /// Slot of the task in the Running state, if any.
    pub(crate) current: Option<usize>,

    /// Source for monotonically assigned task ids; 0 is "none".
    pub(crate) next_tid: u16,

    /// The idle task, spawned by `start` and protected from cancellation
    /// and suspension.
    pub(crate) idle_task: Option<TaskId>,

    /// Cached starting point for the next ready search.
    pub(crate) last_ready_hint: Option<usize>,

    /// Optional real-time scheduling hook; overrides round-robin when it
    /// returns a selection.
    pub(crate) rt_sched: Option<RtScheduler>,

    /// Context switches performed; drives the amortized canary check.
    pub(crate) switch_count: u32,

    /// Generation source for synchronization object handles; never 0.
    pub(crate) next_gen: u16,

    pub(crate) semaphores: Slab<SemCb>,
    pub(crate) mutexes: Slab<MutexCb>,
    pub(crate) condvars: Slab<CondvarCb>,
    pub(crate) mqueues: Slab<MqCb>,
    pub(crate) pipes: Slab<PipeCb>,

    /// Master timer list, keyed by arena slot; ids are monotonic.
    pub(crate) timers: Slab<TimerCb>,
    pub(crate) next_timer_id: u16,

    /// Active timers ordered by absolute deadline, earliest first.
    pub(crate) timer_active: Vec<TimerDeadline>,
}

impl Kcb {
    pub(crate) fn new() -> Self {
        Self {
            flags: KernelFlags::empty(),
            tasks: Slab::new(),
            current: None,
            next_tid: 1,
            idle_task: None,
            last_ready_hint: None,
            rt_sched: None,
            switch_count: 0,
            next_gen: 1,
            semaphores: Slab::new(),
            mutexes: Slab::new(),
            condvars: Slab::new(),
            mqueues: Slab::new(),
            pipes: Slab::new(),
            timers: Slab::new(),
            next_timer_id: 1,
            timer_active: Vec::new(),
        }
    }

    /// Allocate a unique task id. Ids are assigned monotonically from 1;
    /// after a wrap-around, ids still held by live tasks are skipped.
    pub(crate) fn alloc_tid(&mut self) -> u16 {
        loop {
            let tid = self.next_tid;
            self.next_tid = self.next_tid.checked_add(1).unwrap_or(1);
            if tid != 0 && self.slot_of(TaskId::from_raw(tid)).is_none() {
                return tid;
            }
        }
    }

    /// Allocate a handle generation. Never 0, so a zeroed handle is always
    /// invalid.
    pub(crate) fn alloc_gen(&mut self) -> u16 {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.checked_add(1).unwrap_or(1);
        gen
    }

    /// Arena slot of the task with the given id.
    pub(crate) fn slot_of(&self, tid: TaskId) -> Option<usize> {
        self.tasks
            .iter()
            .find(|(_, tcb)| tcb.id == tid)
            .map(|(slot, _)| slot)
    }

    /// Id of the task in the Running state.
    pub(crate) fn current_tid(&self) -> Option<TaskId> {
        self.current.map(|slot| self.tasks[slot].id)
    }

    /// Fail with [`Error::Fail`] unless called from a live task context
    /// (scheduler started, a task is running, and we are not inside the
    /// tick interrupt). Blocking operations require this.
    pub(crate) fn expect_task_context(&self) -> Result<(), Error> {
        if self.flags.contains(KernelFlags::STARTED)
            && !self.flags.contains(KernelFlags::IN_TICK)
            && self.current.is_some()
        {
            Ok(())
        } else {
            Err(Error::Fail)
        }
    }
}
