//! Tasks
//!
//! A task is the unit of scheduling: an entry function, an owned stack with
//! canaries at both ends, a saved execution context and a scheduling state.
//! Tasks are created dynamically with [`spawn`] and live in an arena inside
//! the KCB; everything else refers to them by [`TaskId`].
use alloc::boxed::Box;
use alloc::vec;

use crate::error::{fatal, Error};
use crate::hal::{self, PortContext};
use crate::klock;
use crate::sched;
use crate::state::{Kcb, KernelFlags};
use crate::wait;

/// Unique task identifier, assigned monotonically from 1. 0 is never a
/// valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u16);

impl TaskId {
    #[inline]
    pub(crate) const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw id value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// The eight named scheduling priorities.
///
/// The numeric value is the countdown reload: a task becomes eligible when
/// its per-task counter, decremented once per visited scheduler pass,
/// reaches zero. Lower values therefore mean higher priority - a
/// [`Priority::High`] task (7) is selected roughly `0x1F / 0x07` times as
/// often as a [`Priority::Normal`] one (31).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Crit = 0x01,
    RealTime = 0x03,
    High = 0x07,
    Above = 0x0F,
    Normal = 0x1F,
    Below = 0x3F,
    Low = 0x7F,
    Idle = 0xFF,
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self, Error> {
        match raw {
            0x01 => Ok(Self::Crit),
            0x03 => Ok(Self::RealTime),
            0x07 => Ok(Self::High),
            0x0F => Ok(Self::Above),
            0x1F => Ok(Self::Normal),
            0x3F => Ok(Self::Below),
            0x7F => Ok(Self::Low),
            0xFF => Ok(Self::Idle),
            _ => Err(Error::TaskInvalidPrio),
        }
    }
}

/// Weighted round-robin state: a static base weight and a live countdown.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Prio {
    pub(crate) base: u8,
    pub(crate) counter: u8,
}

impl Prio {
    pub(crate) fn new(priority: Priority) -> Self {
        let base = priority as u8;
        Self {
            base,
            counter: base,
        }
    }

    /// One scheduler visit: decrement the countdown, saturating at zero.
    /// Returns `true` when the task has become eligible.
    #[inline]
    pub(crate) fn tick(&mut self) -> bool {
        self.counter = self.counter.saturating_sub(1);
        self.counter == 0
    }

    /// Reload the countdown from the base weight after a selection.
    #[inline]
    pub(crate) fn reload(&mut self) {
        self.counter = self.base;
    }
}

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    /// Created but not yet made ready (transient during spawn).
    Stopped,
    Ready,
    Running,
    /// On exactly one wait set, or sleeping with `delay > 0` - never both.
    Blocked,
    Suspended,
}

/// Canary word written at both ends of every task stack.
pub(crate) const STACK_CANARY: u32 = 0xC0DE_5A5A;

/// Bytes reserved at the top of every stack so that an interrupt taken at
/// peak stack usage can still save a full trap frame.
pub const ISR_RED_ZONE: usize = 128;

/// Smallest accepted stack size; [`spawn`] silently rounds requests up to
/// this floor (256 bytes of working space plus the ISR red zone).
pub const MIN_STACK_SIZE: usize = 256 + ISR_RED_ZONE;

/// 16-byte aligned storage unit for task stacks.
#[repr(align(16))]
#[derive(Clone, Copy)]
struct StackChunk([u8; 16]);

/// A task's owned stack: 16-byte aligned, canaried at both ends.
pub(crate) struct TaskStack {
    chunks: Box<[StackChunk]>,
}

impl TaskStack {
    /// Allocate a stack of at least `size` bytes (rounded up to a multiple
    /// of 16) and write the canary words.
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(MIN_STACK_SIZE);
        let chunks = size.div_ceil(16);
        let mut stack = Self {
            chunks: vec![StackChunk([0; 16]); chunks].into_boxed_slice(),
        };
        let canary = STACK_CANARY.to_le_bytes();
        stack.chunks[0].0[..4].copy_from_slice(&canary);
        let last = stack.chunks.len() - 1;
        stack.chunks[last].0[12..].copy_from_slice(&canary);
        stack
    }

    #[inline]
    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.chunks.as_ptr() as *mut u8
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.chunks.len() * 16
    }

    /// Verify the canary words at `base` and `base + len - 4`.
    pub(crate) fn check(&self) -> bool {
        let canary = STACK_CANARY.to_le_bytes();
        let last = self.chunks.len() - 1;
        self.chunks[0].0[..4] == canary && self.chunks[last].0[12..] == canary
    }
}

/// *Task control block* - the state data of a task.
pub(crate) struct Tcb {
    pub(crate) id: TaskId,
    pub(crate) entry: fn(),
    pub(crate) ctx: PortContext,
    pub(crate) stack: TaskStack,
    pub(crate) prio: Prio,
    pub(crate) state: TaskState,
    /// Ticks remaining of a timed sleep while `state == Blocked`.
    pub(crate) delay: u16,
    /// Opaque word consulted by the real-time hook. A task with a value
    /// here is skipped by the round-robin walk.
    pub(crate) rt_prio: Option<usize>,
    /// A wakeup arrived while the task was suspended; `resume` completes it.
    pub(crate) pending_wake: bool,
    /// The task was blocked when it was suspended; `resume` returns it to
    /// Blocked unless `pending_wake` latched.
    pub(crate) suspended_from_blocked: bool,
}

impl Tcb {
    pub(crate) fn new(id: TaskId, entry: fn(), stack: TaskStack, ctx: PortContext) -> Self {
        Self {
            id,
            entry,
            ctx,
            stack,
            prio: Prio::new(Priority::Normal),
            state: TaskState::Stopped,
            delay: 0,
            rt_prio: None,
            pending_wake: false,
            suspended_from_blocked: false,
        }
    }
}

/// Spawn a new task.
///
/// The stack request is rounded up to [`MIN_STACK_SIZE`] and a multiple of
/// 16. The task starts at [`Priority::Normal`] in the Ready state; it is
/// not dispatched until the scheduler next selects it. Spawn either
/// returns an id or does not return at all: allocation failure is fatal.
pub fn spawn(entry: fn(), stack_size: usize) -> TaskId {
    let mut guard = klock::lock();
    let tid = guard.alloc_tid();
    let stack = TaskStack::new(stack_size);
    // Safety: the stack allocation is owned by the TCB we are about to
    // insert and outlives the context.
    let ctx = unsafe { hal::port().context_init(stack.base_ptr(), stack.len(), entry) };
    let mut tcb = Tcb::new(TaskId::from_raw(tid), entry, stack, ctx);
    tcb.state = TaskState::Ready;
    let slot = guard.tasks.insert(tcb);
    log::debug!("spawned task {tid} in slot {slot}");
    TaskId::from_raw(tid)
}

/// Cancel a task, removing it from the system and releasing its stack.
///
/// Fails with [`Error::TaskCantRemove`] for the running task (including
/// the caller itself) and for the idle task. A Blocked task is removed
/// from whatever wait set it sits on, and any mutexes it holds are handed
/// to their next waiters.
pub fn cancel(tid: TaskId) -> Result<(), Error> {
    let mut guard = klock::lock();
    let slot = guard.slot_of(tid).ok_or(Error::TaskNotFound)?;
    if guard.current == Some(slot) || guard.idle_task == Some(tid) {
        return Err(Error::TaskCantRemove);
    }
    wait::purge_task(&mut guard, tid);
    if guard.last_ready_hint == Some(slot) {
        guard.last_ready_hint = None;
    }
    let tcb = guard.tasks.remove(slot);
    // Safety: the task is not running (checked above), so its context can
    // never be dispatched again.
    unsafe { hal::port().context_destroy(tcb.ctx) };
    log::debug!("cancelled task {}", tid.as_u16());
    Ok(())
}

/// Voluntarily relinquish the processor.
///
/// In cooperative mode this is also where sleeping tasks age toward
/// readiness.
pub fn yield_now() {
    let mut guard = klock::lock();
    if !guard.flags.contains(KernelFlags::STARTED) || guard.flags.contains(KernelFlags::IN_TICK) {
        return;
    }
    if !guard.flags.contains(KernelFlags::PREEMPTIVE) {
        sched::age_delays(&mut guard);
    }
    let cur = match guard.current {
        Some(cur) => cur,
        None => return,
    };
    if guard.tasks[cur].state == TaskState::Running {
        guard.tasks[cur].state = TaskState::Ready;
    }
    sched::reschedule(guard);
}

/// Block the calling task for at least `ticks` timer ticks.
///
/// `delay(0)` is equivalent to [`yield_now`].
pub fn delay(ticks: u16) {
    if ticks == 0 {
        return yield_now();
    }
    let mut guard = klock::lock();
    if guard.expect_task_context().is_err() {
        return;
    }
    let cur = guard.current.unwrap_or_else(|| unreachable!());
    guard.tasks[cur].delay = ticks;
    guard.tasks[cur].state = TaskState::Blocked;
    log::trace!("task {} sleeping for {ticks} ticks", guard.tasks[cur].id.as_u16());
    sched::reschedule(guard);
}

/// Wait for the next interrupt.
///
/// In preemptive mode the tick interrupt reschedules, so a task sitting in
/// `wfi` is preempted normally. In cooperative mode the processor is first
/// relinquished to any other ready task, since nothing else would
/// reschedule.
pub fn wfi() {
    let preemptive = {
        let guard = klock::lock();
        if !guard.flags.contains(KernelFlags::STARTED) || guard.flags.contains(KernelFlags::IN_TICK)
        {
            return;
        }
        guard.flags.contains(KernelFlags::PREEMPTIVE)
    };
    if !preemptive {
        yield_now();
    }
    hal::port().cpu_idle();
}

/// Suspend a task. Suspending the running task switches away immediately;
/// the call returns after a matching [`resume`].
///
/// Suspending a Blocked task is permitted: the task keeps its wait-set
/// position (or remaining delay), and a wakeup arriving meanwhile is
/// latched until the suspension is lifted.
pub fn suspend(tid: TaskId) -> Result<(), Error> {
    let mut guard = klock::lock();
    let slot = guard.slot_of(tid).ok_or(Error::TaskNotFound)?;
    if guard.idle_task == Some(tid) {
        return Err(Error::TaskCantSuspend);
    }
    let is_self = guard.current == Some(slot);
    let tcb = &mut guard.tasks[slot];
    match tcb.state {
        TaskState::Suspended => return Err(Error::TaskCantSuspend),
        TaskState::Blocked => {
            tcb.suspended_from_blocked = true;
            tcb.state = TaskState::Suspended;
        }
        _ => tcb.state = TaskState::Suspended,
    }
    log::trace!("task {} suspended", tid.as_u16());
    if is_self {
        sched::reschedule(guard);
    }
    Ok(())
}

/// Resume a suspended task.
///
/// A task that was suspended while Blocked goes back to Blocked unless its
/// wakeup already arrived, in which case it becomes Ready directly.
pub fn resume(tid: TaskId) -> Result<(), Error> {
    let mut guard = klock::lock();
    let slot = guard.slot_of(tid).ok_or(Error::TaskNotFound)?;
    let tcb = &mut guard.tasks[slot];
    if tcb.state != TaskState::Suspended {
        return Err(Error::TaskCantResume);
    }
    tcb.state = if tcb.suspended_from_blocked && !tcb.pending_wake {
        TaskState::Blocked
    } else {
        TaskState::Ready
    };
    tcb.suspended_from_blocked = false;
    tcb.pending_wake = false;
    log::trace!("task {} resumed -> {:?}", tid.as_u16(), tcb.state);
    Ok(())
}

/// Change a task's base priority. The countdown is reloaded from the new
/// base.
pub fn set_priority(tid: TaskId, priority: Priority) -> Result<(), Error> {
    let mut guard = klock::lock();
    let slot = guard.slot_of(tid).ok_or(Error::TaskNotFound)?;
    guard.tasks[slot].prio = Prio::new(priority);
    Ok(())
}

/// Attach (or clear) the opaque real-time priority consulted by the RT
/// scheduling hook. While set, the task is skipped by the round-robin walk
/// and runs only when the hook selects it.
pub fn set_rt_priority(tid: TaskId, rt_prio: Option<usize>) -> Result<(), Error> {
    let mut guard = klock::lock();
    let slot = guard.slot_of(tid).ok_or(Error::TaskNotFound)?;
    guard.tasks[slot].rt_prio = rt_prio;
    Ok(())
}

/// Id of the calling task, or `None` outside of task context.
pub fn current() -> Option<TaskId> {
    let guard = klock::lock();
    guard.current_tid()
}

/// Find a task by its entry function.
pub fn find(entry: fn()) -> Result<TaskId, Error> {
    let guard = klock::lock();
    guard
        .tasks
        .iter()
        .find(|(_, tcb)| tcb.entry == entry)
        .map(|(_, tcb)| tcb.id)
        .ok_or(Error::TaskNotFound)
}

/// Number of live tasks.
pub fn count() -> u16 {
    let guard = klock::lock();
    guard.tasks.len() as u16
}

/// Verify the stack canaries of every live task. A mismatch is fatal.
pub(crate) fn check_canaries(kcb: &Kcb) {
    for (_, tcb) in kcb.tasks.iter() {
        if !tcb.stack.check() {
            fatal(Error::StackCheck, "stack canary mismatch");
        }
    }
}

/// First-dispatch hook, invoked by the port before a task's entry function.
///
/// Releases the critical section that was transferred across the context
/// switch and leaves interrupts enabled.
#[doc(hidden)]
pub fn task_entry_hook() {
    // Safety: the port guarantees a first dispatch happens under a
    // transferred CPU lock.
    let guard = unsafe { klock::assume_transferred() };
    log::trace!("task {:?} first dispatch", guard.current_tid());
    drop(guard);
}

/// Task-exit hook, invoked by the port when an entry function returns.
///
/// Removes the task from the system and dispatches the next ready task.
/// Never returns.
#[doc(hidden)]
pub fn task_exit_hook() -> ! {
    let mut guard = klock::lock();
    let cur = match guard.current {
        Some(cur) => cur,
        None => fatal(Error::Unknown, "task exit without a running task"),
    };
    let tcb = guard.tasks.remove(cur);
    log::debug!("task {} exited", tcb.id.as_u16());
    wait::purge_task(&mut guard, tcb.id);
    if guard.last_ready_hint == Some(cur) {
        guard.last_ready_hint = None;
    }
    guard.current = None;
    // Release the stack now; nothing below touches it, and the port
    // discards the calling context without another save.
    drop(tcb);
    let next = sched::select_ready(&mut guard);
    guard.current = Some(next);
    let resume = guard.tasks[next].ctx;
    core::mem::forget(guard);
    // Safety: CPU lock held (the forgotten guard's acquisition is
    // transferred to the resumed context); our stack and context have been
    // detached from the kernel above.
    unsafe { hal::port().exit_and_dispatch(resume) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_reaches_zero_after_base_visits() {
        let mut prio = Prio::new(Priority::High);
        let mut visits = 0;
        while !prio.tick() {
            visits += 1;
        }
        assert_eq!(visits + 1, 0x07);
        prio.reload();
        assert_eq!(prio.counter, 0x07);
    }

    #[test]
    fn countdown_saturates() {
        let mut prio = Prio::new(Priority::Crit);
        assert!(prio.tick());
        assert!(prio.tick());
        assert_eq!(prio.counter, 0);
    }

    #[test]
    fn named_priorities_round_trip() {
        for raw in [0x01, 0x03, 0x07, 0x0F, 0x1F, 0x3F, 0x7F, 0xFF] {
            assert_eq!(Priority::try_from(raw).unwrap() as u8, raw);
        }
        assert_eq!(Priority::try_from(0x20), Err(Error::TaskInvalidPrio));
    }

    #[test]
    fn stack_is_aligned_and_canaried() {
        let stack = TaskStack::new(1000);
        assert_eq!(stack.base_ptr() as usize % 16, 0);
        assert_eq!(stack.len(), 1008);
        assert!(stack.check());
    }

    #[test]
    fn stack_requests_are_clamped_to_the_floor() {
        let stack = TaskStack::new(16);
        assert_eq!(stack.len(), MIN_STACK_SIZE);
        assert!(stack.check());
    }

    #[test]
    fn corrupted_canary_is_detected() {
        let mut stack = TaskStack::new(512);
        let last = stack.chunks.len() - 1;
        stack.chunks[last].0[15] ^= 0xFF;
        assert!(!stack.check());
    }
}
