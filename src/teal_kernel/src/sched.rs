//! Scheduler and dispatcher
//!
//! Ready selection is a weighted round-robin: a bounded circular walk over
//! the task arena that decrements each visited task's countdown and selects
//! the first one to reach zero. Priority is expressed by how many passes a
//! task needs to become eligible, not by reordering. A pluggable real-time
//! hook can short-circuit the walk entirely.
//!
//! The dispatcher proper ([`reschedule`]) wraps the selection with the
//! context switch: the caller has already recorded the outgoing task's new
//! state (Ready for a yield, Blocked/Suspended for a block), and the CPU
//! lock guard is kept alive across the switch so the resumed side performs
//! the release.
use crate::error::{fatal, Error};
use crate::hal;
use crate::klock;
use crate::state::{Kcb, KernelFlags};
use crate::task::{self, TaskId, TaskState};
use crate::time;
use crate::timer;

/// Hard bound on the ready-task search, counting the candidates whose
/// countdown the walk decrements.
///
/// Exceeding it means no countdown could reach zero within the bound - a
/// pathological weight mix (more than ~16 simultaneously ready NORMAL
/// tasks, say) - and the kernel halts with [`Error::NoTasks`]. A walk
/// that completes a full sweep without finding any candidate at all halts
/// the same way without waiting for the bound.
pub(crate) const SCHED_IMAX: u32 = 500;

/// The stack canaries are verified once every this many context switches.
const CANARY_CHECK_PERIOD: u32 = 32;

/// A task's scheduling-relevant state, as seen by an [`RtScheduler`].
#[derive(Debug, Clone, Copy)]
pub struct RtTask {
    pub id: TaskId,
    /// The opaque word attached with [`task::set_rt_priority`].
    pub rt_prio: Option<usize>,
    /// Whether the task is eligible to run.
    pub ready: bool,
}

/// Read-only view of the task set handed to the real-time hook.
pub struct RtView<'a> {
    kcb: &'a Kcb,
}

impl RtView<'_> {
    /// Iterate over all live tasks.
    pub fn tasks(&self) -> impl Iterator<Item = RtTask> + '_ {
        self.kcb.tasks.iter().map(|(_, tcb)| RtTask {
            id: tcb.id,
            rt_prio: tcb.rt_prio,
            ready: tcb.state == TaskState::Ready,
        })
    }
}

/// A pluggable real-time scheduler.
///
/// Invoked with the CPU lock held on every dispatch, before the
/// round-robin walk; it must not call back into the kernel. Returning a
/// Ready task's id dispatches that task immediately.
pub type RtScheduler = fn(RtView<'_>) -> Option<TaskId>;

/// Install or remove the real-time scheduling hook.
pub fn set_rt_scheduler(hook: Option<RtScheduler>) {
    let mut guard = klock::lock();
    guard.rt_sched = hook;
}

/// Decrement the delay of every sleeping task; a task whose delay reaches
/// zero becomes Ready.
pub(crate) fn age_delays(kcb: &mut Kcb) {
    for (_, tcb) in kcb.tasks.iter_mut() {
        if tcb.state == TaskState::Blocked && tcb.delay > 0 {
            tcb.delay -= 1;
            if tcb.delay == 0 {
                tcb.state = TaskState::Ready;
                log::trace!("task {} delay expired", tcb.id.as_u16());
            }
        }
    }
}

/// Select the next task to run, mark it Running and reload its countdown.
///
/// The walk starts at `last_ready_hint` when the hinted task is still an
/// eligible round-robin candidate, otherwise at the successor of the
/// current task.
pub(crate) fn select_ready(kcb: &mut Kcb) -> usize {
    if let Some(hook) = kcb.rt_sched {
        if let Some(tid) = hook(RtView { kcb }) {
            if let Some(slot) = kcb.slot_of(tid) {
                if kcb.tasks[slot].state == TaskState::Ready {
                    let tcb = &mut kcb.tasks[slot];
                    tcb.prio.reload();
                    tcb.state = TaskState::Running;
                    log::trace!("rt hook selected task {}", tid.as_u16());
                    return slot;
                }
            }
        }
    }

    if kcb.tasks.is_empty() {
        fatal(Error::NoTasks, "no tasks exist");
    }
    let cap = kcb.tasks.capacity();
    let start = match kcb.last_ready_hint {
        Some(hint)
            if kcb
                .tasks
                .get(hint)
                .is_some_and(|t| t.state == TaskState::Ready && t.rt_prio.is_none()) =>
        {
            hint
        }
        _ => match kcb.current {
            Some(cur) => (cur + 1) % cap,
            None => 0,
        },
    };

    let mut visits = 0u32;
    let mut barren = 0usize;
    let mut slot = start;
    loop {
        match kcb.tasks.get_mut(slot) {
            Some(tcb) if tcb.state == TaskState::Ready && tcb.rt_prio.is_none() => {
                barren = 0;
                if tcb.prio.tick() {
                    tcb.prio.reload();
                    tcb.state = TaskState::Running;
                    kcb.last_ready_hint = Some(slot);
                    return slot;
                }
                visits += 1;
                if visits >= SCHED_IMAX {
                    fatal(Error::NoTasks, "ready-task search exhausted its bound");
                }
            }
            _ => {
                barren += 1;
                if barren >= cap {
                    fatal(Error::NoTasks, "no ready tasks");
                }
            }
        }
        slot = (slot + 1) % cap;
    }
}

/// Dispatch: pick the next task and switch to it.
///
/// The caller has already moved the outgoing task out of the Running state
/// (to Ready, Blocked or Suspended). If the selection lands on the same
/// task, no switch happens. Consumes the guard; on the switch path the
/// guard stays alive across `context_switch` and is dropped when this task
/// is next dispatched (hand-over-hand release).
pub(crate) fn reschedule(mut guard: klock::CpuLockGuard) {
    let prev = guard.current;
    let next = select_ready(&mut guard);
    if prev == Some(next) {
        return;
    }
    guard.current = Some(next);
    guard.switch_count = guard.switch_count.wrapping_add(1);
    if guard.switch_count % CANARY_CHECK_PERIOD == 0 {
        task::check_canaries(&guard);
    }
    let resume = guard.tasks[next].ctx;
    let save = match prev {
        Some(p) => guard.tasks[p].ctx,
        None => fatal(Error::Unknown, "reschedule without an outgoing task"),
    };
    log::trace!(
        "switch: slot {:?} -> slot {next} (task {})",
        prev,
        guard.tasks[next].id.as_u16()
    );
    // Safety: CPU lock held; `save` is the calling task's context and
    // `resume` belongs to a live task that is now Running.
    unsafe { hal::port().context_switch(save, resume) };
    drop(guard);
}

/// The trap entry for the tick interrupt.
///
/// Invoked by the port once per pended tick: advances the tick counter,
/// ages sleeping tasks, fires due software timers (at most
/// [`timer::MAX_FIRES_PER_TICK`] per tick) and, in preemptive mode,
/// reschedules.
#[doc(hidden)]
pub fn timer_tick() {
    let mut guard = klock::lock();
    if !guard.flags.contains(KernelFlags::STARTED) {
        return;
    }
    let now = time::advance_tick();
    if guard.flags.contains(KernelFlags::PREEMPTIVE) {
        age_delays(&mut guard);
    }
    let expired = timer::collect_expired(&mut guard, now);
    if !expired.is_empty() {
        // Callbacks run logically in interrupt context: the IN_TICK flag
        // makes blocking primitives refuse and suppresses wakeup yields.
        guard.flags.insert(KernelFlags::IN_TICK);
        drop(guard);
        timer::fire(&expired, now);
        guard = klock::lock();
        guard.flags.remove(KernelFlags::IN_TICK);
    }
    if guard.flags.contains(KernelFlags::PREEMPTIVE) {
        if let Some(cur) = guard.current {
            if guard.tasks[cur].state == TaskState::Running {
                guard.tasks[cur].state = TaskState::Ready;
            }
        }
        reschedule(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::PortContext;
    use crate::task::{Prio, Priority, TaskStack, Tcb, MIN_STACK_SIZE};

    fn entry() {}

    fn stub_task(kcb: &mut Kcb, priority: Priority) -> usize {
        let tid = kcb.alloc_tid();
        let mut tcb = Tcb::new(
            TaskId::from_raw(tid),
            entry,
            TaskStack::new(MIN_STACK_SIZE),
            PortContext::from_raw(0),
        );
        tcb.state = TaskState::Ready;
        tcb.prio = Prio::new(priority);
        kcb.tasks.insert(tcb)
    }

    /// Run `n` selection passes, yielding the winner back to Ready each
    /// time, and count selections per slot.
    fn run_passes(kcb: &mut Kcb, n: usize) -> alloc::vec::Vec<(usize, usize)> {
        let mut counts = alloc::vec::Vec::new();
        for _ in 0..n {
            let slot = select_ready(kcb);
            kcb.current = Some(slot);
            match counts.iter_mut().find(|(s, _)| *s == slot) {
                Some((_, c)) => *c += 1,
                None => counts.push((slot, 1)),
            }
            kcb.tasks[slot].state = TaskState::Ready;
        }
        counts
    }

    #[test]
    fn weighted_selection_ratio() {
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Normal);
        let b = stub_task(&mut kcb, Priority::High);
        let counts = run_passes(&mut kcb, 3800);
        let a_count = counts.iter().find(|(s, _)| *s == a).unwrap().1 as f64;
        let b_count = counts.iter().find(|(s, _)| *s == b).unwrap().1 as f64;
        // HIGH (0x07) should win roughly 0x1F/0x07 ~ 4.4x as often as
        // NORMAL (0x1F).
        let ratio = b_count / a_count;
        assert!((3.5..5.5).contains(&ratio), "ratio {ratio}");
    }

    #[test]
    fn equal_weights_share_evenly() {
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Normal);
        let b = stub_task(&mut kcb, Priority::Normal);
        let counts = run_passes(&mut kcb, 1000);
        let a_count = counts.iter().find(|(s, _)| *s == a).unwrap().1 as i64;
        let b_count = counts.iter().find(|(s, _)| *s == b).unwrap().1 as i64;
        assert!((a_count - b_count).abs() <= 1, "{a_count} vs {b_count}");
    }

    #[test]
    fn blocked_tasks_are_skipped() {
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Low);
        let b = stub_task(&mut kcb, Priority::Normal);
        kcb.tasks[b].state = TaskState::Blocked;
        assert_eq!(select_ready(&mut kcb), a);
    }

    #[test]
    fn rt_tasks_are_skipped_by_round_robin() {
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Crit);
        let b = stub_task(&mut kcb, Priority::Low);
        kcb.tasks[a].rt_prio = Some(7);
        assert_eq!(select_ready(&mut kcb), b);
    }

    #[test]
    fn rt_hook_overrides_round_robin() {
        fn hook(view: RtView<'_>) -> Option<TaskId> {
            view.tasks().find(|t| t.rt_prio == Some(7) && t.ready).map(|t| t.id)
        }
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Idle);
        let _b = stub_task(&mut kcb, Priority::Crit);
        kcb.tasks[a].rt_prio = Some(7);
        kcb.rt_sched = Some(hook);
        assert_eq!(select_ready(&mut kcb), a);
    }

    #[test]
    fn delay_aging_releases_at_zero() {
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Normal);
        kcb.tasks[a].state = TaskState::Blocked;
        kcb.tasks[a].delay = 3;
        for _ in 0..2 {
            age_delays(&mut kcb);
            assert_eq!(kcb.tasks[a].state, TaskState::Blocked);
        }
        age_delays(&mut kcb);
        assert_eq!(kcb.tasks[a].state, TaskState::Ready);
        assert_eq!(kcb.tasks[a].delay, 0);
    }

    #[test]
    #[should_panic]
    fn nothing_ready_is_fatal() {
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Normal);
        kcb.tasks[a].state = TaskState::Blocked;
        select_ready(&mut kcb);
    }

    #[test]
    fn hint_is_used_when_still_ready() {
        let mut kcb = Kcb::new();
        let a = stub_task(&mut kcb, Priority::Crit);
        let b = stub_task(&mut kcb, Priority::Crit);
        // First pass starts at slot 0 and selects `a` (CRIT is eligible on
        // the first visit).
        assert_eq!(select_ready(&mut kcb), a);
        kcb.tasks[a].state = TaskState::Ready;
        // The hint points at `a`, so the next walk starts there again.
        assert_eq!(select_ready(&mut kcb), a);
        kcb.tasks[a].state = TaskState::Blocked;
        kcb.current = Some(a);
        assert_eq!(select_ready(&mut kcb), b);
    }
}
