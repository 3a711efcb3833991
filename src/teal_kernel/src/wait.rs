//! Wait sets and the blocking protocol
//!
//! Every blocking synchronization object owns a [`WaitQueue`]: a strict
//! FIFO of task ids. A Blocked task is on exactly one wait set (or is
//! sleeping with a delay - never both), and wakeups transfer the waited-for
//! token directly to the awakened task, so there is no window in which a
//! token is unowned.
//!
//! The block-then-switch sequence is made atomic by performing the enqueue
//! and the state change inside one critical section and then calling
//! [`crate::sched::reschedule`], which keeps the CPU-lock guard alive
//! across the context switch (see [`crate::klock`]).
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::error::{fatal, Error};
use crate::klock;
use crate::sched;
use crate::state::Kcb;
use crate::task::{TaskId, TaskState};

/// The wait queue is full.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct QueueFull;

/// A FIFO wait set of task ids, optionally capacity-bounded.
pub(crate) struct WaitQueue {
    waiters: VecDeque<TaskId>,
    cap: usize,
}

impl WaitQueue {
    /// An unbounded wait set (mutexes, condition variables).
    pub(crate) fn unbounded() -> Self {
        Self {
            waiters: VecDeque::new(),
            cap: usize::MAX,
        }
    }

    /// A capacity-bounded wait set (semaphores).
    pub(crate) fn bounded(cap: u16) -> Self {
        Self {
            waiters: VecDeque::with_capacity(cap as usize),
            cap: cap as usize,
        }
    }

    /// Append a waiter; fails when the bound is reached.
    pub(crate) fn push(&mut self, tid: TaskId) -> Result<(), QueueFull> {
        if self.waiters.len() >= self.cap {
            return Err(QueueFull);
        }
        self.waiters.push_back(tid);
        Ok(())
    }

    /// Dequeue the oldest waiter.
    pub(crate) fn pop(&mut self) -> Option<TaskId> {
        self.waiters.pop_front()
    }

    /// Remove a specific waiter (timed-wait timeout, cancellation).
    pub(crate) fn remove(&mut self, tid: TaskId) -> bool {
        match self.waiters.iter().position(|&t| t == tid) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, tid: TaskId) -> bool {
        self.waiters.contains(&tid)
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Complete a wakeup for a dequeued waiter.
///
/// A Blocked task becomes Ready (inheriting the token its wake-upper
/// passed). A task that was suspended while waiting latches the wakeup for
/// [`crate::task::resume`]. A Ready/Running task is a timed poller whose
/// removal from the queue is itself the signal. Anything else means the
/// state machine desynchronized.
pub(crate) fn wake_task(kcb: &mut Kcb, tid: TaskId) {
    let slot = match kcb.slot_of(tid) {
        Some(slot) => slot,
        None => fatal(Error::Unknown, "wakeup for a nonexistent task"),
    };
    let tcb = &mut kcb.tasks[slot];
    match tcb.state {
        TaskState::Blocked => {
            tcb.delay = 0;
            tcb.state = TaskState::Ready;
            log::trace!("task {} woken", tid.as_u16());
        }
        TaskState::Suspended => {
            tcb.pending_wake = true;
            log::trace!("task {} wakeup latched while suspended", tid.as_u16());
        }
        TaskState::Ready | TaskState::Running => {}
        TaskState::Stopped => fatal(Error::Unknown, "wakeup for a stopped task"),
    }
}

/// Transition the current task to Blocked and switch away. Returns when
/// the task is dispatched again. The caller has already put the task on a
/// wait set inside the same critical section.
pub(crate) fn block_current_and_reschedule(mut guard: klock::CpuLockGuard) {
    let cur = match guard.current {
        Some(cur) => cur,
        None => fatal(Error::Unknown, "blocking without a running task"),
    };
    guard.tasks[cur].state = TaskState::Blocked;
    sched::reschedule(guard);
}

/// Remove a task from every wait set and abandon any mutexes it owns,
/// handing them to their next waiters. Used by cancellation and exit.
pub(crate) fn purge_task(kcb: &mut Kcb, tid: TaskId) {
    for (_, cb) in kcb.semaphores.iter_mut() {
        cb.waiters.remove(tid);
    }
    for (_, cb) in kcb.condvars.iter_mut() {
        cb.waiters.remove(tid);
    }
    let mut handoffs: Vec<TaskId> = Vec::new();
    for (_, cb) in kcb.mutexes.iter_mut() {
        cb.waiters.remove(tid);
        if cb.owner == tid.as_u16() {
            match cb.waiters.pop() {
                Some(next) => {
                    cb.owner = next.as_u16();
                    handoffs.push(next);
                }
                None => cb.owner = 0,
            }
        }
    }
    for next in handoffs {
        wake_task(kcb, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(raw: u16) -> TaskId {
        TaskId::from_raw(raw)
    }

    #[test]
    fn fifo_order() {
        let mut q = WaitQueue::unbounded();
        for raw in 1..=4 {
            q.push(tid(raw)).unwrap();
        }
        for raw in 1..=4 {
            assert_eq!(q.pop(), Some(tid(raw)));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn bounded_queue_rejects_overflow() {
        let mut q = WaitQueue::bounded(2);
        q.push(tid(1)).unwrap();
        q.push(tid(2)).unwrap();
        assert_eq!(q.push(tid(3)), Err(QueueFull));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn remove_keeps_relative_order() {
        let mut q = WaitQueue::unbounded();
        for raw in 1..=3 {
            q.push(tid(raw)).unwrap();
        }
        assert!(q.remove(tid(2)));
        assert!(!q.remove(tid(2)));
        assert_eq!(q.pop(), Some(tid(1)));
        assert_eq!(q.pop(), Some(tid(3)));
    }
}
