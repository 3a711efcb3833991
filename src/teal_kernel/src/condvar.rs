//! Condition variables
//!
//! A condition variable is a FIFO wait set bound, per wait, to a mutex the
//! caller must own. `wait` enqueues the caller and releases the mutex
//! inside one critical section, then blocks; a woken task re-acquires the
//! mutex before returning. Signaling without holding the associated mutex
//! is permitted, but may wake a waiter that immediately contends for the
//! lock.
use crate::error::{fatal, Error};
use crate::klock;
use crate::mutex::Mutex;
use crate::state::Kcb;
use crate::task::{self, TaskId};
use crate::time;
use crate::wait::{self, WaitQueue};

/// *Condition variable control block*.
pub(crate) struct CondvarCb {
    pub(crate) gen: u16,
    pub(crate) waiters: WaitQueue,
}

/// Handle to a condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condvar {
    slot: u16,
    gen: u16,
}

impl Kcb {
    fn cond_cb(&mut self, c: Condvar) -> &mut CondvarCb {
        match self.condvars.get_mut(c.slot as usize) {
            Some(cb) if cb.gen == c.gen => cb,
            _ => fatal(Error::Unknown, "operation on an invalid condition variable"),
        }
    }

    pub(crate) fn cond_create(&mut self) -> Condvar {
        let gen = self.alloc_gen();
        let slot = self.condvars.insert(CondvarCb {
            gen,
            waiters: WaitQueue::unbounded(),
        });
        Condvar {
            slot: slot as u16,
            gen,
        }
    }

    /// Wake the oldest waiter. Returns its id.
    pub(crate) fn cond_signal(&mut self, c: Condvar) -> Option<TaskId> {
        let woke = self.cond_cb(c).waiters.pop();
        if let Some(tid) = woke {
            wait::wake_task(self, tid);
        }
        woke
    }

    /// Wake every waiter, in FIFO order. Returns how many were woken.
    pub(crate) fn cond_broadcast(&mut self, c: Condvar) -> usize {
        let mut count = 0;
        while let Some(tid) = self.cond_cb(c).waiters.pop() {
            wait::wake_task(self, tid);
            count += 1;
        }
        count
    }

    pub(crate) fn cond_destroy(&mut self, c: Condvar) -> Result<(), Error> {
        if !self.cond_cb(c).waiters.is_empty() {
            return Err(Error::TaskBusy);
        }
        self.condvars.remove(c.slot as usize);
        Ok(())
    }
}

impl Condvar {
    /// Create a condition variable.
    pub fn new() -> Result<Self, Error> {
        let mut guard = klock::lock();
        Ok(guard.cond_create())
    }

    /// Atomically enqueue on the condition variable and release `mutex`,
    /// then block until signaled. The mutex is re-acquired before
    /// returning.
    ///
    /// Fails with [`Error::NotOwner`] unless the caller owns `mutex`.
    pub fn wait(self, mutex: Mutex) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.expect_task_context()?;
        let me = match guard.current_tid() {
            Some(me) => me,
            None => return Err(Error::Fail),
        };
        if guard.mutex_owner(mutex) != me.as_u16() {
            return Err(Error::NotOwner);
        }
        // Unbounded queue; cannot fail.
        let _ = self_waiters(&mut guard, self).push(me);
        // Same critical section: the release (and a possible ownership
        // handoff) cannot be observed before we are on the wait set.
        guard.mutex_unlock(mutex, me)?;
        wait::block_current_and_reschedule(guard);
        mutex.lock()
    }

    /// Like [`wait`](Condvar::wait), giving up after `ticks` timer ticks.
    /// The mutex is re-acquired on both outcomes.
    pub fn wait_timeout(self, mutex: Mutex, ticks: u32) -> Result<(), Error> {
        let start = {
            let mut guard = klock::lock();
            guard.expect_task_context()?;
            let me = match guard.current_tid() {
                Some(me) => me,
                None => return Err(Error::Fail),
            };
            if guard.mutex_owner(mutex) != me.as_u16() {
                return Err(Error::NotOwner);
            }
            let _ = self_waiters(&mut guard, self).push(me);
            guard.mutex_unlock(mutex, me)?;
            time::ticks()
        };
        loop {
            task::yield_now();
            let mut guard = klock::lock();
            let me = match guard.current_tid() {
                Some(me) => me,
                None => return Err(Error::Fail),
            };
            // Removal from the wait set is the signal.
            if !self_waiters(&mut guard, self).contains(me) {
                drop(guard);
                break;
            }
            if time::ticks().wrapping_sub(start) >= ticks {
                self_waiters(&mut guard, self).remove(me);
                drop(guard);
                mutex.lock()?;
                return Err(Error::Timeout);
            }
        }
        mutex.lock()
    }

    /// Wake one waiter in FIFO order.
    pub fn signal(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.cond_signal(self);
        Ok(())
    }

    /// Wake all waiters.
    pub fn broadcast(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.cond_broadcast(self);
        Ok(())
    }

    /// Destroy the condition variable. Fails with [`Error::TaskBusy`]
    /// while tasks are waiting.
    pub fn destroy(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.cond_destroy(self)
    }
}

fn self_waiters(kcb: &mut Kcb, c: Condvar) -> &mut WaitQueue {
    &mut kcb.cond_cb(c).waiters
}
