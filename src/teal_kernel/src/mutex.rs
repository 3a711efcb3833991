//! Mutexes
//!
//! Non-recursive ownership with direct handoff: `unlock` assigns the mutex
//! to the oldest waiter in the same critical section that releases it, so
//! ownership is never observable as free while a waiter exists. A timed
//! acquisition keeps its FIFO position while polling the tick counter
//! between yields; on timeout it removes itself from the wait set under
//! the lock.
use crate::error::{fatal, Error};
use crate::klock;
use crate::state::Kcb;
use crate::task::{self, TaskId};
use crate::time;
use crate::wait::{self, WaitQueue};

/// *Mutex control block* - the state data of a mutex.
pub(crate) struct MutexCb {
    pub(crate) gen: u16,
    /// Raw id of the owning task; 0 means free.
    pub(crate) owner: u16,
    pub(crate) waiters: WaitQueue,
}

/// Outcome of one acquisition attempt.
pub(crate) enum PollLock {
    /// The caller now owns the mutex.
    Acquired,
    /// The caller already owned it (non-recursive re-lock).
    AlreadyOwner,
    /// The mutex is owned by someone else; the caller is queued.
    Waiting,
}

/// Handle to a mutex. Generation-checked like all object handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex {
    slot: u16,
    gen: u16,
}

impl Kcb {
    fn mutex_cb(&mut self, m: Mutex) -> &mut MutexCb {
        match self.mutexes.get_mut(m.slot as usize) {
            Some(cb) if cb.gen == m.gen => cb,
            _ => fatal(Error::Unknown, "operation on an invalid mutex"),
        }
    }

    pub(crate) fn mutex_create(&mut self) -> Mutex {
        let gen = self.alloc_gen();
        let slot = self.mutexes.insert(MutexCb {
            gen,
            owner: 0,
            waiters: WaitQueue::unbounded(),
        });
        Mutex {
            slot: slot as u16,
            gen,
        }
    }

    /// One acquisition attempt by `me`. `queued` tells whether `me` already
    /// holds a FIFO position from an earlier attempt; an unlock handoff
    /// that happened in the meantime shows up as `owner == me`.
    pub(crate) fn mutex_poll_lock(&mut self, m: Mutex, me: TaskId, queued: bool) -> PollLock {
        let cb = self.mutex_cb(m);
        if cb.owner == me.as_u16() {
            if queued {
                PollLock::Acquired
            } else {
                PollLock::AlreadyOwner
            }
        } else if cb.owner == 0 {
            cb.owner = me.as_u16();
            if queued {
                cb.waiters.remove(me);
            }
            PollLock::Acquired
        } else {
            if !queued {
                // Unbounded queue; cannot fail.
                let _ = cb.waiters.push(me);
            }
            PollLock::Waiting
        }
    }

    /// Release by `me`, handing ownership to the oldest waiter if any.
    /// Returns the task that received ownership.
    pub(crate) fn mutex_unlock(&mut self, m: Mutex, me: TaskId) -> Result<Option<TaskId>, Error> {
        let woke = {
            let cb = self.mutex_cb(m);
            if cb.owner != me.as_u16() {
                return Err(Error::NotOwner);
            }
            match cb.waiters.pop() {
                Some(next) => {
                    cb.owner = next.as_u16();
                    Some(next)
                }
                None => {
                    cb.owner = 0;
                    None
                }
            }
        };
        if let Some(next) = woke {
            wait::wake_task(self, next);
        }
        Ok(woke)
    }

    pub(crate) fn mutex_owner(&mut self, m: Mutex) -> u16 {
        self.mutex_cb(m).owner
    }

    pub(crate) fn mutex_destroy(&mut self, m: Mutex) -> Result<(), Error> {
        let cb = self.mutex_cb(m);
        if cb.owner != 0 || !cb.waiters.is_empty() {
            return Err(Error::TaskBusy);
        }
        self.mutexes.remove(m.slot as usize);
        Ok(())
    }
}

impl Mutex {
    /// Create a mutex.
    pub fn new() -> Result<Self, Error> {
        let mut guard = klock::lock();
        Ok(guard.mutex_create())
    }

    /// Acquire the mutex, blocking in FIFO order.
    ///
    /// Re-locking by the current owner fails with [`Error::TaskBusy`]
    /// (non-recursive).
    pub fn lock(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.expect_task_context()?;
        let me = match guard.current_tid() {
            Some(me) => me,
            None => return Err(Error::Fail),
        };
        match guard.mutex_poll_lock(self, me, false) {
            PollLock::Acquired => Ok(()),
            PollLock::AlreadyOwner => Err(Error::TaskBusy),
            PollLock::Waiting => {
                wait::block_current_and_reschedule(guard);
                // Unlock handed ownership over before waking us.
                Ok(())
            }
        }
    }

    /// Acquire the mutex, giving up after `ticks` timer ticks.
    ///
    /// The caller keeps its FIFO position while polling, so an unlock
    /// during the window still hands over in arrival order.
    pub fn lock_timeout(self, ticks: u32) -> Result<(), Error> {
        let start = time::ticks();
        let mut queued = false;
        loop {
            let mut guard = klock::lock();
            guard.expect_task_context()?;
            let me = match guard.current_tid() {
                Some(me) => me,
                None => return Err(Error::Fail),
            };
            match guard.mutex_poll_lock(self, me, queued) {
                PollLock::Acquired => return Ok(()),
                PollLock::AlreadyOwner => return Err(Error::TaskBusy),
                PollLock::Waiting => {
                    queued = true;
                    if time::ticks().wrapping_sub(start) >= ticks {
                        guard.mutex_cb(self).waiters.remove(me);
                        return Err(Error::Timeout);
                    }
                }
            }
            drop(guard);
            task::yield_now();
        }
    }

    /// Release the mutex. Fails with [`Error::NotOwner`] unless the caller
    /// owns it.
    pub fn unlock(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        let me = match guard.current_tid() {
            Some(me) => me,
            None => return Err(Error::NotOwner),
        };
        guard.mutex_unlock(self, me)?;
        Ok(())
    }

    /// The current owner.
    pub fn owner(self) -> Option<TaskId> {
        let mut guard = klock::lock();
        match guard.mutex_owner(self) {
            0 => None,
            raw => Some(TaskId::from_raw(raw)),
        }
    }

    /// Destroy the mutex. Fails with [`Error::TaskBusy`] while owned or
    /// contended.
    pub fn destroy(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.mutex_destroy(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskState};
    use crate::test_util::stub_task;

    #[test]
    fn free_mutex_is_acquired_immediately() {
        let mut kcb = Kcb::new();
        let m = kcb.mutex_create();
        let (_, t1) = stub_task(&mut kcb, Priority::Normal);
        assert!(matches!(kcb.mutex_poll_lock(m, t1, false), PollLock::Acquired));
        assert_eq!(kcb.mutex_owner(m), t1.as_u16());
    }

    #[test]
    fn relock_by_owner_is_rejected() {
        let mut kcb = Kcb::new();
        let m = kcb.mutex_create();
        let (_, t1) = stub_task(&mut kcb, Priority::Normal);
        assert!(matches!(kcb.mutex_poll_lock(m, t1, false), PollLock::Acquired));
        assert!(matches!(
            kcb.mutex_poll_lock(m, t1, false),
            PollLock::AlreadyOwner
        ));
    }

    #[test]
    fn unlock_hands_ownership_to_the_oldest_waiter() {
        let mut kcb = Kcb::new();
        let m = kcb.mutex_create();
        let (_, t1) = stub_task(&mut kcb, Priority::Normal);
        let (s2, t2) = stub_task(&mut kcb, Priority::Normal);
        let (s3, t3) = stub_task(&mut kcb, Priority::Normal);
        assert!(matches!(kcb.mutex_poll_lock(m, t1, false), PollLock::Acquired));
        assert!(matches!(kcb.mutex_poll_lock(m, t2, false), PollLock::Waiting));
        assert!(matches!(kcb.mutex_poll_lock(m, t3, false), PollLock::Waiting));
        kcb.tasks[s2].state = TaskState::Blocked;
        kcb.tasks[s3].state = TaskState::Blocked;

        assert_eq!(kcb.mutex_unlock(m, t1).unwrap(), Some(t2));
        assert_eq!(kcb.mutex_owner(m), t2.as_u16());
        assert_eq!(kcb.tasks[s2].state, TaskState::Ready);
        assert_eq!(kcb.tasks[s3].state, TaskState::Blocked);
    }

    #[test]
    fn unlock_by_non_owner_is_rejected() {
        let mut kcb = Kcb::new();
        let m = kcb.mutex_create();
        let (_, t1) = stub_task(&mut kcb, Priority::Normal);
        let (_, t2) = stub_task(&mut kcb, Priority::Normal);
        assert!(matches!(kcb.mutex_poll_lock(m, t1, false), PollLock::Acquired));
        assert_eq!(kcb.mutex_unlock(m, t2), Err(Error::NotOwner));
    }

    #[test]
    fn timed_poller_receives_handoff() {
        let mut kcb = Kcb::new();
        let m = kcb.mutex_create();
        let (_, t1) = stub_task(&mut kcb, Priority::Normal);
        let (_, t2) = stub_task(&mut kcb, Priority::Normal);
        assert!(matches!(kcb.mutex_poll_lock(m, t1, false), PollLock::Acquired));
        assert!(matches!(kcb.mutex_poll_lock(m, t2, false), PollLock::Waiting));
        // t2 stays Ready (it is polling); the unlock still hands over.
        assert_eq!(kcb.mutex_unlock(m, t1).unwrap(), Some(t2));
        assert!(matches!(kcb.mutex_poll_lock(m, t2, true), PollLock::Acquired));
        assert_eq!(kcb.mutex_owner(m), t2.as_u16());
    }

    #[test]
    fn destroy_refuses_while_owned() {
        let mut kcb = Kcb::new();
        let m = kcb.mutex_create();
        let (_, t1) = stub_task(&mut kcb, Priority::Normal);
        assert!(matches!(kcb.mutex_poll_lock(m, t1, false), PollLock::Acquired));
        assert_eq!(kcb.mutex_destroy(m), Err(Error::TaskBusy));
        assert_eq!(kcb.mutex_unlock(m, t1).unwrap(), None);
        assert_eq!(kcb.mutex_destroy(m), Ok(()));
    }
}
