//! Counting semaphores
//!
//! The wakeup protocol is token-passing: when `signal` finds a waiter, the
//! count is *not* incremented - the would-be token is handed directly to
//! the dequeued task, which resumes from `wait` already owning it. Between
//! the signal and that resumption no third party can steal the token
//! (`try_wait` refuses whenever waiters exist). On every `signal`, either
//! the count is incremented or a waiter is woken, never both.
use crate::error::{fatal, Error};
use crate::klock;
use crate::state::Kcb;
use crate::task::{self, TaskId};
use crate::wait::{self, WaitQueue};

/// Ceiling at which the semaphore count saturates.
pub const SEM_MAX_COUNT: i32 = i32::MAX;

/// *Semaphore control block* - the state data of a semaphore.
pub(crate) struct SemCb {
    pub(crate) gen: u16,
    pub(crate) count: i32,
    pub(crate) waiters: WaitQueue,
}

/// Handle to a counting semaphore.
///
/// Handles are generation-checked: using one after `destroy` is an
/// invariant breach and halts the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    slot: u16,
    gen: u16,
}

impl Kcb {
    fn sem_cb(&mut self, sem: Semaphore) -> &mut SemCb {
        match self.semaphores.get_mut(sem.slot as usize) {
            Some(cb) if cb.gen == sem.gen => cb,
            _ => fatal(Error::Unknown, "operation on an invalid semaphore"),
        }
    }

    pub(crate) fn sem_create(&mut self, initial: i32, max_waiters: u16) -> Result<Semaphore, Error> {
        if !(0..=SEM_MAX_COUNT).contains(&initial) || max_waiters == 0 {
            return Err(Error::SemOperation);
        }
        let gen = self.alloc_gen();
        let slot = self.semaphores.insert(SemCb {
            gen,
            count: initial,
            waiters: WaitQueue::bounded(max_waiters),
        });
        Ok(Semaphore {
            slot: slot as u16,
            gen,
        })
    }

    /// The acquisition half of `wait`. Returns `true` when the token was
    /// taken on the fast path; `false` means the caller was enqueued and
    /// must block. Wait-set overflow on a validated semaphore is fatal.
    pub(crate) fn sem_wait_prepare(&mut self, sem: Semaphore, me: TaskId) -> bool {
        let cb = self.sem_cb(sem);
        if cb.count > 0 && cb.waiters.is_empty() {
            cb.count -= 1;
            return true;
        }
        if cb.waiters.push(me).is_err() {
            fatal(Error::SemOperation, "semaphore wait set overflow");
        }
        false
    }

    /// Take a token only if one is available *and* no task is queued ahead
    /// of the caller.
    pub(crate) fn sem_try_wait(&mut self, sem: Semaphore) -> Result<(), Error> {
        let cb = self.sem_cb(sem);
        if cb.count > 0 && cb.waiters.is_empty() {
            cb.count -= 1;
            Ok(())
        } else {
            Err(Error::TaskBusy)
        }
    }

    /// The release protocol. Returns the woken task, if any.
    pub(crate) fn sem_signal(&mut self, sem: Semaphore) -> Option<TaskId> {
        let woke = {
            let cb = self.sem_cb(sem);
            match cb.waiters.pop() {
                Some(tid) => Some(tid),
                None => {
                    // No waiter: deposit the token, saturating at the
                    // ceiling.
                    if cb.count < SEM_MAX_COUNT {
                        cb.count += 1;
                    }
                    None
                }
            }
        };
        if let Some(tid) = woke {
            wait::wake_task(self, tid);
        }
        woke
    }

    pub(crate) fn sem_destroy(&mut self, sem: Semaphore) -> Result<(), Error> {
        if !self.sem_cb(sem).waiters.is_empty() {
            return Err(Error::SemOperation);
        }
        self.semaphores.remove(sem.slot as usize);
        Ok(())
    }
}

impl Semaphore {
    /// Create a semaphore with the given initial count and waiter bound.
    pub fn new(initial: i32, max_waiters: u16) -> Result<Self, Error> {
        let mut guard = klock::lock();
        guard.sem_create(initial, max_waiters)
    }

    /// Acquire a token, blocking in FIFO order until one is handed over.
    pub fn wait(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.expect_task_context()?;
        let me = match guard.current_tid() {
            Some(me) => me,
            None => return Err(Error::Fail),
        };
        if guard.sem_wait_prepare(self, me) {
            return Ok(());
        }
        wait::block_current_and_reschedule(guard);
        // The signaler handed us the token before waking us.
        Ok(())
    }

    /// Acquire a token without blocking. Fails with [`Error::TaskBusy`] if
    /// none is available or other tasks are already waiting.
    pub fn try_wait(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.sem_try_wait(self)
    }

    /// Release a token: wake the oldest waiter (handing it the token
    /// directly) or increment the count.
    ///
    /// Safe to call from a timer callback; the post-wakeup yield is then
    /// suppressed and the woken task runs at the tick's dispatch.
    pub fn signal(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        let woke = guard.sem_signal(self);
        let should_yield = woke.is_some() && guard.expect_task_context().is_ok();
        drop(guard);
        if should_yield {
            task::yield_now();
        }
        Ok(())
    }

    /// The current count.
    pub fn value(self) -> i32 {
        let mut guard = klock::lock();
        guard.sem_cb(self).count
    }

    /// Destroy the semaphore. Fails with [`Error::SemOperation`] while
    /// tasks are waiting on it.
    pub fn destroy(self) -> Result<(), Error> {
        let mut guard = klock::lock();
        guard.sem_destroy(self)
    }
}
