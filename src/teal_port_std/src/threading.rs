//! Thread-backed task contexts
//!
//! Each simulated context is an OS thread parked on a [`Gate`]. Exactly
//! one gate is open at any moment, so exactly one thread runs - the
//! simulated CPU. A context switch opens the target's gate and parks the
//! caller on its own; the open flag (rather than the wakeup itself)
//! carries the handoff, so an open that lands before the park is never
//! lost.
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Park/unpark gate for one simulated context.
pub(crate) struct Gate {
    runnable: Mutex<bool>,
    cv: Condvar,
}

/// Lock a mutex, tolerating poison: a panicking task thread must not take
/// the whole simulation down with it.
pub(crate) fn plock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Gate {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            runnable: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    /// Allow the owning thread to run.
    pub(crate) fn open(&self) {
        *plock(&self.runnable) = true;
        self.cv.notify_one();
    }

    /// Park until opened, consuming the open.
    pub(crate) fn wait(&self) {
        let mut runnable = plock(&self.runnable);
        while !*runnable {
            runnable = self
                .cv
                .wait(runnable)
                .unwrap_or_else(|e| e.into_inner());
        }
        *runnable = false;
    }
}

/// Registry entry for a live context.
pub(crate) struct TaskCtx {
    pub(crate) gate: Arc<Gate>,
}
