//! Semaphore scenarios: FIFO handoff, token conservation, contention.
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock};

use teal_kernel::{task, Error, Semaphore};

mod fifo_wakeup {
    use super::*;

    static SEM: OnceLock<Semaphore> = OnceLock::new();
    static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
    static FINAL_COUNT: AtomicI32 = AtomicI32::new(-1);

    fn waiter_body(tag: u32) {
        SEM.get().unwrap().wait().unwrap();
        ORDER.lock().unwrap().push(tag);
    }

    fn w1() {
        waiter_body(1);
    }
    fn w2() {
        waiter_body(2);
    }
    fn w3() {
        waiter_body(3);
    }

    fn control() {
        let sem = *SEM.get().unwrap();
        // Let the three waiters block, in spawn order.
        task::delay(20);
        for _ in 0..3 {
            sem.signal().unwrap();
        }
        task::delay(20);
        FINAL_COUNT.store(sem.value(), Ordering::SeqCst);
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        SEM.set(Semaphore::new(0, 8).unwrap()).unwrap();
        task::spawn(w1, 4096);
        task::spawn(w2, 4096);
        task::spawn(w3, 4096);
        task::spawn(control, 4096);
        true
    }

    /// Three waiters block in order; three signals wake them in the same
    /// order, and every token was consumed by a handoff.
    #[test]
    fn three_signals_wake_three_waiters_in_order() {
        teal_port_std::run(app);
        assert_eq!(*ORDER.lock().unwrap(), [1, 2, 3]);
        assert_eq!(FINAL_COUNT.load(Ordering::SeqCst), 0);
    }
}

mod no_lost_wakeup {
    use super::*;

    static SEM: OnceLock<Semaphore> = OnceLock::new();
    static WOKE: AtomicBool = AtomicBool::new(false);

    fn waiter() {
        SEM.get().unwrap().wait().unwrap();
        WOKE.store(true, Ordering::SeqCst);
        teal_kernel::shutdown();
    }

    fn control() {
        // Strictly after the waiter blocked.
        task::delay(10);
        SEM.get().unwrap().signal().unwrap();
        loop {
            task::yield_now();
        }
    }

    fn app() -> bool {
        SEM.set(Semaphore::new(0, 4).unwrap()).unwrap();
        task::spawn(waiter, 4096);
        task::spawn(control, 4096);
        true
    }

    #[test]
    fn a_signal_after_a_wait_always_lands() {
        teal_port_std::run(app);
        assert!(WOKE.load(Ordering::SeqCst));
    }
}

mod try_wait {
    use super::*;

    fn control() {
        let sem = Semaphore::new(2, 4).unwrap();
        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.try_wait(), Ok(()));
        assert_eq!(sem.try_wait(), Err(Error::TaskBusy));
        assert_eq!(sem.value(), 0);
        sem.signal().unwrap();
        assert_eq!(sem.value(), 1);
        sem.destroy().unwrap();
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        task::spawn(control, 4096);
        true
    }

    #[test]
    fn try_wait_never_blocks() {
        teal_port_std::run(app);
    }
}

mod token_conservation {
    use super::*;

    static SEM: OnceLock<Semaphore> = OnceLock::new();
    static HELD: AtomicI32 = AtomicI32::new(0);
    static VIOLATION: AtomicBool = AtomicBool::new(false);

    fn worker_body() {
        let sem = *SEM.get().unwrap();
        for _ in 0..50 {
            sem.wait().unwrap();
            let held = HELD.fetch_add(1, Ordering::SeqCst) + 1;
            // Initialized to 2: at most two holders at once.
            if held > 2 {
                VIOLATION.store(true, Ordering::SeqCst);
            }
            task::yield_now();
            HELD.fetch_sub(1, Ordering::SeqCst);
            sem.signal().unwrap();
        }
    }

    fn wa() {
        worker_body();
    }
    fn wb() {
        worker_body();
    }
    fn wc() {
        worker_body();
    }

    fn control() {
        task::delay(200);
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        SEM.set(Semaphore::new(2, 8).unwrap()).unwrap();
        task::spawn(wa, 4096);
        task::spawn(wb, 4096);
        task::spawn(wc, 4096);
        task::spawn(control, 4096);
        true
    }

    /// With an initial count of 2, `count + holders` never exceeds 2.
    #[test]
    fn tokens_are_conserved_under_contention() {
        teal_port_std::run(app);
        assert!(!VIOLATION.load(Ordering::SeqCst));
    }
}

mod suspended_waiter {
    use super::*;

    static SEM: OnceLock<Semaphore> = OnceLock::new();
    static WOKE: AtomicBool = AtomicBool::new(false);

    fn waiter() {
        SEM.get().unwrap().wait().unwrap();
        WOKE.store(true, Ordering::SeqCst);
    }

    fn control() {
        let sem = *SEM.get().unwrap();
        let waiter_id = task::find(waiter).unwrap();
        task::delay(10);
        // Suspend the blocked waiter, then signal: the wakeup is latched.
        task::suspend(waiter_id).unwrap();
        sem.signal().unwrap();
        task::delay(10);
        assert!(!WOKE.load(Ordering::SeqCst));
        // Lifting the suspension completes the latched wakeup.
        task::resume(waiter_id).unwrap();
        task::delay(10);
        assert!(WOKE.load(Ordering::SeqCst));
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        SEM.set(Semaphore::new(0, 4).unwrap()).unwrap();
        task::spawn(waiter, 4096);
        task::spawn(control, 4096);
        true
    }

    #[test]
    fn a_wakeup_during_suspension_is_latched_until_resume() {
        teal_port_std::run(app);
        assert!(WOKE.load(Ordering::SeqCst));
    }
}
