//! Software timer scenarios.
use std::sync::atomic::{AtomicU32, Ordering};

use teal_kernel::{task, timer, TimerMode};

mod autoreload {
    use super::*;

    static FIRES: AtomicU32 = AtomicU32::new(0);

    fn on_fire(_arg: usize) {
        FIRES.fetch_add(1, Ordering::SeqCst);
    }

    fn control() {
        let id = timer::create(on_fire, 0, 50).unwrap();
        timer::start(id, TimerMode::AutoReload).unwrap();
        // 500 ms of tick time at a 50 ms period.
        task::delay(500);
        let fires = FIRES.load(Ordering::SeqCst);
        assert!(
            (9..=11).contains(&fires),
            "autoreload fired {fires} times in 500 ticks"
        );
        timer::cancel(id).unwrap();
        let frozen = FIRES.load(Ordering::SeqCst);
        task::delay(120);
        assert_eq!(FIRES.load(Ordering::SeqCst), frozen);
        timer::destroy(id).unwrap();
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        task::spawn(control, 4096);
        true
    }

    /// A 50 ms AUTORELOAD timer fires ~10 times in 500 ms and re-arms
    /// relative to each firing moment.
    #[test]
    fn autoreload_fires_at_its_period() {
        teal_port_std::run(app);
    }
}

mod oneshot {
    use super::*;

    static FIRES: AtomicU32 = AtomicU32::new(0);
    static FIRED_AT: AtomicU32 = AtomicU32::new(0);

    fn on_fire(arg: usize) {
        FIRES.fetch_add(1, Ordering::SeqCst);
        FIRED_AT.store(teal_kernel::ticks(), Ordering::SeqCst);
        assert_eq!(arg, 0xA5);
    }

    fn control() {
        let id = timer::create(on_fire, 0xA5, 100).unwrap();
        let started_at = teal_kernel::ticks();
        timer::start(id, TimerMode::OneShot).unwrap();
        // Not yet: the deadline is 100 ticks out.
        task::delay(60);
        assert_eq!(FIRES.load(Ordering::SeqCst), 0);
        task::delay(80);
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
        // Fired no earlier than its deadline, and only once.
        let fired_at = FIRED_AT.load(Ordering::SeqCst);
        assert!(
            fired_at.wrapping_sub(started_at) >= 100,
            "fired after {} ticks",
            fired_at.wrapping_sub(started_at)
        );
        task::delay(150);
        assert_eq!(FIRES.load(Ordering::SeqCst), 1);
        timer::destroy(id).unwrap();
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        task::spawn(control, 4096);
        true
    }

    #[test]
    fn oneshot_fires_once_and_never_early() {
        teal_port_std::run(app);
    }
}

mod wakeup_from_callback {
    use super::*;
    use std::sync::OnceLock;
    use teal_kernel::Semaphore;

    static SEM: OnceLock<Semaphore> = OnceLock::new();
    static WOKEN_AT: AtomicU32 = AtomicU32::new(0);

    fn on_fire(_arg: usize) {
        // Runs in interrupt context; signaling is allowed, blocking is not.
        SEM.get().unwrap().signal().unwrap();
    }

    fn control() {
        SEM.set(Semaphore::new(0, 2).unwrap()).unwrap();
        let id = timer::create(on_fire, 0, 30).unwrap();
        timer::start(id, TimerMode::OneShot).unwrap();
        let before = teal_kernel::ticks();
        SEM.get().unwrap().wait().unwrap();
        WOKEN_AT.store(teal_kernel::ticks().wrapping_sub(before), Ordering::SeqCst);
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        task::spawn(control, 4096);
        true
    }

    /// A timer callback can signal a semaphore; the blocked task is woken
    /// at the tick's dispatch.
    #[test]
    fn a_callback_signal_wakes_a_blocked_task() {
        teal_port_std::run(app);
        let woken = WOKEN_AT.load(Ordering::SeqCst);
        assert!(woken >= 30, "woken after {woken} ticks");
        assert!(woken < 60, "woken after {woken} ticks");
    }
}

mod uptime {
    use super::*;

    fn control() {
        let t0 = teal_kernel::ticks();
        let up0 = teal_kernel::uptime_ms();
        task::delay(100);
        let dticks = teal_kernel::ticks().wrapping_sub(t0);
        let dms = teal_kernel::uptime_ms() - up0;
        assert!(dticks >= 100);
        // The microsecond clock advances with the ticks. (The exact ratio
        // is hostage to host scheduling; the nominal rate itself is pinned
        // by the pump's deadline-relative rearm.)
        assert!(dms >= 1, "only {dms} ms elapsed for {dticks} ticks");
        teal_kernel::shutdown();
    }

    fn app() -> bool {
        task::spawn(control, 4096);
        true
    }

    #[test]
    fn ticks_track_wall_time() {
        teal_port_std::run(app);
    }
}
