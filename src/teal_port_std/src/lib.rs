//! Simulation environment for running the teal kernel on a hosted machine
//!
//! Task contexts are backed by parked OS threads gated one at a time, so
//! exactly one simulated CPU exists (see [`threading`]). A timer loop on
//! the boot thread pends tick interrupts at a constant nominal rate - each
//! deadline is computed relative to the previous one, not the current
//! time, so latency does not skew the tick frequency. Pended ticks are
//! recognized when interrupts are enabled: at critical-section exits and
//! in `cpu_idle`. A compute-bound task therefore defers the tick handler
//! until its next kernel entry; every kernel suspension point is a
//! delivery point.
//!
//! [`run`] boots a kernel around an `app_main`, waits for
//! [`teal_kernel::shutdown`], and propagates any task panic to the caller,
//! so assertion failures inside tasks fail the enclosing test.
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Condvar, Mutex as StdMutex, Once};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use slab::Slab;
use spin::Mutex as SpinMutex;
use teal_kernel::{IrqToken, Port, PortContext};

mod threading;
use threading::{plock, Gate, TaskCtx};

/// Harness options.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Nominal tick frequency of the simulated timer hardware.
    pub tick_hz: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self { tick_hz: 1000 }
    }
}

/// Payload of the silent unwind that retires a simulated context's thread
/// (task exit, machine power-off). Never reported as a failure.
struct ThreadRetired;

enum ExitEvent {
    Shutdown,
    Panic(Box<dyn Any + Send>),
}

thread_local! {
    /// Registry key of the context backed by this thread.
    static CURRENT_CTX: std::cell::Cell<Option<usize>> = std::cell::Cell::new(None);
    /// Set while this thread is delivering pended ticks, to keep the
    /// delivery loop from nesting through `irq_restore`.
    static IN_DELIVERY: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

/// The simulated machine.
pub struct StdPort {
    irq_enabled: AtomicBool,
    pending_ticks: AtomicU32,
    timer_enabled: AtomicBool,
    shutdown: AtomicBool,
    tick_hz: AtomicU32,
    contexts: SpinMutex<Slab<TaskCtx>>,
    idle: StdMutex<()>,
    idle_cv: Condvar,
    epoch: StdMutex<Option<Instant>>,
    exit_tx: StdMutex<Option<mpsc::Sender<ExitEvent>>>,
}

static PORT: Lazy<StdPort> = Lazy::new(StdPort::new);
static RUN_LOCK: StdMutex<()> = StdMutex::new(());
static PANIC_HOOK: Once = Once::new();

impl StdPort {
    fn new() -> Self {
        Self {
            irq_enabled: AtomicBool::new(true),
            pending_ticks: AtomicU32::new(0),
            timer_enabled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            tick_hz: AtomicU32::new(1000),
            contexts: SpinMutex::new(Slab::new()),
            idle: StdMutex::new(()),
            idle_cv: Condvar::new(),
            epoch: StdMutex::new(None),
            exit_tx: StdMutex::new(None),
        }
    }

    /// Prepare the machine for a fresh boot. Contexts leaked by a previous
    /// run keep their own gate references and stay parked forever.
    fn reset(&self, options: Options, tx: mpsc::Sender<ExitEvent>) {
        self.shutdown.store(false, Ordering::SeqCst);
        self.pending_ticks.store(0, Ordering::SeqCst);
        self.irq_enabled.store(true, Ordering::SeqCst);
        self.timer_enabled.store(false, Ordering::SeqCst);
        self.tick_hz.store(options.tick_hz.max(1), Ordering::SeqCst);
        self.contexts.lock().clear();
        *plock(&self.epoch) = Some(Instant::now());
        *plock(&self.exit_tx) = Some(tx);
    }

    fn gate_of(&self, ctx: PortContext) -> std::sync::Arc<Gate> {
        match self.contexts.lock().get(ctx.as_raw()) {
            Some(entry) => entry.gate.clone(),
            None => panic!("dispatch of an unknown context {ctx:?}"),
        }
    }

    fn send_exit(&self, event: ExitEvent) {
        if let Some(tx) = plock(&self.exit_tx).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Terminal handler for a simulated thread's unwind: retirement is
    /// silent; anything else stops the machine and is reported to `run`.
    fn handle_unwind(&self, payload: Box<dyn Any + Send>) {
        if payload.downcast_ref::<ThreadRetired>().is_some() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        self.idle_cv.notify_all();
        self.send_exit(ExitEvent::Panic(payload));
    }

    /// Take one pended tick, if any.
    fn take_pending(&self) -> bool {
        self.pending_ticks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Deliver pended ticks while interrupts are enabled. The calling
    /// thread may be switched away inside `timer_tick` and resumes here
    /// when dispatched again.
    fn drain_pending(&'static self) {
        if IN_DELIVERY.with(|f| f.get()) {
            return;
        }
        IN_DELIVERY.with(|f| f.set(true));
        while self.irq_enabled.load(Ordering::SeqCst)
            && !self.shutdown.load(Ordering::SeqCst)
            && self.take_pending()
        {
            teal_kernel::timer_tick();
        }
        IN_DELIVERY.with(|f| f.set(false));
    }

    /// The tick source: pend one interrupt per nominal period, each
    /// deadline computed relative to the previous one.
    fn pump_ticks(&'static self) {
        let period = Duration::from_nanos(1_000_000_000 / self.tick_hz.load(Ordering::SeqCst) as u64);
        let mut next_at = Instant::now() + period;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let now = Instant::now();
            if next_at > now {
                std::thread::sleep(next_at - now);
            }
            next_at += period;
            if self.timer_enabled.load(Ordering::SeqCst) {
                self.pending_ticks.fetch_add(1, Ordering::SeqCst);
                self.idle_cv.notify_all();
            }
        }
    }
}

// Safety: exactly one gate is open at any moment, so kernel entry points
// are only exercised by the single running thread; `irq_save`/`irq_restore`
// gate `timer_tick` delivery on the interrupt-enable flag; contexts are
// dispatched exactly once per park.
unsafe impl Port for StdPort {
    fn hardware_init(&'static self) {
        log::debug!("port: hardware init (tick {} Hz)", self.tick_hz.load(Ordering::SeqCst));
    }

    fn cpu_idle(&'static self) {
        {
            let mut parked = plock(&self.idle);
            loop {
                if self.shutdown.load(Ordering::SeqCst) {
                    drop(parked);
                    // The machine is off; retire this thread.
                    std::panic::panic_any(ThreadRetired);
                }
                if self.pending_ticks.load(Ordering::SeqCst) > 0 {
                    break;
                }
                parked = self
                    .idle_cv
                    .wait(parked)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        self.drain_pending();
    }

    fn halt(&'static self) -> ! {
        // Stop tick delivery for good: the unwind below releases critical
        // sections as it goes, and no interrupt may land in the wreckage.
        self.shutdown.store(true, Ordering::SeqCst);
        self.irq_enabled.store(false, Ordering::SeqCst);
        self.idle_cv.notify_all();
        panic!("kernel halted");
    }

    fn system_off(&'static self) -> ! {
        self.shutdown.store(true, Ordering::SeqCst);
        self.idle_cv.notify_all();
        self.send_exit(ExitEvent::Shutdown);
        std::panic::panic_any(ThreadRetired)
    }

    fn irq_save(&'static self) -> IrqToken {
        IrqToken(self.irq_enabled.swap(false, Ordering::SeqCst) as u32)
    }

    fn irq_restore(&'static self, token: IrqToken) {
        let enable = token.0 & 1 != 0;
        self.irq_enabled.store(enable, Ordering::SeqCst);
        if enable {
            // Interrupts pended while masked are taken here, like hardware
            // raising the line the moment it is unmasked.
            self.drain_pending();
        }
    }

    unsafe fn context_init(
        &'static self,
        _stack_base: *mut u8,
        _stack_len: usize,
        entry: fn(),
    ) -> PortContext {
        let gate = Gate::new();
        let key = self.contexts.lock().insert(TaskCtx { gate: gate.clone() });
        std::thread::Builder::new()
            .name(format!("teal-task-{key}"))
            .spawn(move || {
                CURRENT_CTX.with(|c| c.set(Some(key)));
                gate.wait();
                teal_kernel::task_entry_hook();
                match catch_unwind(AssertUnwindSafe(entry)) {
                    Ok(()) => {
                        // The entry function fell off the end; let the
                        // kernel retire the task and dispatch onward.
                        if let Err(payload) =
                            catch_unwind(AssertUnwindSafe(|| teal_kernel::task_exit_hook()))
                        {
                            PORT.handle_unwind(payload);
                        }
                    }
                    Err(payload) => PORT.handle_unwind(payload),
                }
            })
            .expect("failed to spawn a context thread");
        PortContext::from_raw(key)
    }

    unsafe fn context_destroy(&'static self, ctx: PortContext) {
        let mut contexts = self.contexts.lock();
        if contexts.contains(ctx.as_raw()) {
            // The backing thread, if it ever ran, stays parked on its own
            // gate reference and is reclaimed with the process.
            contexts.remove(ctx.as_raw());
        }
    }

    unsafe fn context_switch(&'static self, save: PortContext, resume: PortContext) {
        let save_gate = self.gate_of(save);
        let resume_gate = self.gate_of(resume);
        resume_gate.open();
        save_gate.wait();
    }

    unsafe fn dispatch_first(&'static self, resume: PortContext) -> ! {
        self.gate_of(resume).open();
        // The boot context is discarded; its thread becomes the tick
        // source until the machine is switched off.
        self.pump_ticks();
        std::panic::panic_any(ThreadRetired)
    }

    unsafe fn exit_and_dispatch(&'static self, resume: PortContext) -> ! {
        if let Some(key) = CURRENT_CTX.with(|c| c.take()) {
            let mut contexts = self.contexts.lock();
            if contexts.contains(key) {
                contexts.remove(key);
            }
        }
        self.gate_of(resume).open();
        std::panic::panic_any(ThreadRetired)
    }

    fn read_us(&'static self) -> u64 {
        let epoch = plock(&self.epoch);
        match *epoch {
            Some(epoch) => epoch.elapsed().as_micros() as u64,
            None => 0,
        }
    }

    fn tick_hz(&'static self) -> u32 {
        self.tick_hz.load(Ordering::SeqCst)
    }

    fn timer_enable(&'static self) {
        self.timer_enabled.store(true, Ordering::SeqCst);
    }

    fn timer_disable(&'static self) {
        self.timer_enabled.store(false, Ordering::SeqCst);
    }
}

/// Boot a simulated machine around `app_main` and run it to shutdown.
///
/// Returns when a task calls [`teal_kernel::shutdown`]. A panic on any
/// task (including failed assertions) is re-raised on the calling thread.
/// Machines run one at a time per process; concurrent callers serialize.
pub fn run(app_main: fn() -> bool) {
    run_with(Options::default(), app_main)
}

/// [`run`] with explicit [`Options`].
pub fn run_with(options: Options, app_main: fn() -> bool) {
    let _serial = plock(&RUN_LOCK);
    let _ = env_logger::builder().is_test(true).try_init();
    PANIC_HOOK.call_once(|| {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            // Context retirement unwinds are part of normal operation.
            if info.payload().downcast_ref::<ThreadRetired>().is_none() {
                default_hook(info);
            }
        }));
    });

    let (tx, rx) = mpsc::channel();
    PORT.reset(options, tx);

    let machine = std::thread::Builder::new()
        .name("teal-machine".into())
        .spawn(move || {
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| teal_kernel::start(&*PORT, app_main)))
            {
                PORT.handle_unwind(payload);
            }
        })
        .expect("failed to spawn the machine thread");

    let event = rx
        .recv()
        .expect("the machine stopped without reporting an exit");
    // Stop the tick source and wait the boot thread out; task threads that
    // are still parked are leaked by design.
    PORT.shutdown.store(true, Ordering::SeqCst);
    PORT.idle_cv.notify_all();
    let _ = machine.join();

    match event {
        ExitEvent::Shutdown => {}
        ExitEvent::Panic(payload) => resume_unwind(payload),
    }
}
