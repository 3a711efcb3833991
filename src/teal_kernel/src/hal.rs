//! The port (HAL) contract
//!
//! Everything architecture-specific lives behind [`Port`]: interrupt
//! masking, context creation and switching, the tick source and the
//! diagnostic halt path. The kernel is written against this trait only; a
//! bare-metal target supplies an implementation built on its trap trampoline
//! and timer hardware, while `teal_port_std` supplies a hosted simulation
//! for development and testing.
//!
//! The port calls back into the kernel through three entry points:
//!
//!  - [`crate::timer_tick`] - the trap entry for the tick interrupt.
//!  - [`crate::task_entry_hook`] - runs at the very start of a task's first
//!    dispatch, before the entry function; releases the CPU lock that was
//!    transferred across the context switch and leaves interrupts enabled.
//!  - [`crate::task_exit_hook`] - runs when a task's entry function
//!    returns; removes the task and dispatches the next one.
use core::cell::UnsafeCell;

/// Opaque handle to a port-defined saved execution context.
///
/// The kernel stores one per task and passes it back to the port verbatim;
/// it never inspects the value. For a bare-metal port this is typically a
/// pointer to a register save area; the hosted port uses it as a key into
/// its thread table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortContext(usize);

impl PortContext {
    /// Wrap a raw port-defined value.
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw port-defined value.
    #[inline]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// Saved interrupt state, returned by [`Port::irq_save`] and consumed by
/// [`Port::irq_restore`].
///
/// Bit 0 is the interrupt-enable bit; the remaining bits are free for the
/// port's use. The kernel materializes `IrqToken::ENABLED` when it releases
/// a lock acquisition that was handed over from another context (first task
/// dispatch), because tasks always run with interrupts enabled outside of
/// critical sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqToken(pub u32);

impl IrqToken {
    /// The state "interrupts enabled".
    pub const ENABLED: Self = Self(1);
}

/// The contract between the kernel and the platform.
///
/// # Safety
///
/// An implementation must uphold all of the following:
///
///  - `irq_save`/`irq_restore` really mask the tick interrupt: between a
///    save and the matching restore, [`crate::timer_tick`] is never invoked.
///  - `context_switch` returns only when the saved context is dispatched
///    again, and the CPU lock state at that moment is "held" (the switching
///    protocol transfers the lock to the resumed context).
///  - `context_init` seeds a context that, when first dispatched, invokes
///    [`crate::task_entry_hook`], then the entry function, then
///    [`crate::task_exit_hook`], on a stack whose pointer is 16-byte aligned
///    and leaves the top [`crate::task::ISR_RED_ZONE`] bytes untouched as a
///    red zone for trap frames.
///  - `dispatch_first` and `exit_and_dispatch` never return and discard the
///    calling context.
pub unsafe trait Port: Sync {
    /// Bring up the platform: diagnostic output and the tick source.
    fn hardware_init(&'static self);

    /// Low-power wait until an interrupt is pending, then service it.
    /// Called outside of critical sections only.
    fn cpu_idle(&'static self);

    /// Unrecoverable halt. Interrupts are left disabled.
    fn halt(&'static self) -> !;

    /// Orderly shutdown of the machine. A bare-metal port may treat this
    /// the same as [`halt`](Port::halt); the hosted port uses it to end the
    /// simulation cleanly.
    fn system_off(&'static self) -> ! {
        self.halt()
    }

    /// Mask interrupts and return the previous state.
    fn irq_save(&'static self) -> IrqToken;

    /// Restore a previously saved interrupt state. If this enables
    /// interrupts, any tick that was pended while they were masked is taken
    /// before the function returns.
    fn irq_restore(&'static self, token: IrqToken);

    /// Seed a fresh context for a task.
    ///
    /// # Safety
    ///
    /// `stack_base .. stack_base + stack_len` must be a live allocation
    /// owned by the task for as long as the context exists.
    unsafe fn context_init(
        &'static self,
        stack_base: *mut u8,
        stack_len: usize,
        entry: fn(),
    ) -> PortContext;

    /// Release a context that will never be dispatched again.
    ///
    /// # Safety
    ///
    /// `ctx` must originate from [`context_init`](Port::context_init) on
    /// this port and must not be the running context.
    unsafe fn context_destroy(&'static self, ctx: PortContext);

    /// Save the calling context into `save` and resume `resume`. Returns
    /// when `save` is dispatched again.
    ///
    /// # Safety
    ///
    /// Must be called with the CPU lock held; the lock is transferred to
    /// the resumed context (hand-over-hand release).
    unsafe fn context_switch(&'static self, save: PortContext, resume: PortContext);

    /// Launch the first task. The calling (boot) context is discarded.
    ///
    /// # Safety
    ///
    /// Must be called with the CPU lock held, exactly once, at the end of
    /// the boot sequence.
    unsafe fn dispatch_first(&'static self, resume: PortContext) -> !;

    /// Resume `resume` and discard the calling context (task exit path).
    ///
    /// # Safety
    ///
    /// Must be called with the CPU lock held; the lock is transferred to
    /// the resumed context. The calling task's stack and context handle
    /// must already have been detached from the kernel.
    unsafe fn exit_and_dispatch(&'static self, resume: PortContext) -> !;

    /// Microseconds since boot.
    fn read_us(&'static self) -> u64;

    /// Nominal tick frequency in Hz.
    fn tick_hz(&'static self) -> u32;

    /// Start delivering tick interrupts.
    fn timer_enable(&'static self);

    /// Stop delivering tick interrupts.
    fn timer_disable(&'static self);
}

struct PortCell(UnsafeCell<Option<&'static dyn Port>>);

// Safety: the cell is written exactly once by `install`, during single-
// threaded boot, before any other context can observe it (task contexts are
// first dispatched strictly after `install`, and dispatch synchronizes).
unsafe impl Sync for PortCell {}

static PORT: PortCell = PortCell(UnsafeCell::new(None));

/// Install the port. Called once by [`crate::start`] before anything else
/// touches kernel state.
pub(crate) fn install(port: &'static dyn Port) {
    // Safety: single-threaded boot; see `PortCell`.
    unsafe { *PORT.0.get() = Some(port) };
}

/// The installed port.
pub(crate) fn port() -> &'static dyn Port {
    // Safety: read-only after `install`; see `PortCell`.
    match unsafe { *PORT.0.get() } {
        Some(port) => port,
        None => panic!("kernel is not booted"),
    }
}
