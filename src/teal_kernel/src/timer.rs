//! Software timers
//!
//! Timers live in a master arena (monotonic ids) and, while armed, on an
//! active list ordered by absolute deadline, earliest first. The tick trap
//! entry drains at most [`MAX_FIRES_PER_TICK`] expired entries per tick to
//! bound interrupt latency, then invokes the collected callbacks.
//!
//! Callbacks run in interrupt context: they must not block, and blocking
//! primitives refuse with [`Error::Fail`] while a tick is being serviced.
//! An AUTORELOAD timer re-arms relative to the firing moment; a ONESHOT
//! timer becomes DISABLED after firing.
use arrayvec::ArrayVec;

use crate::error::{fatal, Error};
use crate::hal;
use crate::klock;
use crate::state::Kcb;
use crate::time;

/// Most timer expirations serviced in a single tick.
pub(crate) const MAX_FIRES_PER_TICK: usize = 8;

/// A timer callback. Runs in interrupt context with the tick being
/// serviced; it must be non-blocking and must not yield.
pub type TimerCallback = fn(usize);

/// Timer operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    /// Not armed.
    Disabled,
    /// Fires once, then disables itself.
    OneShot,
    /// Re-arms itself after every expiry, relative to the firing moment.
    AutoReload,
}

/// Unique timer identifier, assigned monotonically from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u16);

impl TimerId {
    /// The raw id value.
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// *Timer control block* - an entry of the master list.
pub(crate) struct TimerCb {
    pub(crate) id: u16,
    pub(crate) callback: TimerCallback,
    pub(crate) arg: usize,
    pub(crate) period_ms: u32,
    pub(crate) deadline: u32,
    pub(crate) mode: TimerMode,
}

/// An entry of the deadline-ordered active list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerDeadline {
    pub(crate) deadline: u32,
    pub(crate) id: u16,
}

impl Kcb {
    fn timer_slot_by_id(&self, id: u16) -> Option<usize> {
        self.timers
            .iter()
            .find(|(_, t)| t.id == id)
            .map(|(slot, _)| slot)
    }

    fn alloc_timer_id(&mut self) -> u16 {
        loop {
            let id = self.next_timer_id;
            self.next_timer_id = self.next_timer_id.checked_add(1).unwrap_or(1);
            if id != 0 && self.timer_slot_by_id(id).is_none() {
                return id;
            }
        }
    }

    pub(crate) fn timer_create(
        &mut self,
        callback: TimerCallback,
        arg: usize,
        period_ms: u32,
    ) -> Result<TimerId, Error> {
        if period_ms == 0 {
            return Err(Error::Fail);
        }
        let id = self.alloc_timer_id();
        self.timers.insert(TimerCb {
            id,
            callback,
            arg,
            period_ms,
            deadline: 0,
            mode: TimerMode::Disabled,
        });
        Ok(TimerId(id))
    }

    /// Arm a timer. The deadline is `now + period` (in ticks, rounded up).
    pub(crate) fn timer_start(
        &mut self,
        id: TimerId,
        mode: TimerMode,
        now: u32,
        tick_hz: u32,
    ) -> Result<(), Error> {
        if mode == TimerMode::Disabled {
            return Err(Error::Fail);
        }
        let slot = self.timer_slot_by_id(id.0).ok_or(Error::TaskNotFound)?;
        let deadline = now.wrapping_add(time::ms_to_ticks_at(self.timers[slot].period_ms, tick_hz));
        let t = &mut self.timers[slot];
        t.mode = mode;
        t.deadline = deadline;
        self.timer_activate(id.0, deadline, now);
        Ok(())
    }

    /// Disarm a timer, leaving it in the master list.
    pub(crate) fn timer_cancel(&mut self, id: TimerId) -> Result<(), Error> {
        let slot = self.timer_slot_by_id(id.0).ok_or(Error::TaskNotFound)?;
        self.timers[slot].mode = TimerMode::Disabled;
        self.timer_deactivate(id.0);
        Ok(())
    }

    /// Remove a timer entirely.
    pub(crate) fn timer_destroy(&mut self, id: TimerId) -> Result<(), Error> {
        let slot = self.timer_slot_by_id(id.0).ok_or(Error::TaskNotFound)?;
        self.timer_deactivate(id.0);
        self.timers.remove(slot);
        Ok(())
    }

    /// Insert into the active list, keeping it ordered by deadline
    /// (relative to `now`, so tick wrap-around sorts correctly). An
    /// existing entry for the same timer is replaced.
    pub(crate) fn timer_activate(&mut self, id: u16, deadline: u32, now: u32) {
        self.timer_deactivate(id);
        let key = deadline.wrapping_sub(now);
        let pos = self
            .timer_active
            .iter()
            .position(|e| key < e.deadline.wrapping_sub(now))
            .unwrap_or(self.timer_active.len());
        self.timer_active.insert(pos, TimerDeadline { deadline, id });
    }

    pub(crate) fn timer_deactivate(&mut self, id: u16) {
        self.timer_active.retain(|e| e.id != id);
    }
}

/// Pop expired entries from the head of the active list, at most
/// [`MAX_FIRES_PER_TICK`] per tick. Called from the tick trap entry with
/// the CPU lock held.
pub(crate) fn collect_expired(kcb: &mut Kcb, now: u32) -> ArrayVec<u16, MAX_FIRES_PER_TICK> {
    let mut expired = ArrayVec::new();
    while expired.len() < MAX_FIRES_PER_TICK {
        match kcb.timer_active.first() {
            Some(head) if now.wrapping_sub(head.deadline) < u32::MAX / 2 => {
                expired.push(kcb.timer_active.remove(0).id);
            }
            _ => break,
        }
    }
    expired
}

/// Invoke the collected callbacks, then re-arm AUTORELOAD timers relative
/// to the firing moment and disable ONESHOT ones. Runs without the CPU
/// lock held (the IN_TICK flag marks interrupt context); a callback may
/// cancel, restart or destroy any timer, including its own.
pub(crate) fn fire(expired: &[u16], now: u32) {
    for &id in expired {
        let target = {
            let guard = klock::lock();
            guard
                .timer_slot_by_id(id)
                .map(|slot| (guard.timers[slot].callback, guard.timers[slot].arg))
        };
        let (callback, arg) = match target {
            Some(target) => target,
            // Destroyed by an earlier callback in this batch.
            None => continue,
        };
        log::trace!("timer {id} fired at tick {now}");
        callback(arg);

        let mut guard = klock::lock();
        let tick_hz = hal::port().tick_hz();
        if let Some(slot) = guard.timer_slot_by_id(id) {
            match guard.timers[slot].mode {
                TimerMode::AutoReload => {
                    let deadline = now
                        .wrapping_add(time::ms_to_ticks_at(guard.timers[slot].period_ms, tick_hz));
                    guard.timers[slot].deadline = deadline;
                    guard.timer_activate(id, deadline, now);
                }
                TimerMode::OneShot => {
                    guard.timers[slot].mode = TimerMode::Disabled;
                    guard.timer_deactivate(id);
                }
                TimerMode::Disabled => {}
            }
        }
    }
}

/// Create a software timer with the given callback, callback argument and
/// period in milliseconds. The timer starts out DISABLED.
pub fn create(callback: TimerCallback, arg: usize, period_ms: u32) -> Result<TimerId, Error> {
    let mut guard = klock::lock();
    guard.timer_create(callback, arg, period_ms)
}

/// Arm a timer in ONESHOT or AUTORELOAD mode. Restarting an armed timer
/// recomputes its deadline from now.
pub fn start(id: TimerId, mode: TimerMode) -> Result<(), Error> {
    let tick_hz = hal::port().tick_hz();
    let mut guard = klock::lock();
    guard.timer_start(id, mode, time::ticks(), tick_hz)
}

/// Disarm a timer without destroying it.
pub fn cancel(id: TimerId) -> Result<(), Error> {
    let mut guard = klock::lock();
    guard.timer_cancel(id)
}

/// Remove a timer entirely.
pub fn destroy(id: TimerId) -> Result<(), Error> {
    let mut guard = klock::lock();
    guard.timer_destroy(id)
}
