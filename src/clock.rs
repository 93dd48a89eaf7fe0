//! Time support.
//!
//! The card protocol contains several bounded waits: card-ready polling,
//! data token polling, the operating-condition loop during
//! initialization, erase completion. The driver is handed a [`Clock`] at
//! construction and arms a [`Deadline`] for each wait, so tests can
//! simulate the passage of time without real delays.

use core::sync::atomic::{AtomicU32, Ordering};

/// A source of monotonic milliseconds.
pub trait Clock {
    /// Milliseconds since an arbitrary epoch, wrapping at `u32::MAX`.
    fn now_ms(&mut self) -> u32;
}

impl<T: Clock + ?Sized> Clock for &mut T {
    fn now_ms(&mut self) -> u32 {
        (**self).now_ms()
    }
}

/// A [`Clock`] fed by a periodic 1 ms tick.
///
/// For targets whose only time source is a timer interrupt: keep a
/// `static TickClock` and call [`tick`] from the handler, and hand the
/// driver a shared reference. The tick handler is the single writer and
/// must not call into the driver itself.
///
/// [`tick`]: TickClock::tick
#[derive(Debug, Default)]
pub struct TickClock {
    ticks: AtomicU32,
}

impl TickClock {
    /// A clock that has not ticked yet.
    pub const fn new() -> TickClock {
        TickClock {
            ticks: AtomicU32::new(0),
        }
    }

    /// Advance the clock by one millisecond.
    ///
    /// Plain load/store rather than read-modify-write, so it stays
    /// usable on cores without atomic CAS; single-writer only.
    pub fn tick(&self) {
        let now = self.ticks.load(Ordering::Relaxed);
        self.ticks.store(now.wrapping_add(1), Ordering::Relaxed);
    }
}

impl Clock for TickClock {
    fn now_ms(&mut self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }
}

impl Clock for &TickClock {
    fn now_ms(&mut self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }
}

/// A point in time a bounded wait must not run past.
pub(crate) struct Deadline {
    start: u32,
    budget_ms: u32,
}

impl Deadline {
    pub fn new<C: Clock>(clock: &mut C, budget_ms: u32) -> Deadline {
        Deadline {
            start: clock.now_ms(),
            budget_ms,
        }
    }

    /// Wrapping comparison, correct across the `u32::MAX` boundary.
    pub fn expired<C: Clock>(&self, clock: &mut C) -> bool {
        clock.now_ms().wrapping_sub(self.start) >= self.budget_ms
    }
}
