//! Tick-counted software timers.
//!
//! The control loop advances a free running `u32` tick counter once per millisecond. Timers only
//! remember the tick they were started on, so the counter is allowed to wrap.

/// Raw tick count. One tick is one millisecond.
pub type Ticks = u32;

/// Duration expressed at the control tick rate.
pub type TickDuration = fugit::MillisDurationU32;

/// Ticks per second of the control loop.
pub const TICK_RATE_HZ: u32 = 1_000;

/// Convert a duration into control ticks.
#[inline]
pub const fn ticks(duration: TickDuration) -> Ticks {
    duration.ticks()
}

/// Countdown measured against the control tick counter.
///
/// Once the interval has run out the timer stays "over" until it is started again, even if the
/// tick counter wraps in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftTimer {
    interval: Ticks,
    start: Ticks,
    over: bool,
}

impl SoftTimer {
    /// Create a timer with the given interval, started at `now`.
    ///
    /// A zero interval timer is over from the start.
    pub const fn new(interval: Ticks, now: Ticks) -> Self {
        Self {
            interval,
            start: now,
            over: interval == 0,
        }
    }

    /// Restart with the current interval.
    pub fn start(&mut self, now: Ticks) {
        self.start = now;
        self.over = false;
    }

    /// Restart with a new interval.
    pub fn start_with(&mut self, now: Ticks, interval: Ticks) {
        self.interval = interval;
        self.start = now;
        self.over = interval == 0;
    }

    /// Make the timer appear to have just run out.
    pub fn force(&mut self, now: Ticks) {
        self.start = now.wrapping_sub(self.interval);
    }

    /// Configured interval.
    pub fn interval(&self) -> Ticks {
        self.interval
    }

    /// Whether the interval has run out since the last start.
    pub fn is_over(&mut self, now: Ticks) -> bool {
        if now.wrapping_sub(self.start) >= self.interval {
            self.over = true;
        }
        self.over
    }

    /// Edge version of [`Self::is_over`]: true only on the first poll after running out.
    pub fn fired(&mut self, now: Ticks) -> bool {
        let was_over = self.over;
        !was_over && self.is_over(now)
    }
}
