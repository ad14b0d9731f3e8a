//! Fixed-step tick source decoupling wall time from simulation time.
//!
//! The clock accumulates elapsed wall time and converts it into discrete tick
//! requests at a fixed cadence. On a slow consumer, pending ticks accumulate up to a
//! spiral-of-death cap; time beyond the cap is discarded so the runtime catches up
//! instead of falling further behind.
//!
//! The clock issues tick numbers monotonically and never rolls back; the rollback
//! engine keeps its own notion of the current simulation frame.

use web_time::{Duration, Instant};

/// Maximum number of ticks that may pile up before excess wall time is discarded.
pub const DEFAULT_MAX_PENDING_TICKS: u32 = 5;

/// A fixed-cadence tick source.
///
/// All time-dependent methods take `now` explicitly so callers (and tests) control
/// the time source.
#[derive(Debug)]
pub struct FixedStepClock {
    tick_interval: Duration,
    max_pending: u32,
    last_update: Option<Instant>,
    accumulator: Duration,
    /// Number of ticks issued so far; the next issued tick is this value.
    ticks_issued: u64,
}

impl FixedStepClock {
    /// Creates a clock ticking at `rate_hz` with the default pending-tick cap.
    #[must_use]
    pub fn new(rate_hz: u32) -> Self {
        Self::with_cap(rate_hz, DEFAULT_MAX_PENDING_TICKS)
    }

    /// Creates a clock ticking at `rate_hz`, discarding time once more than
    /// `max_pending` ticks are owed.
    #[must_use]
    pub fn with_cap(rate_hz: u32, max_pending: u32) -> Self {
        let rate = rate_hz.max(1);
        Self {
            tick_interval: Duration::from_nanos(1_000_000_000 / u64::from(rate)),
            max_pending: max_pending.max(1),
            last_update: None,
            accumulator: Duration::ZERO,
            ticks_issued: 0,
        }
    }

    /// The duration of one tick.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Number of ticks issued so far.
    #[must_use]
    pub fn ticks_issued(&self) -> u64 {
        self.ticks_issued
    }

    /// Accumulates wall time up to `now` and returns how many ticks are due,
    /// between 0 and the pending cap. The returned ticks are considered issued.
    pub fn try_advance(&mut self, now: Instant) -> u32 {
        if let Some(last) = self.last_update {
            // A paused or suspended process can hand us a huge gap; the cap below
            // turns that into at most `max_pending` ticks.
            self.accumulator += now.saturating_duration_since(last);
        }
        self.last_update = Some(now);

        let mut due = 0u32;
        while self.accumulator >= self.tick_interval && due < self.max_pending {
            self.accumulator -= self.tick_interval;
            due += 1;
        }
        if due == self.max_pending && self.accumulator >= self.tick_interval {
            // Spiral-of-death guard: drop the remainder rather than owing it.
            self.accumulator = Duration::ZERO;
        }
        self.ticks_issued += u64::from(due);
        due
    }

    /// Forgets accumulated time, e.g. after a migration pause, so the backlog of
    /// paused wall time does not burst into ticks on resume.
    pub fn reset_accumulator(&mut self, now: Instant) {
        self.accumulator = Duration::ZERO;
        self.last_update = Some(now);
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn clock_60hz() -> FixedStepClock {
        FixedStepClock::new(60)
    }

    #[test]
    fn first_update_issues_no_ticks() {
        let mut clock = clock_60hz();
        assert_eq!(clock.try_advance(Instant::now()), 0);
    }

    #[test]
    fn one_interval_yields_one_tick() {
        let mut clock = clock_60hz();
        let start = Instant::now();
        clock.try_advance(start);
        let ticks = clock.try_advance(start + clock.tick_interval());
        assert_eq!(ticks, 1);
        assert_eq!(clock.ticks_issued(), 1);
    }

    #[test]
    fn sub_interval_time_accumulates() {
        let mut clock = clock_60hz();
        let start = Instant::now();
        clock.try_advance(start);
        let half = clock.tick_interval() / 2;
        assert_eq!(clock.try_advance(start + half), 0);
        assert_eq!(clock.try_advance(start + half + half), 1);
    }

    #[test]
    fn slow_consumer_gets_multiple_ticks() {
        let mut clock = clock_60hz();
        let start = Instant::now();
        clock.try_advance(start);
        let ticks = clock.try_advance(start + clock.tick_interval() * 3);
        assert_eq!(ticks, 3);
    }

    #[test]
    fn pending_ticks_are_capped_and_excess_time_discarded() {
        let mut clock = FixedStepClock::with_cap(60, 5);
        let start = Instant::now();
        clock.try_advance(start);

        // 20 intervals behind; only the cap is issued.
        let late = start + clock.tick_interval() * 20;
        assert_eq!(clock.try_advance(late), 5);

        // The excess was discarded, not owed: the immediate next update is quiet.
        assert_eq!(clock.try_advance(late), 0);
    }

    #[test]
    fn reset_accumulator_swallows_pause_gap() {
        let mut clock = clock_60hz();
        let start = Instant::now();
        clock.try_advance(start);

        let after_pause = start + Duration::from_secs(10);
        clock.reset_accumulator(after_pause);
        assert_eq!(clock.try_advance(after_pause), 0);
        assert_eq!(clock.try_advance(after_pause + clock.tick_interval()), 1);
    }

    #[test]
    fn tick_numbers_are_monotonic() {
        let mut clock = clock_60hz();
        let start = Instant::now();
        clock.try_advance(start);
        let mut total = 0u64;
        for i in 1..=10u32 {
            total += u64::from(clock.try_advance(start + clock.tick_interval() * i));
        }
        assert_eq!(total, 10);
        assert_eq!(clock.ticks_issued(), 10);
    }
}
