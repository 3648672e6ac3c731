use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A clock for tracking time.
#[derive(Debug, Clone)]
pub struct Clock {
    start: Instant,
    time: TimeSource,
}

impl Clock {
    /// Create a new system clock.
    ///
    /// The system clock will start with the current system time.
    pub fn system() -> Self {
        Self {
            start: Instant::now(),
            time: TimeSource::System,
        }
    }

    /// Create a new simulated clock.
    ///
    /// The simulated clock will start with frozen time.
    /// Time can be advanced by calling [`Clock::advance`].
    pub fn simulated() -> Self {
        Self {
            start: Instant::now(),
            time: TimeSource::Simulated {
                offset: Rc::new(Cell::new(Duration::from_secs(0))),
            },
        }
    }

    /// Returns true if this clock only moves through [`Clock::advance`].
    pub fn is_simulated(&self) -> bool {
        matches!(self.time, TimeSource::Simulated { .. })
    }

    /// Convert a duration into a number of ticks, rounding up so a delayed
    /// callback never fires early.
    pub(crate) fn duration_to_ticks(&self, d: Duration) -> u64 {
        let ms = d.as_micros().div_ceil(1000);
        ms.try_into().unwrap_or(u64::MAX)
    }

    /// Convert a tick to a duration value.
    pub(crate) fn tick_to_duration(&self, t: u64) -> Duration {
        Duration::from_millis(t)
    }

    /// Return the current tick.
    pub(crate) fn tick(&self) -> u64 {
        let elapsed = self.now().saturating_duration_since(self.start);
        elapsed.as_millis().try_into().unwrap_or(u64::MAX)
    }

    /// Return the current instant.
    pub fn now(&self) -> Instant {
        match &self.time {
            TimeSource::System => Instant::now(),
            TimeSource::Simulated { offset } => self.start + offset.get(),
        }
    }

    /// Advance simulated time.
    ///
    /// ### Panics
    /// Panics if called on a system clock created with [`Clock::system`].
    pub fn advance(&self, duration: Duration) {
        match &self.time {
            TimeSource::System => panic!("Cannot advance system clock"),
            TimeSource::Simulated { offset } => {
                offset.set(offset.get() + duration);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum TimeSource {
    System,
    Simulated { offset: Rc<Cell<Duration>> },
}
