use std::io;
use std::time::Duration;

use super::{poll_fds, Park, ParkMode, Readiness};
use crate::Clock;

/// A [`Park`] implementation for simulated time.
///
/// Timed parks never block. When nothing is ready the clock is advanced
/// by the requested timeout instead, so timers fire as soon as the
/// reactor has no other work to do.
#[derive(Debug, Clone)]
pub struct SimPark {
    clock: Clock,
}

impl SimPark {
    /// Create a new [`SimPark`] which advances `clock`.
    ///
    /// ### Panics
    /// Panics if `clock` is not a simulated clock.
    pub fn new(clock: Clock) -> Self {
        assert!(clock.is_simulated(), "SimPark requires a simulated clock");
        Self { clock }
    }
}

impl Park for SimPark {
    fn park(&mut self, io: &mut [Readiness], mode: ParkMode) -> io::Result<()> {
        match mode {
            ParkMode::NoPark | ParkMode::NextCompletion if io.is_empty() => Ok(()),
            ParkMode::NoPark => poll_fds(io, Some(Duration::ZERO)).map(drop),
            ParkMode::NextCompletion => poll_fds(io, None).map(drop),
            ParkMode::Timeout(d) => {
                let ready = if io.is_empty() {
                    0
                } else {
                    poll_fds(io, Some(Duration::ZERO))?
                };
                if ready == 0 {
                    self.clock.advance(d);
                }
                Ok(())
            }
        }
    }
}
