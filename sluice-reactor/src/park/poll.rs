use std::io;
use std::thread;
use std::time::Duration;

use super::{poll_fds, Park, ParkMode, Readiness};

/// A [`Park`] implementation which blocks the thread in `poll(2)`.
///
/// With no descriptors registered, a timed park sleeps the thread and an
/// untimed park returns immediately, since nothing could wake it.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollPark;

impl PollPark {
    /// Create a new [`PollPark`].
    pub fn new() -> Self {
        Self
    }
}

impl Park for PollPark {
    fn park(&mut self, io: &mut [Readiness], mode: ParkMode) -> io::Result<()> {
        match mode {
            ParkMode::NoPark if io.is_empty() => Ok(()),
            ParkMode::NoPark => poll_fds(io, Some(Duration::ZERO)).map(drop),
            ParkMode::NextCompletion if io.is_empty() => Ok(()),
            ParkMode::NextCompletion => poll_fds(io, None).map(drop),
            ParkMode::Timeout(d) if io.is_empty() => {
                thread::sleep(d);
                Ok(())
            }
            ParkMode::Timeout(d) => poll_fds(io, Some(d)).map(drop),
        }
    }
}
