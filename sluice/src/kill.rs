//! Cancellation shared across threads.
//!
//! A [`Stream`](crate::Stream) is single-threaded, but a thread blocked in
//! [`Stream::wait`](crate::Stream::wait) cannot kill it. The stream's kill
//! flag therefore lives in a [`KillSignal`] which a [`KillHandle`] can set
//! from another thread. Transports that block on a descriptor arm the
//! signal with it, and a kill shuts the descriptor down so every poller on
//! it wakes.
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

const LOG: &str = "sluice::kill";

/// The kill flag of a stream, plus the descriptor to shut down on kill.
#[derive(Debug, Default)]
pub struct KillSignal {
    killed: AtomicBool,
    fd: Mutex<Option<RawFd>>,
}

impl KillSignal {
    /// Create a signal which is not killed and has no descriptor armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the signal has been killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Set the kill flag and shut down the armed descriptor.
    ///
    /// Returns true for the first kill.
    pub fn kill(&self) -> bool {
        let first = !self.killed.swap(true, Ordering::AcqRel);
        let fd = self.lock();
        if let Some(fd) = *fd {
            shutdown(fd);
        }
        first
    }

    /// Shut `fd` down when the signal is killed.
    ///
    /// If the signal was killed already, `fd` is shut down at once.
    pub fn arm(&self, fd: RawFd) {
        let mut slot = self.lock();
        *slot = Some(fd);
        if self.is_killed() {
            shutdown(fd);
        }
    }

    /// Forget the armed descriptor, running `close` under the same lock.
    ///
    /// Closing inside `close` guarantees a concurrent kill never shuts down
    /// a descriptor number that has already been reused.
    pub fn disarm<T>(&self, close: impl FnOnce() -> T) -> T {
        let mut slot = self.lock();
        *slot = None;
        close()
    }

    fn lock(&self) -> MutexGuard<'_, Option<RawFd>> {
        self.fd.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn shutdown(fd: RawFd) {
    // Safety: the descriptor is armed, so it stays open while the lock is held.
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
    if rc < 0 {
        debug!(
            target: LOG,
            "kill.shutdown fd={} {}",
            fd,
            std::io::Error::last_os_error()
        );
    } else {
        trace!(target: LOG, "kill.shutdown fd={}", fd);
    }
}

/// Kills a [`Stream`](crate::Stream) from any thread.
///
/// Obtained from [`Stream::kill_handle`](crate::Stream::kill_handle). The
/// stream observes the kill at its next completion, exactly as if
/// [`Stream::kill`](crate::Stream::kill) had been called on its own
/// thread. Socket transports are shut down immediately, which wakes a
/// blocked [`Stream::wait`](crate::Stream::wait) or reactor.
#[derive(Debug, Clone)]
pub struct KillHandle {
    signal: Arc<KillSignal>,
}

impl KillHandle {
    pub(crate) fn new(signal: Arc<KillSignal>) -> Self {
        Self { signal }
    }

    /// Kill the stream.
    pub fn kill(&self) {
        if self.signal.kill() {
            trace!(target: LOG, "kill.remote");
        }
    }

    /// Returns true once the stream has been killed.
    pub fn is_killed(&self) -> bool {
        self.signal.is_killed()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::thread;

    use super::*;

    #[test]
    fn first_kill_only() {
        let signal = KillSignal::new();
        assert!(!signal.is_killed());
        assert!(signal.kill());
        assert!(!signal.kill());
        assert!(signal.is_killed());
    }

    #[test]
    fn kill_shuts_down_armed_descriptor() {
        let (a, _b) = UnixStream::pair().unwrap();
        let signal = Arc::new(KillSignal::new());
        signal.arm(a.as_raw_fd());

        let handle = KillHandle::new(signal.clone());
        let killer = thread::spawn(move || handle.kill());
        let mut buf = [0u8; 1];
        // Blocks until the shutdown, then reads end of stream.
        assert_eq!((&a).read(&mut buf).unwrap(), 0);
        killer.join().unwrap();
        assert!(signal.is_killed());
        signal.disarm(|| drop(a));
    }

    #[test]
    fn arm_after_kill_shuts_down_at_once() {
        let (a, _b) = UnixStream::pair().unwrap();
        let signal = KillSignal::new();
        signal.kill();
        signal.arm(a.as_raw_fd());
        let mut buf = [0u8; 1];
        assert_eq!((&a).read(&mut buf).unwrap(), 0);
    }
}
