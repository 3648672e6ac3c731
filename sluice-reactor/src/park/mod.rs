//! Contains the [`Park`] trait.
//!
//! The [`Reactor`] uses a [`Park`] to delegate control of the thread
//! when there are no more callbacks ready to run. The park layer is
//! where the thread actually blocks: on file descriptor readiness,
//! on a timeout, or not at all.
//!
//! [`Reactor`]: crate::Reactor
use std::io;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::time::Duration;

use smallvec::SmallVec;

use crate::{Interest, TaskId};

mod poll;
mod sim;

pub use poll::PollPark;
pub use sim::SimPark;

/// Indicates under what conditions a [`Park`] operation
/// should return.
///
/// Note it is always valid to return from a [`Park`] operation
/// early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkMode {
    /// The [`Park`] operation should return immediately.
    NoPark,

    /// The [`Park`] operation should return once one of the
    /// registered descriptors becomes ready.
    NextCompletion,

    /// The [`Park`] operation should return before the
    /// specified duration has elapsed.
    Timeout(Duration),
}

/// One readiness registration handed to [`Park::park`].
///
/// The park layer reports readiness through [`Readiness::set_ready`].
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    id: TaskId,
    fd: RawFd,
    interest: Interest,
    ready: Interest,
}

impl Readiness {
    pub(crate) fn new(id: TaskId, fd: RawFd, interest: Interest) -> Self {
        Self {
            id,
            fd,
            interest,
            ready: Interest::empty(),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// The descriptor being watched.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The events the registration is waiting for.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// The events observed by the last park.
    pub fn ready(&self) -> Interest {
        self.ready
    }

    /// Record the events observed for this descriptor.
    ///
    /// Events outside of the registered interest are ignored.
    pub fn set_ready(&mut self, ready: Interest) {
        self.ready = ready & self.interest;
    }
}

/// The [`Park`] trait provides a way to share control flow
/// between the reactor and the layer that blocks the thread.
///
/// A [`ParkMode`] is passed to [`Park::park`] to indicate
/// under what conditions control flow must be passed back.
pub trait Park {
    /// Trigger a park operation, passing control to the park layer.
    ///
    /// Implementations must respect the [`ParkMode`] and record any
    /// observed readiness in `io`.
    fn park(&mut self, io: &mut [Readiness], mode: ParkMode) -> io::Result<()>;

    /// Shutdown the park layer.
    ///
    /// Callers should not park again after calling shutdown.
    fn shutdown(&mut self) {}
}

impl<P> Park for &mut P
where
    P: Park,
{
    fn park(&mut self, io: &mut [Readiness], mode: ParkMode) -> io::Result<()> {
        (**self).park(io, mode)
    }

    fn shutdown(&mut self) {
        (**self).shutdown()
    }
}

/// Poll the registered descriptors, blocking for at most `timeout`.
///
/// `None` blocks until a descriptor is ready. Returns the number of ready
/// descriptors; an interrupted poll reports zero.
pub(crate) fn poll_fds(io: &mut [Readiness], timeout: Option<Duration>) -> io::Result<usize> {
    let mut fds: SmallVec<[libc::pollfd; 8]> = io
        .iter()
        .map(|r| libc::pollfd {
            fd: r.fd,
            events: to_events(r.interest),
            revents: 0,
        })
        .collect();
    let timeout: c_int = match timeout {
        None => -1,
        Some(d) => d.as_micros().div_ceil(1000).min(c_int::MAX as u128) as c_int,
    };

    // Safety: `fds` is a valid, initialized slice of pollfd for the duration of the call.
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    for (r, fd) in io.iter_mut().zip(fds.iter()) {
        r.set_ready(from_revents(fd.revents, r.interest));
    }
    Ok(n as usize)
}

fn to_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events
}

fn from_revents(revents: libc::c_short, interest: Interest) -> Interest {
    // Errors and hangups wake every interest so the owner retries and
    // observes the failure from the syscall itself.
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return interest;
    }
    let mut ready = Interest::empty();
    if revents & libc::POLLIN != 0 {
        ready |= Interest::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Interest::WRITABLE;
    }
    ready
}
