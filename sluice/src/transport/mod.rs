//! The backend contract a [`Stream`](crate::Stream) is bound to.
//!
//! A [`Transport`] performs the actual I/O. Every asynchronous method takes
//! a completion which must run exactly once, normally from a callback queued
//! on the reactor. Optional operations have default implementations that
//! report [`ErrorKind::Unsupported`](crate::ErrorKind::Unsupported) or
//! succeed without doing anything.
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sluice_reactor::{Handle, TaskId};

use crate::{Error, KillSignal, Result};

mod data;
mod file;
mod sock;

pub use data::DataTransport;
pub use file::{FileTransport, OpenOptions};
pub use sluice_reactor::Interest;
pub use sock::SockTransport;

/// Completion of a transport operation.
pub type Done<T> = Box<dyn FnOnce(Result<T>)>;

/// Completion of a transport read.
///
/// The buffer passed to [`Transport::read`] is handed back along with the
/// number of bytes appended to it.
pub type ReadDone = Box<dyn FnOnce(BytesMut, Result<usize>)>;

/// Which kind of transport a stream is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// An in-memory region.
    Data,
    /// A file on disk.
    File,
    /// A TCP connection.
    Socket,
    /// An HTTP resource.
    Http,
}

/// Operations a stream backend supplies.
///
/// Methods take `&self`: transports are shared behind an `Rc` and keep
/// their own state in cells. Reads and writes complete with the number of
/// bytes transferred, where zero means "not ready, wait and retry", or with
/// an error. End of data is reported as
/// [`ErrorKind::Closed`](crate::ErrorKind::Closed).
pub trait Transport: fmt::Debug {
    /// The kind of this transport.
    fn kind(&self) -> StreamKind;

    /// Open the transport.
    fn open(&self, done: Done<()>);

    /// Open the transport without waiting.
    ///
    /// Returns false if an immediate open is not possible.
    fn open_try(&self) -> bool {
        false
    }

    /// Close the transport. Closing twice must succeed.
    fn close(&self, done: Done<()>);

    /// Close the transport without waiting.
    ///
    /// Returns false if an immediate close is not possible.
    fn close_try(&self) -> bool {
        false
    }

    /// Free every resource held by the transport. Must be idempotent.
    fn release(&self) {}

    /// Append up to `want` bytes to `buf`.
    ///
    /// A `want` of zero lets the transport choose how much to read.
    fn read(&self, buf: BytesMut, want: usize, done: ReadDone);

    /// Write a prefix of `data`, completing with the number of bytes written.
    fn writ(&self, data: Bytes, done: Done<usize>);

    /// Move the transport offset.
    fn seek(&self, offset: u64, done: Done<u64>) {
        let _ = offset;
        done(Err(Error::unsupported()))
    }

    /// Flush buffered data to the backing store.
    ///
    /// `closing` is set when the sync precedes a close.
    fn sync(&self, closing: bool, done: Done<()>) {
        let _ = closing;
        done(Ok(()))
    }

    /// Run `done` once `delay` has elapsed.
    fn task(&self, delay: Duration, done: Done<()>) {
        let _ = delay;
        done(Err(Error::unsupported()))
    }

    /// Cancel outstanding work so its completion runs promptly.
    fn kill(&self) {}

    /// Receive the kill signal of the stream this transport is bound to.
    ///
    /// Transports which block on a descriptor arm the signal with it, so a
    /// kill from another thread shuts the descriptor down.
    fn attach(&self, signal: Arc<KillSignal>) {
        let _ = signal;
    }

    /// Block until the transport is ready for any of `interest`.
    ///
    /// Returns the ready events, empty if `timeout` elapsed first.
    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Result<Interest> {
        let _ = timeout;
        Ok(interest)
    }

    /// The current transport offset.
    fn offset(&self) -> u64;

    /// The total size, if known.
    fn size(&self) -> Option<u64> {
        None
    }
}

/// Tracks the reactor callback a transport is waiting on, so it can be
/// cancelled by [`Transport::kill`].
#[derive(Clone)]
pub(crate) struct Outstanding {
    handle: Handle,
    slot: Rc<Cell<Option<TaskId>>>,
}

impl Outstanding {
    pub(crate) fn new(handle: Handle) -> Self {
        Self {
            handle,
            slot: Rc::new(Cell::new(None)),
        }
    }

    /// Run `f` on the next reactor turn.
    pub(crate) fn post<F>(&self, f: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let slot = self.slot.clone();
        let id = self.handle.post(move |fired| {
            slot.set(None);
            f(fired.map(drop).map_err(Error::from))
        });
        self.track(id);
    }

    /// Run `f` once `delay` has elapsed.
    pub(crate) fn post_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(Result<()>) + 'static,
    {
        let slot = self.slot.clone();
        let id = self.handle.post_after(delay, move |fired| {
            slot.set(None);
            f(fired.map(drop).map_err(Error::from))
        });
        self.track(id);
    }

    /// Run `f` once `fd` is ready for any of `interest`.
    pub(crate) fn register<F>(&self, fd: std::os::fd::RawFd, interest: Interest, f: F)
    where
        F: FnOnce(Result<Interest>) + 'static,
    {
        let slot = self.slot.clone();
        let id = self.handle.register(fd, interest, move |fired| {
            slot.set(None);
            f(fired.map_err(Error::from))
        });
        self.track(id);
    }

    fn track(&self, id: TaskId) {
        // A callback run synchronously after shutdown never stays outstanding.
        if !self.handle.is_shutdown() {
            self.slot.set(Some(id));
        }
    }

    /// Cancel the outstanding callback, if any.
    pub(crate) fn kill(&self) -> bool {
        match self.slot.take() {
            Some(id) => self.handle.cancel(id),
            None => false,
        }
    }
}

impl fmt::Debug for Outstanding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outstanding")
            .field("task", &self.slot.get())
            .finish()
    }
}
