//! The [`Stream`] type and its public operations.
//!
//! Each asynchronous operation takes a callback which receives the stream
//! and the result, and which fires exactly once. Only one operation may be
//! in flight per stream; issuing a second one, or issuing I/O on a stream
//! that is not open, panics.
use std::cell::{Cell, RefCell};
use std::panic::Location;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{trace, warn};

use crate::cache::{ReadCache, WriteCache};
use crate::config::StreamOptions;
use crate::kill::{KillHandle, KillSignal};
use crate::pending::PendingOp;
use crate::state::{State, StateCell};
use crate::transport::{Interest, StreamKind, Transport};
use crate::{Error, Result};

mod engine;

const LOG: &str = "sluice::stream";

/// Completion of [`Stream::open`].
pub type OpenFn = Box<dyn FnOnce(&Stream, Result<()>)>;
/// Completion of [`Stream::close`].
pub type CloseFn = Box<dyn FnOnce(&Stream, Result<()>)>;
/// Completion of [`Stream::sync`].
pub type SyncFn = Box<dyn FnOnce(&Stream, Result<()>)>;
/// Completion of [`Stream::task`].
pub type TaskFn = Box<dyn FnOnce(&Stream, Result<()>)>;
/// Completion of [`Stream::read`], receiving the bytes read.
pub type ReadFn = Box<dyn FnOnce(&Stream, Result<&[u8]>)>;
/// Completion of [`Stream::writ`], receiving the number of bytes accepted.
pub type WritFn = Box<dyn FnOnce(&Stream, Result<usize>)>;
/// Completion of [`Stream::seek`], receiving the new offset.
pub type SeekFn = Box<dyn FnOnce(&Stream, Result<u64>)>;

/// A non-blocking stream bound to a [`Transport`].
///
/// `Stream` is a cheap handle: clones refer to the same stream. The
/// transport is released once the last handle is dropped, if it has not
/// been released already.
#[derive(Clone)]
pub struct Stream {
    inner: Rc<Inner>,
}

struct Inner {
    kind: StreamKind,
    state: StateCell,
    signal: Arc<KillSignal>,
    transport_killed: Cell<bool>,
    busy: Cell<bool>,
    released: Cell<bool>,
    timeout: Cell<Option<Duration>>,
    rcache: RefCell<ReadCache>,
    wcache: RefCell<WriteCache>,
    pending: RefCell<PendingOp>,
    origin: Cell<Option<&'static Location<'static>>>,
    transport: Rc<dyn Transport>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = &self.inner;
        f.debug_struct("Stream")
            .field("kind", &inner.kind)
            .field("state", &inner.state.get())
            .field("killed", &inner.signal.is_killed())
            .field("busy", &inner.busy.get())
            .field("buffered", &inner.wcache.borrow().len())
            .field("pending", &inner.pending.borrow())
            .field("origin", &inner.origin.get())
            .field("transport", &inner.transport)
            .finish()
    }
}

impl Stream {
    /// Create a stream bound to `transport` with default options.
    pub fn new<T>(transport: T) -> Self
    where
        T: Transport + 'static,
    {
        Self::with_options(Rc::new(transport), StreamOptions::default())
    }

    /// Create a stream bound to a shared `transport`.
    pub fn with_options(transport: Rc<dyn Transport>, options: StreamOptions) -> Self {
        let signal = Arc::new(KillSignal::new());
        transport.attach(signal.clone());
        Self {
            inner: Rc::new(Inner {
                kind: transport.kind(),
                state: StateCell::new(),
                signal,
                transport_killed: Cell::new(false),
                busy: Cell::new(false),
                released: Cell::new(false),
                timeout: Cell::new(options.timeout),
                rcache: RefCell::new(ReadCache::new(options.read_cache)),
                wcache: RefCell::new(WriteCache::new(options.write_cache)),
                pending: RefCell::new(PendingOp::None),
                origin: Cell::new(None),
                transport,
            }),
        }
    }

    /// Open the stream.
    ///
    /// Succeeds immediately if the stream is already open.
    ///
    /// ### Panics
    /// Panics if another operation is in flight.
    #[track_caller]
    pub fn open<F>(&self, done: F)
    where
        F: FnOnce(&Stream, Result<()>) + 'static,
    {
        self.begin("open");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        match self.state() {
            State::Opened => self.finish(Box::new(done), Ok(())),
            State::Opening => unreachable!("open already in flight"),
            State::Closed => self.open_stage(Box::new(move |stream: &Stream, res| {
                stream.finish(Box::new(done), res)
            })),
        }
    }

    /// Open the stream without waiting.
    ///
    /// Returns false if the transport cannot open immediately.
    ///
    /// ### Panics
    /// Panics if another operation is in flight.
    #[track_caller]
    pub fn open_try(&self) -> bool {
        self.assert_idle("open_try");
        if self.is_killed() {
            return false;
        }
        if self.state() == State::Opened {
            return true;
        }
        if !self.inner.state.try_transition(State::Closed, State::Opening) {
            return false;
        }
        if self.inner.transport.open_try() {
            self.inner.state.transition(State::Opening, State::Opened);
            trace!(target: LOG, "stream.open_try {:?}", self.inner.kind);
            true
        } else {
            self.inner.state.transition(State::Opening, State::Closed);
            false
        }
    }

    /// Close the stream, flushing the write cache first.
    ///
    /// Succeeds immediately if the stream is already closed. A killed stream
    /// discards its write cache instead of flushing it. The stream is closed
    /// afterwards even if the flush failed; the flush failure is reported.
    ///
    /// ### Panics
    /// Panics if another operation is in flight.
    #[track_caller]
    pub fn close<F>(&self, done: F)
    where
        F: FnOnce(&Stream, Result<()>) + 'static,
    {
        self.begin("close");
        self.close_stage(Box::new(done));
    }

    /// Close the stream without waiting.
    ///
    /// Returns false if buffered data still needs an asynchronous flush or
    /// the transport cannot close immediately.
    ///
    /// ### Panics
    /// Panics if another operation is in flight.
    #[track_caller]
    pub fn close_try(&self) -> bool {
        self.assert_idle("close_try");
        if self.state() == State::Closed {
            return true;
        }
        if !self.inner.wcache.borrow().is_empty() {
            if !self.is_killed() {
                return false;
            }
            self.discard_cache();
        }
        if !self.inner.transport.close_try() {
            return false;
        }
        self.inner.state.transition(State::Opened, State::Closed);
        trace!(target: LOG, "stream.close_try {:?}", self.inner.kind);
        true
    }

    /// Read up to `size` bytes.
    ///
    /// Zero lets the read cache or the transport choose the size. Buffered
    /// writes are flushed before the transport is read. An empty result means
    /// the transport was not ready, see [`Stream::wait`].
    ///
    /// ### Panics
    /// Panics if the stream is not open or another operation is in flight.
    #[track_caller]
    pub fn read<F>(&self, size: usize, done: F)
    where
        F: FnOnce(&Stream, Result<&[u8]>) + 'static,
    {
        self.begin("read");
        self.assert_opened("read");
        if self.is_killed() {
            return self.finish_read(Box::new(done), Err(Error::killed()));
        }
        self.read_opened(size, Box::new(done));
    }

    /// Open the stream if needed, then read up to `size` bytes.
    ///
    /// ### Panics
    /// Panics if another operation is in flight.
    #[track_caller]
    pub fn open_read<F>(&self, size: usize, done: F)
    where
        F: FnOnce(&Stream, Result<&[u8]>) + 'static,
    {
        self.begin("open_read");
        if self.is_killed() {
            return self.finish_read(Box::new(done), Err(Error::killed()));
        }
        match self.state() {
            State::Opened => self.read_opened(size, Box::new(done)),
            _ => self.open_then(PendingOp::OpenThenRead {
                size,
                done: Box::new(done),
            }),
        }
    }

    /// Wait `delay`, then read up to `size` bytes as [`Stream::read`] does.
    ///
    /// The delay runs on the transport, so [`Stream::kill`] cancels it and
    /// the transport is never read. A zero delay reads at once.
    ///
    /// ### Panics
    /// Panics if the stream is not open or another operation is in flight.
    #[track_caller]
    pub fn read_after<F>(&self, delay: Duration, size: usize, done: F)
    where
        F: FnOnce(&Stream, Result<&[u8]>) + 'static,
    {
        self.begin("read_after");
        self.assert_opened("read_after");
        if self.is_killed() {
            return self.finish_read(Box::new(done), Err(Error::killed()));
        }
        self.delay_stage(
            delay,
            Box::new(move |stream: &Stream, res| match res {
                Ok(()) => stream.read_opened(size, Box::new(done)),
                Err(e) => stream.finish_read(Box::new(done), Err(e)),
            }),
        );
    }

    /// Write `data`.
    ///
    /// Small writes are coalesced in the write cache and complete before
    /// anything reaches the transport. The callback receives `data.len()`
    /// once the bytes are buffered or written.
    ///
    /// ### Panics
    /// Panics if `data` is empty, the stream is not open or another
    /// operation is in flight.
    #[track_caller]
    pub fn writ<F>(&self, data: impl Into<Bytes>, done: F)
    where
        F: FnOnce(&Stream, Result<usize>) + 'static,
    {
        let data = data.into();
        assert!(!data.is_empty(), "writ of an empty buffer");
        self.begin("writ");
        self.assert_opened("writ");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        self.cached_write(data, Box::new(done));
    }

    /// Wait `delay`, then write `data` as [`Stream::writ`] does.
    ///
    /// The bytes enter the write cache only once the delay has elapsed.
    /// [`Stream::kill`] cancels the delay and nothing is written.
    ///
    /// ### Panics
    /// Panics if `data` is empty, the stream is not open or another
    /// operation is in flight.
    #[track_caller]
    pub fn writ_after<F>(&self, delay: Duration, data: impl Into<Bytes>, done: F)
    where
        F: FnOnce(&Stream, Result<usize>) + 'static,
    {
        let data = data.into();
        assert!(!data.is_empty(), "writ of an empty buffer");
        self.begin("writ_after");
        self.assert_opened("writ_after");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        self.delay_stage(
            delay,
            Box::new(move |stream: &Stream, res| match res {
                Ok(()) => stream.cached_write(data, Box::new(done)),
                Err(e) => stream.finish(Box::new(done), Err(e)),
            }),
        );
    }

    /// Open the stream if needed, then write `data`.
    ///
    /// ### Panics
    /// Panics if `data` is empty or another operation is in flight.
    #[track_caller]
    pub fn open_writ<F>(&self, data: impl Into<Bytes>, done: F)
    where
        F: FnOnce(&Stream, Result<usize>) + 'static,
    {
        let data = data.into();
        assert!(!data.is_empty(), "writ of an empty buffer");
        self.begin("open_writ");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        match self.state() {
            State::Opened => self.cached_write(data, Box::new(done)),
            _ => self.open_then(PendingOp::OpenThenWrit {
                data,
                done: Box::new(done),
            }),
        }
    }

    /// Move the stream to `offset`.
    ///
    /// Buffered writes are flushed first. Seeking to the current offset
    /// completes without calling the transport.
    ///
    /// ### Panics
    /// Panics if the stream is not open or another operation is in flight.
    #[track_caller]
    pub fn seek<F>(&self, offset: u64, done: F)
    where
        F: FnOnce(&Stream, Result<u64>) + 'static,
    {
        self.begin("seek");
        self.assert_opened("seek");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        self.seek_opened(offset, Box::new(done));
    }

    /// Open the stream if needed, then move it to `offset`.
    ///
    /// ### Panics
    /// Panics if another operation is in flight.
    #[track_caller]
    pub fn open_seek<F>(&self, offset: u64, done: F)
    where
        F: FnOnce(&Stream, Result<u64>) + 'static,
    {
        self.begin("open_seek");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        match self.state() {
            State::Opened => self.seek_opened(offset, Box::new(done)),
            _ => self.open_then(PendingOp::OpenThenSeek {
                offset,
                done: Box::new(done),
            }),
        }
    }

    /// Flush the write cache, then sync the transport.
    ///
    /// `closing` is passed to the transport to indicate a close follows.
    ///
    /// ### Panics
    /// Panics if the stream is not open or another operation is in flight.
    #[track_caller]
    pub fn sync<F>(&self, closing: bool, done: F)
    where
        F: FnOnce(&Stream, Result<()>) + 'static,
    {
        self.begin("sync");
        self.assert_opened("sync");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        self.sync_stage(
            closing,
            Box::new(move |stream: &Stream, res| stream.finish(Box::new(done), res)),
        );
    }

    /// Run `done` once `delay` has elapsed, through the transport.
    ///
    /// ### Panics
    /// Panics if the stream is not open or another operation is in flight.
    #[track_caller]
    pub fn task<F>(&self, delay: Duration, done: F)
    where
        F: FnOnce(&Stream, Result<()>) + 'static,
    {
        self.begin("task");
        self.assert_opened("task");
        if self.is_killed() {
            return self.finish(Box::new(done), Err(Error::killed()));
        }
        let stream = self.clone();
        self.inner.transport.task(
            delay,
            Box::new(move |res| {
                let res = stream.observe(res);
                stream.finish(Box::new(done), res)
            }),
        );
    }

    /// Kill the stream.
    ///
    /// The operation in flight, if any, completes once with
    /// [`ErrorKind::Killed`](crate::ErrorKind::Killed), as does every later
    /// operation except close. A [`Stream::wait`] blocked on a socket
    /// returns. Killing is permanent for this stream.
    pub fn kill(&self) {
        self.inner.signal.kill();
        if self.inner.transport_killed.replace(true) {
            return;
        }
        trace!(
            target: LOG,
            "stream.kill {:?} state={:?} pending={:?}",
            self.inner.kind,
            self.state(),
            self.inner.pending.borrow()
        );
        self.inner.transport.kill();
    }

    /// Block until the transport is ready for any of `interest`.
    ///
    /// Returns the ready events, which are empty if `timeout` elapsed.
    /// `None` uses the stream's configured timeout.
    ///
    /// ### Panics
    /// Panics if the stream is not open.
    #[track_caller]
    pub fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Result<Interest> {
        self.assert_opened("wait");
        if self.is_killed() {
            return Err(Error::killed());
        }
        let timeout = timeout.or(self.timeout());
        let ready = self.inner.transport.wait(interest, timeout)?;
        if self.is_killed() {
            trace!(target: LOG, "stream.wait woken by kill");
            return Err(Error::killed());
        }
        Ok(ready)
    }

    /// A handle which kills this stream from any thread.
    ///
    /// Use it to interrupt a thread blocked in [`Stream::wait`] or in the
    /// [`blocking`](crate::blocking) wrappers.
    pub fn kill_handle(&self) -> KillHandle {
        KillHandle::new(self.inner.signal.clone())
    }

    /// Release the transport.
    ///
    /// An open stream is killed first. Releasing twice is a no-op, and
    /// dropping the last handle releases the transport as well.
    pub fn release(&self) {
        if self.inner.released.replace(true) {
            return;
        }
        if self.state() != State::Closed {
            warn!(
                target: LOG,
                "stream.release {:?} while {:?}", self.inner.kind, self.state()
            );
            self.kill();
            self.discard_cache();
            let closed = self.inner.state.try_transition(State::Opened, State::Closed)
                || self.inner.state.try_transition(State::Opening, State::Closed);
            debug_assert!(closed);
        }
        self.inner.transport.release();
    }

    /// The kind of transport this stream is bound to.
    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    /// The current lifecycle state.
    pub fn state(&self) -> State {
        self.inner.state.get()
    }

    /// Returns true if the stream is open.
    pub fn is_opened(&self) -> bool {
        self.state() == State::Opened
    }

    /// Returns true if the stream is closed.
    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    /// Returns true once the stream has been killed, from this thread or
    /// through a [`KillHandle`].
    pub fn is_killed(&self) -> bool {
        self.inner.signal.is_killed()
    }

    /// Returns true while an operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.get()
    }

    /// The logical offset, including buffered writes.
    pub fn offset(&self) -> u64 {
        self.inner.transport.offset() + self.buffered() as u64
    }

    /// The total size of the stream, if the transport knows it.
    pub fn size(&self) -> Option<u64> {
        self.inner.transport.size()
    }

    /// The number of bytes between the offset and the end of the stream.
    pub fn left(&self) -> Option<u64> {
        self.size().map(|size| size.saturating_sub(self.offset()))
    }

    /// Returns true if the offset has reached the end of a sized stream.
    pub fn is_eof(&self) -> bool {
        self.left() == Some(0)
    }

    /// The number of bytes held in the write cache.
    pub fn buffered(&self) -> usize {
        self.inner.wcache.borrow().len()
    }

    /// The size of the read scratch buffer, zero if disabled.
    pub fn read_cache_size(&self) -> usize {
        self.inner.rcache.borrow().max()
    }

    /// The size of the write-coalescing buffer, zero if disabled.
    pub fn write_cache_size(&self) -> usize {
        self.inner.wcache.borrow().max()
    }

    /// The timeout passed to [`Stream::wait`].
    pub fn timeout(&self) -> Option<Duration> {
        self.inner.timeout.get()
    }

    /// Set the timeout passed to [`Stream::wait`].
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.timeout.set(timeout);
    }

    /// The call site of the most recent operation.
    pub fn origin(&self) -> Option<&'static Location<'static>> {
        self.inner.origin.get()
    }

    /// The transport this stream is bound to.
    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.inner.transport
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.released.get() {
            return;
        }
        if self.state.get() != State::Closed {
            warn!(
                target: LOG,
                "stream dropped while {:?}, opened at {:?}",
                self.state.get(),
                self.origin.get()
            );
        }
        if !self.wcache.get_mut().is_empty() {
            warn!(
                target: LOG,
                "stream dropped with {} unflushed bytes",
                self.wcache.get_mut().len()
            );
        }
        self.transport.release();
    }
}
