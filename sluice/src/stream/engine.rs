//! Continuation engine.
//!
//! Operations that need a prerequisite (an open, or a flush of the write
//! cache) park their main stage in [`PendingOp`] and resume from the
//! prerequisite's completion. Cancellation is observed in one place,
//! [`Stream::observe`], which every transport completion passes through.
use std::panic::Location;
use std::time::Duration;

use bytes::Bytes;
use log::{trace, warn};

use super::{ReadFn, SeekFn, Stream, WritFn, LOG};
use crate::pending::PendingOp;
use crate::state::State;
use crate::{Error, Result};

/// Continuation of an internal stage.
pub(super) type Stage<T> = Box<dyn FnOnce(&Stream, Result<T>)>;

impl Stream {
    /// Mark an operation as in flight.
    #[track_caller]
    pub(super) fn begin(&self, op: &'static str) {
        self.assert_idle(op);
        debug_assert!(self.inner.pending.borrow().is_none());
        let origin = Location::caller();
        self.inner.busy.set(true);
        self.inner.origin.set(Some(origin));
        trace!(target: LOG, "stream.{} {:?} at {}", op, self.inner.kind, origin);
    }

    #[track_caller]
    pub(super) fn assert_idle(&self, op: &'static str) {
        if self.inner.busy.get() {
            panic!(
                "stream.{}: another operation is in flight, issued at {:?}",
                op,
                self.inner.origin.get()
            );
        }
    }

    #[track_caller]
    pub(super) fn assert_opened(&self, op: &'static str) {
        let state = self.state();
        if state != State::Opened {
            // Clear the in-flight mark so the panic does not poison the stream.
            self.inner.busy.set(false);
            panic!("stream.{}: stream is {:?}, not opened", op, state);
        }
    }

    /// Complete the operation in flight.
    pub(super) fn finish<T>(&self, done: Stage<T>, res: Result<T>) {
        self.inner.busy.set(false);
        done(self, res)
    }

    pub(super) fn finish_read(&self, done: ReadFn, res: Result<&[u8]>) {
        self.inner.busy.set(false);
        done(self, res)
    }

    /// The single cancellation check applied to every transport completion.
    pub(super) fn observe<T>(&self, res: Result<T>) -> Result<T> {
        if self.is_killed() {
            if let Err(e) = &res {
                if !e.is_killed() {
                    trace!(target: LOG, "stream.observe {} superseded by kill", e);
                }
            }
            return Err(Error::killed());
        }
        res
    }

    pub(super) fn open_stage(&self, next: Stage<()>) {
        let opening = self.inner.state.try_transition(State::Closed, State::Opening);
        assert!(opening, "stream.open: stream is {:?}", self.state());
        let stream = self.clone();
        self.inner.transport.open(Box::new(move |res| {
            let to = match &res {
                Ok(()) => State::Opened,
                Err(e) => {
                    trace!(target: LOG, "stream.open failed {}", e);
                    State::Closed
                }
            };
            if !stream.inner.state.try_transition(State::Opening, to) {
                // Only a release while opening moves the state underneath us.
                assert!(
                    stream.inner.released.get(),
                    "stream.open completed while {:?}",
                    stream.state()
                );
            }
            let res = stream.observe(res);
            next(&stream, res)
        }));
    }

    /// Store `op` and open the stream, resuming `op` once opened.
    pub(super) fn open_then(&self, op: PendingOp) {
        self.defer(op);
        self.open_stage(Box::new(|stream: &Stream, res| stream.resume(res)));
    }

    fn defer(&self, op: PendingOp) {
        let mut pending = self.inner.pending.borrow_mut();
        assert!(pending.is_none(), "stream already has {:?} pending", *pending);
        trace!(target: LOG, "stream.pending {:?}", op);
        *pending = op;
    }

    /// Run or fail the stored main stage once its prerequisite completed.
    fn resume(&self, res: Result<()>) {
        let op = self.inner.pending.borrow_mut().take();
        if let Err(e) = res {
            trace!(target: LOG, "stream.resume {} failed {}", op.name(), e);
            return match op {
                PendingOp::OpenThenRead { done, .. } | PendingOp::SyncThenRead { done, .. } => {
                    self.finish_read(done, Err(e))
                }
                PendingOp::OpenThenWrit { done, .. } => self.finish(done, Err(e)),
                PendingOp::OpenThenSeek { done, .. } | PendingOp::SyncThenSeek { done, .. } => {
                    self.finish(done, Err(e))
                }
                PendingOp::None => unreachable!("resumed without a pending operation"),
            };
        }
        match op {
            PendingOp::OpenThenRead { size, done } => self.read_opened(size, done),
            PendingOp::OpenThenWrit { data, done } => self.cached_write(data, done),
            PendingOp::OpenThenSeek { offset, done } => self.seek_opened(offset, done),
            PendingOp::SyncThenRead { size, done } => self.cached_read(size, done),
            PendingOp::SyncThenSeek { offset, done } => self.seek_now(offset, done),
            PendingOp::None => unreachable!("resumed without a pending operation"),
        }
    }

    /// Let `delay` elapse on the transport, then run `next`.
    ///
    /// The wait is outstanding transport work, so a kill cancels it.
    pub(super) fn delay_stage(&self, delay: Duration, next: Stage<()>) {
        if delay.is_zero() {
            return next(self, Ok(()));
        }
        trace!(target: LOG, "stream.delay {:?}", delay);
        let stream = self.clone();
        self.inner.transport.task(
            delay,
            Box::new(move |res| {
                let res = stream.observe(res);
                next(&stream, res)
            }),
        );
    }

    pub(super) fn read_opened(&self, size: usize, done: ReadFn) {
        if self.inner.wcache.borrow().is_empty() {
            return self.cached_read(size, done);
        }
        self.defer(PendingOp::SyncThenRead { size, done });
        self.sync_stage(false, Box::new(|stream: &Stream, res| stream.resume(res)));
    }

    fn cached_read(&self, size: usize, done: ReadFn) {
        assert!(
            self.inner.wcache.borrow().is_empty(),
            "read issued with unflushed writes"
        );
        let (buf, want) = self.inner.rcache.borrow_mut().acquire(size);
        let stream = self.clone();
        self.inner.transport.read(
            buf,
            want,
            Box::new(move |buf, res| {
                let res = stream.observe(res);
                match res {
                    Ok(n) => stream.finish_read(done, Ok(&buf[..n.min(buf.len())])),
                    Err(e) => stream.finish_read(done, Err(e)),
                }
                stream.inner.rcache.borrow_mut().release(buf);
            }),
        );
    }

    /// Buffer `data`, flushing the cache once it reaches its maximum.
    pub(super) fn cached_write(&self, data: Bytes, done: WritFn) {
        let size = data.len();
        let flush = {
            let mut wcache = self.inner.wcache.borrow_mut();
            if wcache.max() == 0 && wcache.is_empty() {
                Some(data)
            } else {
                wcache.push(&data);
                if wcache.is_full() {
                    Some(wcache.take())
                } else {
                    None
                }
            }
        };
        match flush {
            None => {
                trace!(target: LOG, "stream.writ buffered {}", size);
                self.finish(done, Ok(size))
            }
            Some(all) => {
                trace!(target: LOG, "stream.writ flush {}", all.len());
                self.drain(
                    all,
                    0,
                    Box::new(move |stream: &Stream, res: Result<usize>| {
                        stream.finish(done, res.map(|_| size))
                    }),
                )
            }
        }
    }

    /// Write all of `data`, re-issuing the remainder after partial writes.
    ///
    /// Whatever could not be written is put back into the write cache.
    fn drain(&self, data: Bytes, written: usize, next: Stage<usize>) {
        let stream = self.clone();
        self.inner.transport.writ(
            data.clone(),
            Box::new(move |res| match res {
                Ok(n) if n >= data.len() => {
                    let res = stream.observe(Ok(written + data.len()));
                    next(&stream, res)
                }
                Ok(0) => {
                    stream.restore(data);
                    let res = stream.observe(Err(Error::closed()));
                    next(&stream, res)
                }
                Ok(n) => {
                    let rest = data.slice(n..);
                    if stream.is_killed() {
                        stream.restore(rest);
                        return next(&stream, Err(Error::killed()));
                    }
                    trace!(target: LOG, "stream.writ partial {} left {}", n, rest.len());
                    stream.drain(rest, written + n, next)
                }
                Err(e) => {
                    stream.restore(data);
                    let res = stream.observe(Err(e));
                    next(&stream, res)
                }
            }),
        );
    }

    fn restore(&self, remainder: Bytes) {
        trace!(target: LOG, "stream.writ restore {}", remainder.len());
        self.inner.wcache.borrow_mut().restore(remainder);
    }

    /// Write out the write cache, if it holds anything.
    fn flush_stage(&self, next: Stage<()>) {
        let data = self.inner.wcache.borrow_mut().take();
        if data.is_empty() {
            return next(self, Ok(()));
        }
        trace!(target: LOG, "stream.flush {}", data.len());
        self.drain(
            data,
            0,
            Box::new(move |stream: &Stream, res: Result<usize>| next(stream, res.map(drop))),
        );
    }

    /// Flush the write cache, then sync the transport.
    pub(super) fn sync_stage(&self, closing: bool, next: Stage<()>) {
        self.flush_stage(Box::new(move |stream: &Stream, res| {
            if let Err(e) = res {
                return next(stream, Err(e));
            }
            let owner = stream.clone();
            stream.inner.transport.sync(
                closing,
                Box::new(move |res| {
                    let res = owner.observe(res);
                    next(&owner, res)
                }),
            );
        }));
    }

    pub(super) fn seek_opened(&self, offset: u64, done: SeekFn) {
        if self.inner.wcache.borrow().is_empty() {
            return self.seek_now(offset, done);
        }
        self.defer(PendingOp::SyncThenSeek { offset, done });
        self.sync_stage(false, Box::new(|stream: &Stream, res| stream.resume(res)));
    }

    fn seek_now(&self, offset: u64, done: SeekFn) {
        if self.inner.transport.offset() == offset {
            trace!(target: LOG, "stream.seek {} unchanged", offset);
            return self.finish(done, Ok(offset));
        }
        let stream = self.clone();
        self.inner.transport.seek(
            offset,
            Box::new(move |res| {
                let res = stream.observe(res);
                stream.finish(done, res)
            }),
        );
    }

    pub(super) fn close_stage(&self, done: Stage<()>) {
        match self.state() {
            State::Closed => return self.finish(done, Ok(())),
            State::Opening => unreachable!("close while opening"),
            State::Opened => {}
        }
        if self.is_killed() {
            self.discard_cache();
            return self.close_transport(None, done);
        }
        if self.inner.wcache.borrow().is_empty() {
            return self.close_transport(None, done);
        }
        self.sync_stage(
            true,
            Box::new(move |stream: &Stream, res| stream.close_transport(res.err(), done)),
        );
    }

    fn close_transport(&self, failed: Option<Error>, done: Stage<()>) {
        let stream = self.clone();
        self.inner.transport.close(Box::new(move |res| {
            if !stream.inner.state.try_transition(State::Opened, State::Closed) {
                assert!(
                    stream.inner.released.get(),
                    "stream.close completed while {:?}",
                    stream.state()
                );
            }
            stream.discard_cache();
            let res = match failed {
                Some(e) => Err(e),
                None => res,
            };
            trace!(target: LOG, "stream.closed {:?} {:?}", stream.inner.kind, res);
            stream.finish(done, res)
        }));
    }

    pub(super) fn discard_cache(&self) {
        let mut wcache = self.inner.wcache.borrow_mut();
        if !wcache.is_empty() {
            warn!(target: LOG, "stream discarding {} unflushed bytes", wcache.len());
            wcache.clear();
        }
    }
}
