use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::trace;
use sluice_reactor::Handle;

use super::{Done, Outstanding, ReadDone, StreamKind, Transport};
use crate::{Error, ErrorKind};

const LOG: &str = "sluice::data";

/// A transport over a fixed-size in-memory region.
///
/// Reads and writes move a head offset through the region. Reading past
/// the end, or writing once the region is full, fails with
/// [`ErrorKind::Closed`]. Every completion is queued on the reactor, so
/// callers always observe asynchronous completion.
#[derive(Debug)]
pub struct DataTransport {
    region: Rc<Region>,
    work: Outstanding,
}

#[derive(Debug)]
struct Region {
    bytes: RefCell<Vec<u8>>,
    head: Cell<usize>,
}

impl DataTransport {
    /// Create a transport over `data`.
    ///
    /// ### Panics
    /// Panics if called outside of a reactor context.
    #[track_caller]
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self::with_handle(Handle::current(), data)
    }

    /// Create a transport over a zeroed region of `len` bytes.
    ///
    /// ### Panics
    /// Panics if called outside of a reactor context.
    #[track_caller]
    pub fn with_len(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Create a transport over `data` which queues completions on `handle`.
    pub fn with_handle(handle: Handle, data: impl Into<Vec<u8>>) -> Self {
        Self {
            region: Rc::new(Region {
                bytes: RefCell::new(data.into()),
                head: Cell::new(0),
            }),
            work: Outstanding::new(handle),
        }
    }

    /// Returns a copy of the whole region.
    pub fn contents(&self) -> Vec<u8> {
        self.region.bytes.borrow().clone()
    }

    /// Returns a handle sharing this transport's region, for inspecting it
    /// after the transport has been moved into a stream.
    pub fn region(&self) -> DataRegion {
        DataRegion(self.region.clone())
    }
}

/// Shared view of a [`DataTransport`]'s region.
#[derive(Debug, Clone)]
pub struct DataRegion(Rc<Region>);

impl DataRegion {
    /// Returns a copy of the whole region.
    pub fn contents(&self) -> Vec<u8> {
        self.0.bytes.borrow().clone()
    }

    /// Returns the bytes between the start of the region and the head.
    pub fn written(&self) -> Vec<u8> {
        self.0.bytes.borrow()[..self.0.head.get()].to_vec()
    }
}

impl Region {
    fn size(&self) -> usize {
        self.bytes.borrow().len()
    }

    fn left(&self) -> usize {
        self.size() - self.head.get()
    }
}

impl Transport for DataTransport {
    fn kind(&self) -> StreamKind {
        StreamKind::Data
    }

    fn open(&self, done: Done<()>) {
        let region = self.region.clone();
        self.work.post(move |res| {
            if res.is_ok() {
                region.head.set(0);
            }
            done(res)
        });
    }

    fn open_try(&self) -> bool {
        self.region.head.set(0);
        true
    }

    fn close(&self, done: Done<()>) {
        self.work.post(done);
    }

    fn close_try(&self) -> bool {
        true
    }

    fn read(&self, mut buf: BytesMut, want: usize, done: ReadDone) {
        let region = self.region.clone();
        self.work.post(move |res| {
            if let Err(e) = res {
                return done(buf, Err(e));
            }
            let left = region.left();
            if left == 0 {
                return done(buf, Err(Error::closed()));
            }
            let n = if want == 0 { left } else { want.min(left) };
            let head = region.head.get();
            buf.extend_from_slice(&region.bytes.borrow()[head..head + n]);
            region.head.set(head + n);
            trace!(target: LOG, "data.read {} at {}", n, head);
            done(buf, Ok(n))
        });
    }

    fn writ(&self, data: Bytes, done: Done<usize>) {
        let region = self.region.clone();
        self.work.post(move |res| {
            if let Err(e) = res {
                return done(Err(e));
            }
            let left = region.left();
            if left == 0 {
                return done(Err(Error::closed()));
            }
            let n = data.len().min(left);
            let head = region.head.get();
            region.bytes.borrow_mut()[head..head + n].copy_from_slice(&data[..n]);
            region.head.set(head + n);
            trace!(target: LOG, "data.writ {} at {}", n, head);
            done(Ok(n))
        });
    }

    fn seek(&self, offset: u64, done: Done<u64>) {
        let region = self.region.clone();
        self.work.post(move |res| {
            if let Err(e) = res {
                return done(Err(e));
            }
            let size = region.size();
            match usize::try_from(offset) {
                Ok(o) if o <= size => {
                    region.head.set(o);
                    done(Ok(offset))
                }
                _ => {
                    let err = io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("offset {} is past the end of a {} byte region", offset, size),
                    );
                    done(Err(Error::with_source(ErrorKind::Unknown, err)))
                }
            }
        });
    }

    fn task(&self, delay: Duration, done: Done<()>) {
        self.work.post_after(delay, done);
    }

    fn kill(&self) {
        if self.work.kill() {
            trace!(target: LOG, "data.kill cancelled outstanding work");
        }
    }

    fn offset(&self) -> u64 {
        self.region.head.get() as u64
    }

    fn size(&self) -> Option<u64> {
        Some(self.region.size() as u64)
    }
}
