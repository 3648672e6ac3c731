#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::ops;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sluice::transport::{Done, ReadDone};
use sluice::{Interest, Result, Stream, StreamKind, Transport};
use sluice_reactor::park::{Park, PollPark, SimPark};
use sluice_reactor::{Clock, Reactor};

pub type TestResult<U> = std::result::Result<U, Box<dyn std::error::Error>>;

fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

fn with_reactor<P, U, F>(mut reactor: Reactor<P>, f: F) -> TestResult<U>
where
    P: Park,
    F: FnOnce(&mut Reactor<P>) -> TestResult<U>,
{
    let _g = reactor.enter();
    f(&mut reactor)
}

/// Run `f` against a reactor on simulated time.
pub fn with_test_env<U, F>(f: F) -> TestResult<U>
where
    F: FnOnce(&mut Reactor<SimPark>) -> TestResult<U>,
{
    init_logging();
    let clock = Clock::simulated();
    with_reactor(Reactor::new(SimPark::new(clock.clone()), clock), f)
}

/// Run `f` against a reactor blocking in `poll(2)` on the system clock.
pub fn with_poll_env<U, F>(f: F) -> TestResult<U>
where
    F: FnOnce(&mut Reactor<PollPark>) -> TestResult<U>,
{
    init_logging();
    with_reactor(Reactor::new(PollPark::new(), Clock::system()), f)
}

/// Shared slot a completion callback stores its result in.
#[derive(Debug)]
pub struct Slot<T>(Rc<RefCell<Vec<Result<T>>>>);

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self(Rc::default())
    }
}

impl<T> Slot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, res: Result<T>) {
        self.0.borrow_mut().push(res);
    }

    /// Number of times the callback fired.
    pub fn fired(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Take the single result, panicking if the callback did not fire exactly once.
    pub fn take(&self) -> Result<T> {
        let mut results = self.0.borrow_mut();
        assert_eq!(results.len(), 1, "callback fired {} times", results.len());
        results.remove(0)
    }
}

/// A completion which stores its result in `slot`.
pub fn capture<T: 'static>(slot: &Slot<T>) -> Box<dyn FnOnce(&Stream, Result<T>)> {
    let slot = slot.clone();
    Box::new(move |_, res| slot.put(res))
}

/// A read completion which copies the bytes read into `slot`.
pub fn capture_read(slot: &Slot<Vec<u8>>) -> Box<dyn FnOnce(&Stream, Result<&[u8]>)> {
    let slot = slot.clone();
    Box::new(move |_, res: Result<&[u8]>| slot.put(res.map(<[u8]>::to_vec)))
}

/// Counts and records the calls made to a wrapped transport.
#[derive(Debug, Default)]
pub struct Calls {
    pub open: Cell<usize>,
    pub close: Cell<usize>,
    pub read: Cell<usize>,
    pub writ: RefCell<Vec<Bytes>>,
    pub seek: RefCell<Vec<u64>>,
    pub sync: Cell<usize>,
    pub kill: Cell<usize>,
    pub release: Cell<usize>,
    pub log: RefCell<Vec<&'static str>>,
}

impl Calls {
    fn record(&self, op: &'static str) {
        self.log.borrow_mut().push(op);
    }

    pub fn writ_count(&self) -> usize {
        self.writ.borrow().len()
    }

    pub fn total(&self) -> usize {
        self.log.borrow().len()
    }

    pub fn log(&self) -> Vec<&'static str> {
        self.log.borrow().clone()
    }
}

/// A transport wrapper which records every call before forwarding it.
#[derive(Debug)]
pub struct Recording<T> {
    inner: T,
    calls: Rc<Calls>,
}

impl<T: Transport> Recording<T> {
    pub fn new(inner: T) -> (Self, Rc<Calls>) {
        let calls = Rc::new(Calls::default());
        (
            Self {
                inner,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl<T: Transport> Transport for Recording<T> {
    fn kind(&self) -> StreamKind {
        self.inner.kind()
    }

    fn open(&self, done: Done<()>) {
        self.calls.open.set(self.calls.open.get() + 1);
        self.calls.record("open");
        self.inner.open(done)
    }

    fn open_try(&self) -> bool {
        self.calls.record("open_try");
        self.inner.open_try()
    }

    fn close(&self, done: Done<()>) {
        self.calls.close.set(self.calls.close.get() + 1);
        self.calls.record("close");
        self.inner.close(done)
    }

    fn close_try(&self) -> bool {
        self.calls.close.set(self.calls.close.get() + 1);
        self.calls.record("close_try");
        self.inner.close_try()
    }

    fn release(&self) {
        self.calls.release.set(self.calls.release.get() + 1);
        self.inner.release()
    }

    fn read(&self, buf: BytesMut, want: usize, done: ReadDone) {
        self.calls.read.set(self.calls.read.get() + 1);
        self.calls.record("read");
        self.inner.read(buf, want, done)
    }

    fn writ(&self, data: Bytes, done: Done<usize>) {
        self.calls.writ.borrow_mut().push(data.clone());
        self.calls.record("writ");
        self.inner.writ(data, done)
    }

    fn seek(&self, offset: u64, done: Done<u64>) {
        self.calls.seek.borrow_mut().push(offset);
        self.calls.record("seek");
        self.inner.seek(offset, done)
    }

    fn sync(&self, closing: bool, done: Done<()>) {
        self.calls.sync.set(self.calls.sync.get() + 1);
        self.calls.record("sync");
        self.inner.sync(closing, done)
    }

    fn task(&self, delay: Duration, done: Done<()>) {
        self.calls.record("task");
        self.inner.task(delay, done)
    }

    fn kill(&self) {
        self.calls.kill.set(self.calls.kill.get() + 1);
        self.inner.kill()
    }

    fn attach(&self, signal: std::sync::Arc<sluice::KillSignal>) {
        self.inner.attach(signal)
    }

    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Result<Interest> {
        self.inner.wait(interest, timeout)
    }

    fn offset(&self) -> u64 {
        self.inner.offset()
    }

    fn size(&self) -> Option<u64> {
        self.inner.size()
    }
}

/// [`ThreadNameTestDir`] creates a test directory under /tmp
/// using the current thread name. This is nice for tests
/// because cargo test will name the thread with the name of
/// the test.
///
/// The directory is automatically cleaned up on drop.
#[derive(Debug, Clone)]
pub struct ThreadNameTestDir {
    path: PathBuf,
}

impl ThreadNameTestDir {
    pub fn new() -> Self {
        let thread = std::thread::current();
        let thread_name = thread.name().expect("no thread name");
        let sanitized = thread_name.replace("::", "-");
        let path = std::env::temp_dir()
            .join("sluice-test-dir")
            .join(sanitized);
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).expect("could not create directory");
        Self { path }
    }
}

impl Default for ThreadNameTestDir {
    fn default() -> Self {
        Self::new()
    }
}

impl ops::Deref for ThreadNameTestDir {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

impl AsRef<Path> for ThreadNameTestDir {
    fn as_ref(&self) -> &Path {
        self.path.as_path()
    }
}

impl Drop for ThreadNameTestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}
