use std::cell::{Cell, RefCell};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, trace};
use sluice_reactor::Handle;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{Done, Interest, Outstanding, ReadDone, StreamKind, Transport};
use crate::{Error, ErrorKind, KillSignal, Result};

const LOG: &str = "sluice::sock";

/// Bytes requested when the caller lets the transport choose.
const DEFAULT_READ: usize = 8192;

/// A TCP client transport.
///
/// Connects, receives and sends without blocking: whenever the socket is
/// not ready the transport registers with the reactor and retries once it
/// is. The host is resolved when the transport is opened.
///
/// Resolution uses the system resolver and blocks the reactor thread until
/// it answers. Pass a numeric address to avoid the lookup when a slow DNS
/// server must not stall other streams.
///
/// Killing the stream shuts the socket down, which wakes a thread blocked
/// in [`Stream::wait`](crate::Stream::wait) even when the kill comes from a
/// [`KillHandle`](crate::KillHandle) on another thread.
#[derive(Debug)]
pub struct SockTransport {
    shared: Rc<Shared>,
    work: Outstanding,
}

#[derive(Debug)]
struct Shared {
    host: String,
    port: u16,
    socket: RefCell<Option<Socket>>,
    transferred: Cell<u64>,
    killed: Cell<bool>,
    signal: RefCell<Option<Arc<KillSignal>>>,
}

impl SockTransport {
    /// Create a transport which connects to `host:port`.
    ///
    /// `host` is resolved on open with a blocking lookup on the reactor
    /// thread, see [`SockTransport`].
    ///
    /// ### Panics
    /// Panics if called outside of a reactor context.
    #[track_caller]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_handle(Handle::current(), host, port)
    }

    /// Create a transport which connects to `host:port` and queues
    /// completions on `handle`.
    pub fn with_handle(handle: Handle, host: impl Into<String>, port: u16) -> Self {
        Self {
            shared: Rc::new(Shared {
                host: host.into(),
                port,
                socket: RefCell::new(None),
                transferred: Cell::new(0),
                killed: Cell::new(false),
                signal: RefCell::new(None),
            }),
            work: Outstanding::new(handle),
        }
    }

    /// Returns the local address once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .with_socket(|s| s.local_addr())
            .ok()
            .and_then(|a| a.as_socket())
    }

    fn fail_later<T: 'static>(&self, err: Error, done: Done<T>) {
        self.work.post(move |res| done(res.and(Err(err))));
    }
}

impl Shared {
    fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::with_source(ErrorKind::DnsFailed, e))?;
        addrs.next().ok_or_else(|| Error::new(ErrorKind::DnsFailed))
    }

    fn connect(&self, addr: SocketAddr) -> Result<RawFd> {
        let connect = || -> io::Result<Socket> {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            socket.set_nonblocking(true)?;
            socket.set_nodelay(true)?;
            match socket.connect(&SockAddr::from(addr)) {
                Ok(()) => Ok(socket),
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(socket),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(socket),
                Err(e) => Err(e),
            }
        };
        let socket = connect().map_err(|e| Error::with_source(ErrorKind::ConnectFailed, e))?;
        let fd = socket.as_raw_fd();
        debug!(target: LOG, "sock.connect {} fd={}", addr, fd);
        *self.socket.borrow_mut() = Some(socket);
        if let Some(signal) = self.signal.borrow().as_ref() {
            signal.arm(fd);
        }
        Ok(fd)
    }

    fn connected(&self) -> Result<()> {
        match self.with_socket(|s| s.take_error()) {
            Ok(None) => Ok(()),
            Ok(Some(e)) | Err(e) => Err(Error::with_source(ErrorKind::ConnectFailed, e)),
        }
    }

    fn fd(&self) -> Option<RawFd> {
        self.socket.borrow().as_ref().map(|s| s.as_raw_fd())
    }

    fn close(&self) {
        let close = || {
            if let Some(socket) = self.socket.borrow_mut().take() {
                trace!(target: LOG, "sock.close fd={}", socket.as_raw_fd());
                drop(socket);
            }
        };
        match self.signal.borrow().as_ref() {
            Some(signal) => signal.disarm(close),
            None => close(),
        }
    }

    fn with_socket<T>(&self, f: impl FnOnce(&Socket) -> io::Result<T>) -> io::Result<T> {
        match self.socket.borrow().as_ref() {
            Some(socket) => f(socket),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "socket is not connected",
            )),
        }
    }
}

fn recv(shared: Rc<Shared>, work: Outstanding, buf: BytesMut, want: usize, done: ReadDone) {
    let Some(fd) = shared.fd() else {
        return work.post(move |res| done(buf, res.and(Err(Error::closed()))));
    };
    let retry = work.clone();
    work.register(fd, Interest::READABLE, move |res| {
        let mut buf = buf;
        if let Err(e) = res {
            return done(buf, Err(e));
        }
        let want = if want == 0 { DEFAULT_READ } else { want };
        let start = buf.len();
        buf.resize(start + want, 0);
        let res = shared.with_socket(|mut s| s.read(&mut buf[start..]));
        match res {
            Ok(0) => {
                buf.truncate(start);
                done(buf, Err(Error::closed()))
            }
            Ok(n) => {
                buf.truncate(start + n);
                shared.transferred.set(shared.transferred.get() + n as u64);
                trace!(target: LOG, "sock.recv {}", n);
                done(buf, Ok(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                buf.truncate(start);
                recv(shared, retry, buf, want, done)
            }
            Err(e) => {
                buf.truncate(start);
                done(buf, Err(Error::from(e)))
            }
        }
    });
}

fn send(shared: Rc<Shared>, work: Outstanding, data: Bytes, done: Done<usize>) {
    let Some(fd) = shared.fd() else {
        return work.post(move |res| done(res.and(Err(Error::closed()))));
    };
    let retry = work.clone();
    work.register(fd, Interest::WRITABLE, move |res| {
        if let Err(e) = res {
            return done(Err(e));
        }
        match shared.with_socket(|s| s.send_with_flags(&data, libc::MSG_NOSIGNAL)) {
            Ok(n) => {
                shared.transferred.set(shared.transferred.get() + n as u64);
                trace!(target: LOG, "sock.send {}", n);
                done(Ok(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => send(shared, retry, data, done),
            Err(e) => done(Err(Error::from(e))),
        }
    });
}

fn poll_one(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> io::Result<Interest> {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    let timeout = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };
    // Safety: `pfd` is a single valid pollfd for the duration of the call.
    let n = unsafe { libc::poll(&mut pfd, 1, timeout) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Interest::empty());
        }
        return Err(err);
    }
    if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Ok(interest);
    }
    let mut ready = Interest::empty();
    if pfd.revents & libc::POLLIN != 0 {
        ready |= Interest::READABLE;
    }
    if pfd.revents & libc::POLLOUT != 0 {
        ready |= Interest::WRITABLE;
    }
    Ok(ready & interest)
}

impl Transport for SockTransport {
    fn kind(&self) -> StreamKind {
        StreamKind::Socket
    }

    fn open(&self, done: Done<()>) {
        let addr = match self.shared.resolve() {
            Ok(addr) => addr,
            Err(e) => return self.fail_later(e, done),
        };
        let fd = match self.shared.connect(addr) {
            Ok(fd) => fd,
            Err(e) => return self.fail_later(e, done),
        };
        let shared = self.shared.clone();
        self.work.register(fd, Interest::WRITABLE, move |res| {
            let res = res.and_then(|_| shared.connected());
            if res.is_err() {
                shared.close();
            }
            done(res)
        });
    }

    fn close(&self, done: Done<()>) {
        self.shared.close();
        self.work.post(done);
    }

    fn close_try(&self) -> bool {
        self.shared.close();
        true
    }

    fn release(&self) {
        self.shared.close();
    }

    fn read(&self, buf: BytesMut, want: usize, done: ReadDone) {
        recv(self.shared.clone(), self.work.clone(), buf, want, done);
    }

    fn writ(&self, data: Bytes, done: Done<usize>) {
        send(self.shared.clone(), self.work.clone(), data, done);
    }

    fn task(&self, delay: Duration, done: Done<()>) {
        self.work.post_after(delay, done);
    }

    fn kill(&self) {
        self.shared.killed.set(true);
        if let Err(e) = self.shared.with_socket(|s| s.shutdown(Shutdown::Both)) {
            trace!(target: LOG, "sock.kill shutdown {}", e);
        }
        if self.work.kill() {
            trace!(target: LOG, "sock.kill cancelled outstanding work");
        }
    }

    fn attach(&self, signal: Arc<KillSignal>) {
        *self.shared.signal.borrow_mut() = Some(signal);
    }

    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Result<Interest> {
        if self.shared.killed.get() {
            return Err(Error::killed());
        }
        let fd = self.shared.fd().ok_or_else(Error::closed)?;
        poll_one(fd, interest, timeout).map_err(Error::from)
    }

    fn offset(&self) -> u64 {
        self.shared.transferred.get()
    }
}
