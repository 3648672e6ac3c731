use std::cell::Cell;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sluice::transport::{DataTransport, Done, ReadDone};
use sluice::{blocking, Error, ErrorKind, StreamKind, StreamOptions, Transport};
use sluice_reactor::{Handle, TaskId};

mod util;
use util::*;

/// Delivers reads only after `delay`, unless killed first.
#[derive(Debug)]
struct Slow {
    inner: DataTransport,
    handle: Handle,
    delay: Duration,
    timer: Cell<Option<TaskId>>,
}

impl Slow {
    fn new(data: &[u8], delay: Duration) -> Self {
        Self {
            inner: DataTransport::new(data),
            handle: Handle::current(),
            delay,
            timer: Cell::new(None),
        }
    }
}

impl Transport for Slow {
    fn kind(&self) -> StreamKind {
        self.inner.kind()
    }

    fn open(&self, done: Done<()>) {
        self.inner.open(done)
    }

    fn close(&self, done: Done<()>) {
        self.inner.close(done)
    }

    fn read(&self, buf: BytesMut, want: usize, done: ReadDone) {
        let inner = self.inner.region();
        let id = self.handle.post_after(self.delay, move |fired| match fired {
            Ok(_) => {
                let mut buf = buf;
                let data = inner.contents();
                let n = want.min(data.len());
                buf.extend_from_slice(&data[..n]);
                done(buf, Ok(n))
            }
            Err(e) => done(buf, Err(Error::from(e))),
        });
        self.timer.set(Some(id));
    }

    fn writ(&self, data: Bytes, done: Done<usize>) {
        self.inner.writ(data, done)
    }

    fn kill(&self) {
        if let Some(id) = self.timer.take() {
            self.handle.cancel(id);
        }
        self.inner.kill()
    }

    fn offset(&self) -> u64 {
        self.inner.offset()
    }
}

#[test]
fn open_write_seek_read_close() -> TestResult<()> {
    with_test_env(|reactor| {
        let transport = DataTransport::with_len(32);
        let region = transport.region();
        let stream = StreamOptions::new()
            .write_cache(8)
            .read_cache(4)
            .build(transport);

        blocking::open(reactor, &stream)?;
        blocking::write_all(reactor, &stream, b"abc")?;
        blocking::write_all(reactor, &stream, b"defgh")?;
        assert_eq!(region.written(), b"abcdefgh");
        blocking::write_all(reactor, &stream, b"ij")?;
        blocking::write_all(reactor, &stream, b"")?;
        blocking::sync(reactor, &stream, false)?;
        assert_eq!(region.written(), b"abcdefghij");

        assert_eq!(blocking::seek(reactor, &stream, 2)?, 2);
        let mut buf = [0u8; 6];
        blocking::read_exact(reactor, &stream, &mut buf)?;
        assert_eq!(&buf, b"cdefgh");
        assert_eq!(stream.offset(), 8);

        blocking::close(reactor, &stream)?;
        assert!(stream.is_closed());
        Ok(())
    })
}

#[test]
fn read_past_end_is_closed() -> TestResult<()> {
    with_test_env(|reactor| {
        let stream = StreamOptions::new().build(DataTransport::new(&b"xy"[..]));
        blocking::open(reactor, &stream)?;

        let mut buf = [0u8; 3];
        let err = blocking::read_exact(reactor, &stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert_eq!(&buf[..2], b"xy");
        Ok(())
    })
}

#[test]
fn timeout_kills_the_operation() -> TestResult<()> {
    with_test_env(|reactor| {
        let stream = StreamOptions::new()
            .timeout(Some(Duration::from_secs(1)))
            .build(Slow::new(b"late", Duration::from_secs(60)));
        blocking::open(reactor, &stream)?;

        let mut buf = [0u8; 4];
        let err = blocking::read_exact(reactor, &stream, &mut buf).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(stream.is_killed());
        assert!(!stream.is_busy());
        assert!(reactor.is_idle());
        Ok(())
    })
}

#[test]
fn slow_read_within_timeout() -> TestResult<()> {
    with_test_env(|reactor| {
        let stream = StreamOptions::new()
            .timeout(Some(Duration::from_secs(10)))
            .build(Slow::new(b"soon", Duration::from_secs(2)));
        blocking::open(reactor, &stream)?;

        let mut buf = [0u8; 4];
        blocking::read_exact(reactor, &stream, &mut buf)?;
        assert_eq!(&buf, b"soon");
        assert!(!stream.is_killed());
        Ok(())
    })
}
