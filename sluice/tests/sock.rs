use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use sluice::transport::SockTransport;
use sluice::{blocking, ErrorKind, Interest, StreamKind, StreamOptions};

mod util;
use util::*;

/// Accepts a single connection and echoes everything back until the peer
/// closes.
fn echo_server() -> TestResult<(u16, thread::JoinHandle<std::io::Result<usize>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let server = thread::spawn(move || -> std::io::Result<usize> {
        let (mut conn, _) = listener.accept()?;
        echo(&mut conn)
    });
    Ok((port, server))
}

fn echo(conn: &mut TcpStream) -> std::io::Result<usize> {
    let mut total = 0;
    let mut buf = [0u8; 1024];
    loop {
        let n = conn.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        conn.write_all(&buf[..n])?;
        total += n;
    }
}

#[test]
fn echo_roundtrip() -> TestResult<()> {
    let (port, server) = echo_server()?;
    with_poll_env(|reactor| {
        let stream = StreamOptions::new()
            .write_cache(32)
            .build(SockTransport::new("127.0.0.1", port));
        assert_eq!(stream.kind(), StreamKind::Socket);

        blocking::open(reactor, &stream)?;
        blocking::write_all(reactor, &stream, b"ping ")?;
        blocking::write_all(reactor, &stream, b"pong")?;
        assert_eq!(stream.buffered(), 9);
        blocking::sync(reactor, &stream, false)?;

        let mut buf = [0u8; 9];
        blocking::read_exact(reactor, &stream, &mut buf)?;
        assert_eq!(&buf, b"ping pong");
        assert_eq!(stream.offset(), 18);

        blocking::close(reactor, &stream)?;
        assert!(stream.is_closed());
        Ok(())
    })?;
    assert_eq!(server.join().expect("server panicked")?, 9);
    Ok(())
}

#[test]
fn read_flushes_pending_writes() -> TestResult<()> {
    let (port, server) = echo_server()?;
    with_poll_env(|reactor| {
        let stream = StreamOptions::new()
            .write_cache(64)
            .read_cache(16)
            .build(SockTransport::new("127.0.0.1", port));
        blocking::open(reactor, &stream)?;
        blocking::write_all(reactor, &stream, b"abc")?;

        // Without the implicit flush this would wait forever for the echo.
        let mut buf = [0u8; 3];
        blocking::read_exact(reactor, &stream, &mut buf)?;
        assert_eq!(&buf, b"abc");
        blocking::close(reactor, &stream)?;
        Ok(())
    })?;
    assert_eq!(server.join().expect("server panicked")?, 3);
    Ok(())
}

#[test]
fn kill_during_read_cancels_registration() -> TestResult<()> {
    let (port, server) = echo_server()?;
    with_poll_env(|reactor| {
        let stream = StreamOptions::new().build(SockTransport::new("127.0.0.1", port));
        blocking::open(reactor, &stream)?;

        let read = Slot::new();
        stream.read(16, capture_read(&read));
        let fired = reactor.run_until(|| !read.is_empty(), Some(Duration::from_millis(20)))?;
        assert!(!fired);

        stream.kill();
        reactor.run()?;
        assert_eq!(read.take().unwrap_err().kind(), ErrorKind::Killed);
        assert_eq!(
            stream.wait(Interest::READABLE, None).unwrap_err().kind(),
            ErrorKind::Killed
        );

        let closed = Slot::new();
        stream.close(capture(&closed));
        reactor.run()?;
        closed.take()?;
        Ok(())
    })?;
    assert_eq!(server.join().expect("server panicked")?, 0);
    Ok(())
}

#[test]
fn wait_reports_readiness() -> TestResult<()> {
    let (port, server) = echo_server()?;
    with_poll_env(|reactor| {
        let stream = StreamOptions::new().build(SockTransport::new("127.0.0.1", port));
        blocking::open(reactor, &stream)?;

        let idle = stream.wait(Interest::READABLE, Some(Duration::from_millis(10)))?;
        assert!(idle.is_empty());

        blocking::write_all(reactor, &stream, b"x")?;
        let ready = stream.wait(Interest::READABLE, Some(Duration::from_secs(5)))?;
        assert_eq!(ready, Interest::READABLE);

        blocking::close(reactor, &stream)?;
        Ok(())
    })?;
    server.join().expect("server panicked")?;
    Ok(())
}

#[test]
fn kill_handle_wakes_blocked_wait() -> TestResult<()> {
    let (port, server) = echo_server()?;
    with_poll_env(|reactor| {
        let stream = StreamOptions::new().build(SockTransport::new("127.0.0.1", port));
        blocking::open(reactor, &stream)?;

        let handle = stream.kill_handle();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.kill();
        });
        // The peer never sends, so only the kill can end this wait.
        let err = stream.wait(Interest::READABLE, None).unwrap_err();
        killer.join().expect("killer panicked");
        assert_eq!(err.kind(), ErrorKind::Killed);
        assert!(stream.is_killed());

        blocking::close(reactor, &stream)?;
        assert!(stream.is_closed());
        Ok(())
    })?;
    assert_eq!(server.join().expect("server panicked")?, 0);
    Ok(())
}

#[test]
fn kill_handle_interrupts_blocking_read() -> TestResult<()> {
    let (port, server) = echo_server()?;
    with_poll_env(|reactor| {
        let stream = StreamOptions::new().build(SockTransport::new("127.0.0.1", port));
        blocking::open(reactor, &stream)?;

        let handle = stream.kill_handle();
        let killer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            handle.kill();
        });
        let mut buf = [0u8; 4];
        let err = blocking::read_exact(reactor, &stream, &mut buf).unwrap_err();
        killer.join().expect("killer panicked");
        assert_eq!(err.kind(), ErrorKind::Killed);
        assert!(!stream.is_busy());
        Ok(())
    })?;
    assert_eq!(server.join().expect("server panicked")?, 0);
    Ok(())
}

#[test]
fn local_kill_shuts_socket_down() -> TestResult<()> {
    let (port, server) = echo_server()?;
    let stream = with_poll_env(|reactor| {
        let stream = StreamOptions::new().build(SockTransport::new("127.0.0.1", port));
        blocking::open(reactor, &stream)?;
        stream.kill();
        Ok(stream)
    })?;
    // The peer sees end of stream while the stream is still open.
    assert_eq!(server.join().expect("server panicked")?, 0);
    assert!(stream.is_opened());
    stream.release();
    Ok(())
}

#[test]
fn connect_refused() -> TestResult<()> {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?.port()
    };
    with_poll_env(|reactor| {
        let stream = StreamOptions::new().build(SockTransport::new("127.0.0.1", port));
        let err = blocking::open(reactor, &stream).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailed);
        assert!(stream.is_closed());
        Ok(())
    })
}

#[test]
fn unresolvable_host() -> TestResult<()> {
    with_poll_env(|reactor| {
        let stream = StreamOptions::new().build(SockTransport::new("host.invalid", 80));
        let err = blocking::open(reactor, &stream).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DnsFailed);
        assert!(stream.is_closed());
        Ok(())
    })
}
