//! Synchronous wrappers over stream operations.
//!
//! Each function issues one operation and drives the reactor until its
//! callback fires or the stream's timeout elapses. On timeout the stream is
//! killed, the reactor is driven until the killed operation has completed,
//! and [`ErrorKind::Timeout`](crate::ErrorKind::Timeout) is returned.
use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use log::debug;
use sluice_reactor::park::Park;
use sluice_reactor::Reactor;

use crate::transport::Interest;
use crate::{Error, Result, Stream};

const LOG: &str = "sluice::blocking";

type Slot<T> = Rc<RefCell<Option<Result<T>>>>;

fn complete<P, T>(reactor: &mut Reactor<P>, stream: &Stream, slot: &Slot<T>) -> Result<T>
where
    P: Park,
{
    let fired = reactor.run_until(|| slot.borrow().is_some(), stream.timeout())?;
    if !fired {
        debug!(target: LOG, "blocking timed out after {:?}", stream.timeout());
        stream.kill();
        reactor.run_until(|| slot.borrow().is_some(), None)?;
        // The killed result is dropped in favour of the timeout.
        slot.borrow_mut().take();
        return Err(Error::timeout());
    }
    match slot.borrow_mut().take() {
        Some(res) => res,
        None => Err(Error::timeout()),
    }
}

/// Open `stream`.
pub fn open<P: Park>(reactor: &mut Reactor<P>, stream: &Stream) -> Result<()> {
    let slot: Slot<()> = Rc::default();
    let tx = slot.clone();
    stream.open(move |_, res| *tx.borrow_mut() = Some(res));
    complete(reactor, stream, &slot)
}

/// Fill `buf` from `stream`.
///
/// Waits on the transport whenever a read comes back empty.
pub fn read_exact<P: Park>(reactor: &mut Reactor<P>, stream: &Stream, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let slot: Slot<Vec<u8>> = Rc::default();
        let tx = slot.clone();
        stream.read(buf.len() - filled, move |_, res| {
            *tx.borrow_mut() = Some(res.map(<[u8]>::to_vec))
        });
        let data = complete(reactor, stream, &slot)?;
        if data.is_empty() {
            let ready = stream.wait(Interest::READABLE, None)?;
            if ready.is_empty() {
                return Err(Error::timeout());
            }
            continue;
        }
        buf[filled..filled + data.len()].copy_from_slice(&data);
        filled += data.len();
    }
    Ok(())
}

/// Write all of `data` to `stream`.
///
/// Bytes may remain in the write cache; use [`sync`] to push them out.
pub fn write_all<P: Park>(reactor: &mut Reactor<P>, stream: &Stream, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let slot: Slot<usize> = Rc::default();
    let tx = slot.clone();
    stream.writ(Bytes::copy_from_slice(data), move |_, res| {
        *tx.borrow_mut() = Some(res)
    });
    complete(reactor, stream, &slot).map(drop)
}

/// Move `stream` to `offset`.
pub fn seek<P: Park>(reactor: &mut Reactor<P>, stream: &Stream, offset: u64) -> Result<u64> {
    let slot: Slot<u64> = Rc::default();
    let tx = slot.clone();
    stream.seek(offset, move |_, res| *tx.borrow_mut() = Some(res));
    complete(reactor, stream, &slot)
}

/// Flush and sync `stream`.
pub fn sync<P: Park>(reactor: &mut Reactor<P>, stream: &Stream, closing: bool) -> Result<()> {
    let slot: Slot<()> = Rc::default();
    let tx = slot.clone();
    stream.sync(closing, move |_, res| *tx.borrow_mut() = Some(res));
    complete(reactor, stream, &slot)
}

/// Close `stream`, flushing buffered writes.
pub fn close<P: Park>(reactor: &mut Reactor<P>, stream: &Stream) -> Result<()> {
    let slot: Slot<()> = Rc::default();
    let tx = slot.clone();
    stream.close(move |_, res| *tx.borrow_mut() = Some(res));
    complete(reactor, stream, &slot)
}
