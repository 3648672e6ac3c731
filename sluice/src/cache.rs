//! Read scratch buffer and write-coalescing buffer owned by a stream.
use bytes::{Bytes, BytesMut};

/// A reusable buffer handed to the transport for reads.
///
/// This is not a read-ahead cache: it only saves an allocation per read.
#[derive(Debug)]
pub(crate) struct ReadCache {
    buf: Option<BytesMut>,
    max: usize,
}

impl ReadCache {
    pub(crate) fn new(max: usize) -> Self {
        Self { buf: None, max }
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    /// Take the scratch buffer along with the number of bytes to request.
    ///
    /// With caching enabled the request is clamped to the configured
    /// maximum, and zero asks for the maximum. Without caching the caller's
    /// size is passed through, where zero lets the transport choose.
    pub(crate) fn acquire(&mut self, size: usize) -> (BytesMut, usize) {
        if self.max == 0 {
            return (BytesMut::with_capacity(size), size);
        }
        let mut buf = self
            .buf
            .take()
            .unwrap_or_else(|| BytesMut::with_capacity(self.max));
        buf.clear();
        if buf.capacity() < self.max {
            buf.reserve(self.max);
        }
        let want = if size == 0 { self.max } else { size.min(self.max) };
        (buf, want)
    }

    /// Return a buffer taken with [`ReadCache::acquire`].
    pub(crate) fn release(&mut self, mut buf: BytesMut) {
        if self.max > 0 && self.buf.is_none() {
            buf.clear();
            self.buf = Some(buf);
        }
    }
}

/// Coalesces small writes until the configured maximum is reached.
#[derive(Debug)]
pub(crate) struct WriteCache {
    buf: BytesMut,
    max: usize,
}

impl WriteCache {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max,
        }
    }

    pub(crate) fn max(&self) -> usize {
        self.max
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn push(&mut self, data: &[u8]) {
        if self.buf.capacity() == 0 {
            self.buf.reserve(self.max.max(data.len()));
        }
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.buf.len() >= self.max
    }

    /// Remove all buffered bytes, keeping the allocation for reuse.
    pub(crate) fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    /// Put bytes that could not be written back in front of the cache.
    pub(crate) fn restore(&mut self, remainder: Bytes) {
        if remainder.is_empty() {
            return;
        }
        let mut buf = BytesMut::with_capacity(remainder.len() + self.buf.len());
        buf.extend_from_slice(&remainder);
        buf.extend_from_slice(&self.buf);
        self.buf = buf;
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_cache_clamps_to_max() {
        let mut cache = ReadCache::new(16);
        let (buf, want) = cache.acquire(64);
        assert_eq!(want, 16);
        assert!(buf.capacity() >= 16);
        cache.release(buf);

        let (buf, want) = cache.acquire(0);
        assert_eq!(want, 16);
        cache.release(buf);

        let (_, want) = cache.acquire(4);
        assert_eq!(want, 4);
    }

    #[test]
    fn read_cache_disabled_passes_size_through() {
        let mut cache = ReadCache::new(0);
        let (buf, want) = cache.acquire(100);
        assert_eq!(want, 100);
        cache.release(buf);
        assert!(cache.buf.is_none());
        assert_eq!(cache.acquire(0).1, 0);
    }

    #[test]
    fn write_cache_fills_and_takes() {
        let mut cache = WriteCache::new(8);
        cache.push(b"abcde");
        assert!(!cache.is_full());
        cache.push(b"fghij");
        assert!(cache.is_full());
        assert_eq!(cache.take(), Bytes::from_static(b"abcdefghij"));
        assert!(cache.is_empty());
    }

    #[test]
    fn restore_prepends_remainder() {
        let mut cache = WriteCache::new(8);
        cache.push(b"xy");
        cache.restore(Bytes::from_static(b"ab"));
        assert_eq!(cache.take(), Bytes::from_static(b"abxy"));
    }
}
