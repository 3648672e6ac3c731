use std::rc::Rc;
use std::time::Duration;

use crate::transport::Transport;
use crate::Stream;

/// Options which configure the caches and timeout of a [`Stream`].
///
/// All caches are disabled and no timeout is set by default.
///
/// ```no_run
/// # use sluice::{StreamOptions, transport::DataTransport};
/// let stream = StreamOptions::new()
///     .read_cache(4096)
///     .write_cache(4096)
///     .build(DataTransport::with_len(1 << 16));
/// ```
#[derive(Debug, Copy, Clone, Default)]
pub struct StreamOptions {
    pub(crate) read_cache: usize,
    pub(crate) write_cache: usize,
    pub(crate) timeout: Option<Duration>,
}

impl StreamOptions {
    /// Creates a blank new set of options ready for configuration.
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    /// Sets the size of the read scratch buffer.
    ///
    /// When non-zero, reads are clamped to this size and share one buffer.
    pub fn read_cache(&mut self, size: usize) -> &mut Self {
        self.read_cache = size;
        self
    }

    /// Sets the size of the write-coalescing buffer.
    ///
    /// Writes are buffered until this many bytes are pending. Zero sends
    /// every write straight to the transport.
    pub fn write_cache(&mut self, size: usize) -> &mut Self {
        self.write_cache = size;
        self
    }

    /// Sets the timeout passed to [`Stream::wait`] and used by the
    /// [`blocking`](crate::blocking) wrappers.
    pub fn timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Create a stream bound to `transport` with these options.
    pub fn build<T>(&self, transport: T) -> Stream
    where
        T: Transport + 'static,
    {
        Stream::with_options(Rc::new(transport), *self)
    }
}
