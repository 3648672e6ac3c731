//! Non-blocking streams over pluggable transports.
//!
//! A [`Stream`] layers read and write caching, multi-stage operation
//! chaining ("open then read", "flush then seek") and cooperative
//! cancellation over a [`Transport`]. Every operation takes a completion
//! callback which fires exactly once, on the thread driving the
//! [`Reactor`](sluice_reactor::Reactor).
//!
//! ```no_run
//! use sluice::transport::DataTransport;
//! use sluice::{Stream, StreamOptions};
//! use sluice_reactor::park::PollPark;
//! use sluice_reactor::{Clock, Reactor};
//!
//! let mut reactor = Reactor::new(PollPark::new(), Clock::system());
//! let _guard = reactor.enter();
//!
//! let stream = StreamOptions::new()
//!     .write_cache(64)
//!     .build(DataTransport::with_len(1024));
//! stream.open_writ(&b"hello"[..], |_, res| assert_eq!(res.unwrap(), 5));
//! reactor.run().unwrap();
//! ```
//!
//! # Modules
//! - [`transport`]: the backend contract and the bundled data, file and
//!   socket transports.
//! - [`blocking`]: synchronous wrappers that drive a reactor until an
//!   operation completes.
#![cfg(unix)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]

pub mod blocking;
mod cache;
mod config;
mod error;
mod kill;
mod pending;
mod state;
mod stream;
pub mod transport;

pub use config::StreamOptions;
pub use error::{Error, ErrorKind, Result};
pub use kill::{KillHandle, KillSignal};
pub use state::State;
pub use stream::{
    CloseFn, OpenFn, ReadFn, SeekFn, Stream, SyncFn, TaskFn, WritFn,
};
pub use transport::{Interest, StreamKind, Transport};
