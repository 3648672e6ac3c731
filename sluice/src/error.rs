use std::io;

/// Result type returned by stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error delivered to stream completion callbacks.
///
/// The engine only distinguishes success from [`ErrorKind::Killed`]; every
/// other kind is produced by a transport and forwarded untouched.
#[derive(thiserror::Error, Debug)]
#[error("{kind}")]
pub struct Error {
    kind: ErrorKind,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, source: None }
    }

    /// Create an error of the given kind caused by an OS error.
    pub fn with_source(kind: ErrorKind, source: io::Error) -> Self {
        Self {
            kind,
            source: Some(source),
        }
    }

    /// The kind of error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the stream was killed while the operation was pending.
    pub fn is_killed(&self) -> bool {
        self.kind == ErrorKind::Killed
    }

    pub(crate) fn killed() -> Self {
        Self::new(ErrorKind::Killed)
    }

    pub(crate) fn closed() -> Self {
        Self::new(ErrorKind::Closed)
    }

    pub(crate) fn timeout() -> Self {
        Self::new(ErrorKind::Timeout)
    }

    pub(crate) fn unsupported() -> Self {
        Self::new(ErrorKind::Unsupported)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if sluice_reactor::is_cancelled(&err) {
            return Self::with_source(ErrorKind::Killed, err);
        }
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::FileDenied,
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectFailed,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::Unsupported => ErrorKind::Unsupported,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => ErrorKind::Closed,
            _ => ErrorKind::Unknown,
        };
        Self::with_source(kind, err)
    }
}

/// The kind of stream error.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The stream was killed before the operation could complete.
    #[error("the stream was killed")]
    Killed,
    /// The transport did not become ready in time.
    #[error("the operation timed out")]
    Timeout,
    /// The transport reached the end of its data or space.
    #[error("the stream is closed")]
    Closed,
    /// The transport does not implement the operation.
    #[error("the operation is not supported by this transport")]
    Unsupported,
    /// A transport failure with no specific classification.
    #[error("unknown transport error")]
    Unknown,
    /// The connection could not be established.
    #[error("failed to connect")]
    ConnectFailed,
    /// The host name could not be resolved.
    #[error("failed to resolve host")]
    DnsFailed,
    /// The file does not exist.
    #[error("file not found")]
    FileNotFound,
    /// Access to the file was denied.
    #[error("permission denied")]
    FileDenied,
    /// The TLS session failed.
    #[error("tls failure")]
    SslFailed,
    /// The server answered with an unexpected HTTP status.
    #[error("unexpected http status {0}")]
    HttpStatus(u16),
}
