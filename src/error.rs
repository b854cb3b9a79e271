use std::{error, fmt, io};

/// Flat failure taxonomy used across the reactor.
///
/// Every fallible operation maps the underlying OS failure into one of these
/// kinds and records it in the reactor's last-error slot; a device torn down
/// asynchronously records the kind that halted it, readable through
/// [`Reactor::last_error`] from inside `on_close`.
///
/// [`Reactor::last_error`]: crate::Reactor::last_error
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NoMemory,
    InvalidArgument,
    NotSupported,
    BadHandle,
    WouldBlock,
    Interrupted,
    PipeClosed,
    ConnectionReset,
    ConnectionRefused,
    TimedOut,
    TooManyOpen,
    System,
    Internal,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            NoMemory => "out of memory",
            InvalidArgument => "invalid argument",
            NotSupported => "not supported",
            BadHandle => "bad handle",
            WouldBlock => "operation would block",
            Interrupted => "interrupted",
            PipeClosed => "pipe closed",
            ConnectionReset => "connection reset",
            ConnectionRefused => "connection refused",
            TimedOut => "timed out",
            TooManyOpen => "too many open handles",
            System => "system error",
            Internal => "internal error",
        }
    }
}

/// An error raised by a reactor operation or attached to a device teardown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    errno: Option<i32>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error { kind, errno: None }
    }

    /// Maps an OS failure into the flat taxonomy, keeping the raw errno.
    pub(crate) fn from_io(err: io::Error) -> Error {
        let errno = err.raw_os_error();
        let kind = match errno {
            Some(libc::ENOMEM) => ErrorKind::NoMemory,
            Some(libc::EINVAL) => ErrorKind::InvalidArgument,
            Some(libc::ENOTSUP) => ErrorKind::NotSupported,
            Some(libc::EBADF) => ErrorKind::BadHandle,
            Some(libc::EAGAIN) => ErrorKind::WouldBlock,
            Some(libc::EINTR) => ErrorKind::Interrupted,
            Some(libc::EPIPE) => ErrorKind::PipeClosed,
            Some(libc::ECONNRESET) => ErrorKind::ConnectionReset,
            Some(libc::ECONNREFUSED) => ErrorKind::ConnectionRefused,
            Some(libc::ETIMEDOUT) => ErrorKind::TimedOut,
            Some(libc::EMFILE) | Some(libc::ENFILE) => ErrorKind::TooManyOpen,
            Some(_) => ErrorKind::System,
            None => ErrorKind::Internal,
        };
        Error { kind, errno }
    }

    /// Shorthand for mapping `errno` after a raw syscall failed.
    pub(crate) fn last_os() -> Error {
        Error::from_io(io::Error::last_os_error())
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The raw OS error number, when the failure came from a syscall.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.errno
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new(kind)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errno {
            Some(no) => write!(f, "{} (os error {})", self.kind.as_str(), no),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

impl error::Error for Error {}
