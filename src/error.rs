//! Error taxonomy for connection establishment and connection handles.
//!
//! Runtime I/O failures on an established connection are deliberately not
//! represented here: they are reported through [`Handler::on_close`] with the
//! offending `io::Error` as the close reason.
//!
//! [`Handler::on_close`]: ../trait.Handler.html#method.on_close

use std::error;
use std::fmt;
use std::io;

/// A specialized `Result` for reactor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by `dial`, `listen` and the `Conn` handle.
///
/// Each establishment step fails distinctly: a malformed address never
/// reaches the connect path, a connect failure never leaves a descriptor
/// behind, and an acquisition or registration failure closes the duplicated
/// descriptor before returning.
#[derive(Debug)]
pub enum Error {
    /// The address string could not be parsed, or names an unknown scheme.
    Addr(String),
    /// The underlying connect (or bind, for listeners) failed. Carries the
    /// OS error verbatim; no retry is attempted.
    Connect(io::Error),
    /// Duplicating the descriptor or switching it to non-blocking mode
    /// failed. The duplicate, if any, has already been closed.
    Acquire(io::Error),
    /// The readiness multiplexer rejected the descriptor. The descriptor has
    /// already been closed; it never entered a loop's ownership.
    Register(io::Error),
    /// The connection is no longer open.
    Closed,
    /// The reactor has been shut down.
    Terminated,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Addr(addr) => write!(f, "invalid address: {}", addr),
            Error::Connect(e) => write!(f, "connect failed: {}", e),
            Error::Acquire(e) => write!(f, "descriptor acquisition failed: {}", e),
            Error::Register(e) => write!(f, "multiplexer registration failed: {}", e),
            Error::Closed => f.write_str("connection closed"),
            Error::Terminated => f.write_str("reactor terminated"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Connect(e) | Error::Acquire(e) | Error::Register(e) => Some(e),
            _ => None,
        }
    }
}
