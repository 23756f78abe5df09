//! Platform readiness multiplexer.
//!
//! One [`Selector`] wraps one kernel polling object (epoll on Linux, kqueue
//! on the BSDs and Darwin) and reports batches of [`Event`]s, each pairing a
//! [`Ready`] mask with the [`Token`] the descriptor was registered under.
//! The concrete selector is chosen at compile time; everything above this
//! module is platform independent.

pub mod event;
mod unix;

pub use self::event::{Event, Ready};
pub use self::unix::{
    dup_fd, pipe, set_cloexec, set_nonblock, take_socket_error, Awakener, Events, Io, Selector,
};

/// Associates readiness events with the descriptor they were registered for.
///
/// The reactor uses the descriptor's numeric value as its token, so an event
/// maps straight back to the owning connection. `Token(usize::MAX)` is
/// reserved for each loop's awakener.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl From<usize> for Token {
    fn from(val: usize) -> Token {
        Token(val)
    }
}

impl From<Token> for usize {
    fn from(val: Token) -> usize {
        val.0
    }
}

/// Token under which every loop registers its awakener.
pub const WAKE_TOKEN: Token = Token(usize::MAX);
