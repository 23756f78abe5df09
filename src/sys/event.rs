//! Readiness event types.

use std::{fmt, ops};

use super::Token;

/// A set of readiness event kinds.
///
/// `Ready` is a set of operation descriptors indicating which kind of
/// operation is ready to be performed on a descriptor. Readable and writable
/// readiness can also be registered as interest; error and hup are only ever
/// reported by the selector, never requested.
///
/// `Ready` values can be combined together using the various bitwise
/// operators.
///
/// # Examples
///
/// ```
/// use netloop::sys::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

impl Ready {
    /// Returns the empty `Ready` set.
    #[inline]
    pub fn empty() -> Ready {
        Ready(0)
    }

    /// Returns a `Ready` representing readable readiness.
    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    /// Returns a `Ready` representing writable readiness.
    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    /// Returns a `Ready` representing an error condition on the descriptor.
    ///
    /// The descriptor will usually also report readable or writable;
    /// performing the operation surfaces the underlying error.
    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Returns a `Ready` representing a hangup: the remote end of the
    /// socket shut down, or the descriptor was disconnected.
    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    /// Returns true if `Ready` is the empty set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the value includes readable readiness.
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    /// Returns true if the value includes writable readiness.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    /// Returns true if the value includes an error condition.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::error())
    }

    /// Returns true if the value includes a hangup.
    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::hup())
    }

    /// Adds all readiness represented by `other` into `self`.
    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all readiness represented by `other` from `self`.
    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

/// A readiness event returned by [`Selector::select`].
///
/// An `Event` is a readiness state paired with the [`Token`] its descriptor
/// was registered under.
///
/// [`Selector::select`]: struct.Selector.html#method.select
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    /// Creates a new `Event` containing `readiness` and `token`.
    pub fn new(readiness: Ready, token: Token) -> Event {
        Event {
            kind: readiness,
            token,
        }
    }

    /// Returns the event's readiness.
    pub fn readiness(&self) -> Ready {
        self.kind
    }

    /// Returns the event's token.
    pub fn token(&self) -> Token {
        self.token
    }
}

#[cfg(test)]
mod tests {
    use super::Ready;

    #[test]
    fn test_debug_ready() {
        assert_eq!("(empty)", format!("{:?}", Ready::empty()));
        assert_eq!("Readable", format!("{:?}", Ready::readable()));
        assert_eq!("Writable", format!("{:?}", Ready::writable()));
        assert_eq!(
            "Readable | Hup",
            format!("{:?}", Ready::readable() | Ready::hup())
        );
    }

    #[test]
    fn test_ready_ops() {
        let mut ready = Ready::readable();
        ready.insert(Ready::writable());
        assert!(ready.contains(Ready::readable() | Ready::writable()));

        ready.remove(Ready::readable());
        assert!(!ready.is_readable());
        assert!(ready.is_writable());

        assert!((ready - Ready::writable()).is_empty());
    }
}
