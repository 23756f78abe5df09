//! Application lifecycle callbacks.

use std::io;

use crate::conn::Conn;

/// Receives connection lifecycle events from the event loops.
///
/// Every callback is invoked from the thread of the loop that owns the
/// connection; no two callbacks for the same connection ever run
/// concurrently. Callbacks should not block: a stalled handler stalls every
/// connection assigned to that loop.
pub trait Handler: Send + Sync + 'static {
    /// A connection became ready: it is registered with its loop and `Open`.
    fn on_open(&self, conn: &Conn) {
        let _ = conn;
    }

    /// Bytes arrived on a connection.
    ///
    /// Returns the number of bytes consumed. For stream connections the
    /// unconsumed tail is retained and presented again, prepended to the
    /// next read. Datagram payloads are delivered whole, one datagram per
    /// call, and the return value is ignored for them.
    fn on_data(&self, conn: &Conn, data: &[u8]) -> usize {
        let _ = conn;
        data.len()
    }

    /// The connection reached `Closed` and its descriptor was released.
    ///
    /// Fires exactly once per connection. `err` carries the I/O error that
    /// forced teardown; it is `None` for EOF, application-initiated close,
    /// and reactor shutdown.
    fn on_close(&self, conn: &Conn, err: Option<&io::Error>) {
        let _ = conn;
        let _ = err;
    }
}
