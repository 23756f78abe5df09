//! The connection handle and its lifecycle state.
//!
//! A `Conn` is a cheap clone of a shared handle. The descriptor and all
//! mutable I/O state (buffers, interest) live inside the owning loop; the
//! handle only carries identity, addressing, the lifecycle state, and the
//! opaque application context. Everything the application asks of a
//! connection from outside the loop (send, close) is handed to the owning
//! loop through its command queue, preserving the single-writer discipline.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::addr::Addr;
use crate::error::{Error, Result};
use crate::event_loop::{Command, LoopShared};

/// Lifecycle state of a connection.
///
/// Transitions run strictly `Open` → `Closing` → `Closed` and are performed
/// only by the owning loop. `Closing` is observable while buffered outbound
/// bytes are still being flushed ahead of teardown.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Open,
    Closing,
    Closed,
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a connection owned by one event loop.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<Inner>,
}

struct Inner {
    /// Process-unique id; guards command dispatch against fd-number reuse.
    id: u64,
    fd: RawFd,
    local: Addr,
    remote: Addr,
    datagram: bool,
    loop_id: usize,
    state: AtomicU8,
    /// Back-reference only; a connection never extends its loop's lifetime.
    owner: Weak<LoopShared>,
    ctx: Mutex<Option<Box<dyn Any + Send>>>,
}

impl Conn {
    pub(crate) fn new(
        fd: RawFd,
        local: Addr,
        remote: Addr,
        datagram: bool,
        loop_id: usize,
        owner: Weak<LoopShared>,
        ctx: Box<dyn Any + Send>,
    ) -> Conn {
        Conn {
            inner: Arc::new(Inner {
                id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
                fd,
                local,
                remote,
                datagram,
                loop_id,
                state: AtomicU8::new(OPEN),
                owner,
                ctx: Mutex::new(Some(ctx)),
            }),
        }
    }

    /// The address this side of the connection is bound to.
    pub fn local_addr(&self) -> &Addr {
        &self.inner.local
    }

    /// The peer's address.
    pub fn remote_addr(&self) -> &Addr {
        &self.inner.remote
    }

    /// True for datagram transports (udp, unixgram).
    pub fn is_datagram(&self) -> bool {
        self.inner.datagram
    }

    /// Index of the event loop that owns this connection.
    pub fn loop_id(&self) -> usize {
        self.inner.loop_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        match self.inner.state.load(Ordering::Acquire) {
            OPEN => State::Open,
            CLOSING => State::Closing,
            _ => State::Closed,
        }
    }

    /// Queues `data` for the owning loop to flush.
    ///
    /// Fails with [`Error::Closed`] unless the connection is `Open`. The
    /// bytes are appended to the outbound buffer by the loop itself; a
    /// runtime write failure is reported through `on_close`, not here.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.state() != State::Open {
            return Err(Error::Closed);
        }

        let owner = self.inner.owner.upgrade().ok_or(Error::Closed)?;
        owner.send(Command::Write(self.clone(), data.to_vec()));
        Ok(())
    }

    /// Requests teardown of the connection.
    ///
    /// Idempotent and safe to call from any thread; concurrent close
    /// requests (including one racing a peer reset) collapse inside the
    /// owning loop, which closes the descriptor exactly once. Buffered
    /// outbound bytes are flushed best-effort first.
    pub fn close(&self) {
        if self.state() == State::Closed {
            return;
        }

        if let Some(owner) = self.inner.owner.upgrade() {
            owner.send(Command::Close(self.clone()));
        }
    }

    /// Replaces the opaque application context.
    pub fn set_context<C: Any + Send>(&self, ctx: C) {
        *self.inner.ctx.lock() = Some(Box::new(ctx));
    }

    /// Borrows the application context, if it has type `C`.
    pub fn context<C: Any>(&self) -> Option<MappedMutexGuard<'_, C>> {
        let guard = self.inner.ctx.lock();
        MutexGuard::try_map(guard, |slot| {
            slot.as_mut().and_then(|ctx| ctx.downcast_mut::<C>())
        })
        .ok()
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.inner.fd
    }

    pub(crate) fn set_state(&self, state: State) {
        let raw = match state {
            State::Open => OPEN,
            State::Closing => CLOSING,
            State::Closed => CLOSED,
        };
        self.inner.state.store(raw, Ordering::Release);
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("fd", &self.inner.fd)
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .field("loop", &self.inner.loop_id)
            .finish()
    }
}
