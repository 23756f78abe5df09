//! The reactor: a fixed pool of event loops behind dial/listen entry points.

use std::any::Any;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::debug;
use net2::TcpBuilder;

use crate::acquire;
use crate::addr::{self, Addr, Scheme};
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::event_loop::{
    self, Command, CtxFactory, ListenKind, ListenerReg, LoopShared, Ring,
};
use crate::handler::Handler;
use crate::sys::{Ready, Token};

const LISTEN_BACKLOG: i32 = 1024;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Configures a [`Reactor`] before starting its loop pool.
#[derive(Debug, Clone)]
pub struct Builder {
    loops: usize,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            loops: num_cpus::get().max(1),
        }
    }

    /// Sets the number of event loops (and threads). Clamped to at least 1.
    pub fn loops(mut self, loops: usize) -> Builder {
        self.loops = loops.max(1);
        self
    }

    /// Starts the loop pool.
    ///
    /// Every selector and awakener is created up front; any failure aborts
    /// construction entirely rather than running with fewer loops than
    /// configured.
    pub fn build<H: Handler>(self, handler: H) -> io::Result<Reactor> {
        let mut shareds = Vec::with_capacity(self.loops);
        for id in 0..self.loops {
            shareds.push(LoopShared::new(id)?);
        }

        let ring = Arc::new(Ring::new(shareds));
        let handler = Arc::new(handler);

        let mut threads = Vec::with_capacity(self.loops);
        for shared in &ring.loops {
            let shared = shared.clone();
            let ring = ring.clone();
            let handler = handler.clone();
            let thread = thread::Builder::new()
                .name(format!("netloop-{}", shared.id))
                .spawn(move || event_loop::run(shared, ring, handler))?;
            threads.push(thread);
        }

        debug!("reactor started with {} loops", ring.loops.len());
        Ok(Reactor {
            ring,
            threads,
            terminated: AtomicBool::new(false),
        })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

/// A fixed pool of event loops with connection-establishment entry points.
///
/// Multiple reactors may coexist; each owns a disjoint pool of loops and
/// the connections assigned to them. Dropping the reactor shuts the pool
/// down, closing every owned connection first.
pub struct Reactor {
    ring: Arc<Ring>,
    threads: Vec<thread::JoinHandle<()>>,
    terminated: AtomicBool,
}

impl Reactor {
    /// Starts a reactor with one loop per CPU.
    pub fn new<H: Handler>(handler: H) -> io::Result<Reactor> {
        Builder::new().build(handler)
    }

    /// Number of event loops in the pool.
    pub fn loop_count(&self) -> usize {
        self.ring.loops.len()
    }

    /// Connects to `addr` and hands the connection to one of the loops.
    ///
    /// `addr` is of the form `scheme://host:port` or `scheme:///path` for
    /// unix-family schemes; a bare `host:port` defaults to `tcp://`. `ctx`
    /// is an opaque context attached to the connection, retrievable through
    /// [`Conn::context`]. Returns once the connection is registered; the
    /// `on_open` callback fires from the owning loop.
    pub fn dial<C: Any + Send>(&self, addr: &str, ctx: C) -> Result<Conn> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }

        let (scheme, address) = addr::parse(addr)?;
        let acquired = acquire::dial(scheme, &address)?;

        let target = self.ring.select();
        let conn = Conn::new(
            acquired.io.as_raw_fd(),
            acquired.local,
            acquired.remote,
            acquired.datagram,
            target.id,
            Arc::downgrade(target),
            Box::new(ctx),
        );

        event_loop::register_conn(target, conn.clone(), acquired.io)?;
        Ok(conn)
    }

    /// Binds a listening socket and hands it to one of the loops.
    ///
    /// Accepted connections run through the same descriptor acquisition and
    /// loop selection as dialed ones. `ctx` is cloned onto every accepted
    /// connection. Only stream schemes (`tcp*`, `unix`) can listen.
    pub fn listen<C: Any + Send + Clone>(&self, addr: &str, ctx: C) -> Result<Listener> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }

        let (scheme, address) = addr::parse(addr)?;
        let (kind, local) = bind(scheme, &address)?;

        let fd = match &kind {
            ListenKind::Tcp(l) => l.as_raw_fd(),
            ListenKind::Unix(l) => l.as_raw_fd(),
        };

        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let make_ctx: CtxFactory = Box::new(move || Box::new(ctx.clone()));

        let target = self.ring.select();
        target
            .selector
            .register(fd, Token(fd as usize), Ready::readable())
            .map_err(Error::Register)?;

        target.send(Command::RegisterListener(ListenerReg { id, kind, make_ctx }));

        Ok(Listener {
            id,
            fd,
            local,
            owner: Arc::downgrade(target),
        })
    }

    /// Stops every loop and joins its thread.
    ///
    /// Each loop closes all connections it owns (firing `on_close` once per
    /// connection) before exiting. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }

        for shared in &self.ring.loops {
            shared.shutdown.store(true, Ordering::Release);
            let _ = shared.awakener.wakeup();
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }

        debug!("reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("loops", &self.loop_count())
            .field("terminated", &self.terminated.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle to a listening socket owned by an event loop.
#[derive(Debug)]
pub struct Listener {
    id: u64,
    fd: RawFd,
    local: Addr,
    owner: Weak<LoopShared>,
}

impl Listener {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> &Addr {
        &self.local
    }

    /// Stops accepting and releases the listening socket. Idempotent;
    /// already accepted connections are unaffected.
    pub fn close(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.send(Command::CloseListener(self.fd, self.id));
        }
    }
}

fn bind(scheme: Scheme, address: &str) -> Result<(ListenKind, Addr)> {
    match scheme {
        Scheme::Tcp | Scheme::Tcp4 | Scheme::Tcp6 => {
            let sock_addr = resolve_bind_addr(scheme, address)?;

            let builder = if sock_addr.is_ipv4() {
                TcpBuilder::new_v4()
            } else {
                TcpBuilder::new_v6()
            }
            .map_err(Error::Connect)?;

            let listener = builder
                .reuse_address(true)
                .and_then(|b| b.bind(sock_addr))
                .and_then(|b| b.listen(LISTEN_BACKLOG))
                .map_err(Error::Connect)?;

            listener.set_nonblocking(true).map_err(Error::Acquire)?;
            let local = listener.local_addr().map(Addr::Ip).unwrap_or(Addr::Unnamed);
            Ok((ListenKind::Tcp(listener), local))
        }
        Scheme::Unix => {
            let listener = UnixListener::bind(address).map_err(Error::Connect)?;
            listener.set_nonblocking(true).map_err(Error::Acquire)?;
            let local = listener
                .local_addr()
                .map(|a| Addr::from_unix(&a))
                .unwrap_or(Addr::Unnamed);
            Ok((ListenKind::Unix(listener), local))
        }
        _ => Err(Error::Connect(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("listening on {} sockets is not supported", scheme),
        ))),
    }
}

fn resolve_bind_addr(scheme: Scheme, address: &str) -> Result<SocketAddr> {
    let want_v4 = match scheme {
        Scheme::Tcp4 => Some(true),
        Scheme::Tcp6 => Some(false),
        _ => None,
    };

    address
        .to_socket_addrs()
        .map_err(Error::Connect)?
        .find(|addr| match want_v4 {
            Some(true) => addr.is_ipv4(),
            Some(false) => addr.is_ipv6(),
            None => true,
        })
        .ok_or_else(|| {
            Error::Connect(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {} addresses for {}", scheme, address),
            ))
        })
}
