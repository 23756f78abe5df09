//! The poll-dispatch cycle.
//!
//! Each loop runs on its own OS thread and is the only writer of the
//! connections it owns: the fd → entry map, the buffers, and the interest
//! set are touched exclusively by the loop's thread. Other threads interact
//! with a loop through [`LoopShared`]: a command queue drained at the start
//! of every cycle iteration, paired with a pipe awakener that unblocks the
//! selector. Selector registration itself is thread-safe, so descriptors
//! are registered on the caller's thread (surfacing registration errors
//! synchronously from dial) while map insertion is handed off.
//!
//! Dispatch order within one readiness event is fixed: error/hangup first
//! (forcing teardown), then writability (flush), then readability.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::mem;
use std::net;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net as unix_net;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::acquire::{self, Acquired};
use crate::conn::{Conn, State};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::sys::{self, Awakener, Event, Events, Io, Ready, Selector, Token, WAKE_TOKEN};

const EVENTS_CAPACITY: usize = 1024;
const READ_BUF_SIZE: usize = 64 * 1024;

/// A request handed to a loop from another thread (or another loop).
pub(crate) enum Command {
    /// Take ownership of a freshly registered connection.
    Register(Conn, Io),
    /// Append bytes to a connection's outbound buffer and flush.
    Write(Conn, Vec<u8>),
    /// Tear a connection down, flushing buffered bytes best-effort.
    Close(Conn),
    /// Take ownership of a listening socket.
    RegisterListener(ListenerReg),
    /// Close a listening socket.
    CloseListener(RawFd, u64),
}

/// The listening socket variants a loop can own.
pub(crate) enum ListenKind {
    Tcp(net::TcpListener),
    Unix(unix_net::UnixListener),
}

/// Produces the per-connection context stamped onto accepted connections.
pub(crate) type CtxFactory = Box<dyn Fn() -> Box<dyn Any + Send> + Send>;

pub(crate) struct ListenerReg {
    pub(crate) id: u64,
    pub(crate) kind: ListenKind,
    pub(crate) make_ctx: CtxFactory,
}

/// State of one loop that is shared across threads.
///
/// The selector supports thread-safe registration; everything else mutable
/// here is the command queue and the shutdown flag.
pub(crate) struct LoopShared {
    pub(crate) id: usize,
    pub(crate) selector: Selector,
    pub(crate) awakener: Awakener,
    pub(crate) shutdown: AtomicBool,
    queue: Mutex<Vec<Command>>,
}

impl LoopShared {
    pub(crate) fn new(id: usize) -> io::Result<Arc<LoopShared>> {
        let selector = Selector::new()?;
        let awakener = Awakener::new()?;
        awakener.register(&selector, WAKE_TOKEN)?;

        Ok(Arc::new(LoopShared {
            id,
            selector,
            awakener,
            shutdown: AtomicBool::new(false),
            queue: Mutex::new(Vec::new()),
        }))
    }

    /// Enqueues a command and wakes the loop.
    pub(crate) fn send(&self, cmd: Command) {
        self.queue.lock().push(cmd);
        if let Err(e) = self.awakener.wakeup() {
            warn!("loop {}: failed to wake: {}", self.id, e);
        }
    }

    fn drain(&self) -> Vec<Command> {
        mem::replace(&mut *self.queue.lock(), Vec::new())
    }
}

/// The fixed pool of loops plus the selection policy.
///
/// Selection is a round-robin counter over the pool: deterministic, O(1),
/// and load-spreading. Over N sequential registrations no loop receives
/// more than ⌈N / loops⌉ + 1 connections.
pub(crate) struct Ring {
    pub(crate) loops: Vec<Arc<LoopShared>>,
    next: AtomicUsize,
}

impl Ring {
    pub(crate) fn new(loops: Vec<Arc<LoopShared>>) -> Ring {
        Ring {
            loops,
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn select(&self) -> &Arc<LoopShared> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[idx]
    }
}

/// Registers a connection's descriptor with `target`'s selector and hands
/// the connection itself to the loop through the command queue.
///
/// On registration failure the descriptor is closed here (it never entered
/// the loop's ownership) and the error is surfaced to the caller. `EEXIST`
/// means the fd is already registered somewhere, which is a programming
/// error in fd accounting.
pub(crate) fn register_conn(target: &Arc<LoopShared>, conn: Conn, io: Io) -> Result<()> {
    let fd = io.as_raw_fd();

    if let Err(e) = target
        .selector
        .register(fd, Token(fd as usize), Ready::readable())
    {
        if e.raw_os_error() == Some(libc::EEXIST) {
            error!("loop {}: fd {} is already registered", target.id, fd);
        }
        // `io` drops on return, closing the duplicate descriptor.
        return Err(Error::Register(e));
    }

    target.send(Command::Register(conn, io));
    Ok(())
}

/// Entry point for a loop thread.
pub(crate) fn run<H: Handler>(shared: Arc<LoopShared>, ring: Arc<Ring>, handler: Arc<H>) {
    EventLoop {
        shared,
        ring,
        handler,
        conns: HashMap::new(),
        listeners: HashMap::new(),
        events: Events::with_capacity(EVENTS_CAPACITY),
        batch: Vec::new(),
        readbuf: vec![0u8; READ_BUF_SIZE],
    }
    .run();
}

/// Per-connection state owned exclusively by the loop thread.
struct ConnEntry {
    conn: Conn,
    io: Io,
    /// Unconsumed inbound bytes retained from a previous `on_data` call.
    inbuf: Vec<u8>,
    /// Outbound bytes not yet accepted by the socket.
    outbuf: OutBuf,
    interest: Ready,
    /// Graceful teardown requested; finish once `outbuf` drains.
    closing: bool,
}

/// Outbound buffering. Streams coalesce into one byte buffer; datagram
/// connections keep one entry per datagram so a send queued during
/// WouldBlock never merges with its neighbor on the wire.
enum OutBuf {
    Stream(Vec<u8>),
    Datagram(VecDeque<Vec<u8>>),
}

impl OutBuf {
    fn new(datagram: bool) -> OutBuf {
        if datagram {
            OutBuf::Datagram(VecDeque::new())
        } else {
            OutBuf::Stream(Vec::new())
        }
    }

    fn push(&mut self, data: Vec<u8>) {
        match self {
            OutBuf::Stream(buf) => buf.extend_from_slice(&data),
            OutBuf::Datagram(queue) => queue.push_back(data),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            OutBuf::Stream(buf) => buf.is_empty(),
            OutBuf::Datagram(queue) => queue.is_empty(),
        }
    }
}

struct ListenerEntry {
    id: u64,
    kind: ListenKind,
    make_ctx: CtxFactory,
}

struct EventLoop<H: Handler> {
    shared: Arc<LoopShared>,
    ring: Arc<Ring>,
    handler: Arc<H>,
    conns: HashMap<RawFd, ConnEntry>,
    listeners: HashMap<RawFd, ListenerEntry>,
    events: Events,
    batch: Vec<Event>,
    readbuf: Vec<u8>,
}

impl<H: Handler> EventLoop<H> {
    fn run(&mut self) {
        debug!("loop {} started", self.shared.id);

        loop {
            self.drain_commands();

            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            match self.shared.selector.select(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("loop {}: selector wait failed: {}", self.shared.id, e);
                    break;
                }
            }

            let mut batch = mem::replace(&mut self.batch, Vec::new());
            batch.clear();
            batch.extend(self.events.iter());

            for event in &batch {
                self.dispatch(*event);
            }

            self.batch = batch;
        }

        self.teardown();
        debug!("loop {} stopped", self.shared.id);
    }

    fn drain_commands(&mut self) {
        for cmd in self.shared.drain() {
            match cmd {
                Command::Register(conn, io) => self.register(conn, io),
                Command::Write(conn, data) => self.write(conn, data),
                Command::Close(conn) => self.request_close(&conn),
                Command::RegisterListener(reg) => {
                    let fd = match &reg.kind {
                        ListenKind::Tcp(l) => l.as_raw_fd(),
                        ListenKind::Unix(l) => l.as_raw_fd(),
                    };
                    trace!("loop {}: listener fd {} registered", self.shared.id, fd);
                    self.listeners.insert(
                        fd,
                        ListenerEntry {
                            id: reg.id,
                            kind: reg.kind,
                            make_ctx: reg.make_ctx,
                        },
                    );
                }
                Command::CloseListener(fd, id) => {
                    if self.listeners.get(&fd).map_or(false, |l| l.id == id) {
                        let _ = self.shared.selector.deregister(fd);
                        self.listeners.remove(&fd);
                        trace!("loop {}: listener fd {} closed", self.shared.id, fd);
                    }
                }
            }
        }
    }

    fn register(&mut self, conn: Conn, io: Io) {
        let fd = io.as_raw_fd();

        if self.conns.contains_key(&fd) {
            // The selector would have rejected the duplicate registration,
            // so this means fd accounting is broken.
            error!("loop {}: fd {} already owned, dropping it", self.shared.id, fd);
            return;
        }

        trace!("loop {}: conn fd {} registered", self.shared.id, fd);
        let entry = ConnEntry {
            conn: conn.clone(),
            io,
            inbuf: Vec::new(),
            outbuf: OutBuf::new(conn.is_datagram()),
            interest: Ready::readable(),
            closing: false,
        };
        self.conns.insert(fd, entry);

        self.handler.on_open(&conn);
    }

    fn write(&mut self, conn: Conn, data: Vec<u8>) {
        let fd = conn.fd();
        let len = data.len();
        let queued = match self.conns.get_mut(&fd) {
            Some(entry) if entry.conn.id() == conn.id() && !entry.closing => {
                entry.outbuf.push(data);
                true
            }
            _ => false,
        };

        if queued {
            self.flush(fd);
        } else {
            trace!(
                "loop {}: dropping {} byte write for closed conn",
                self.shared.id,
                len
            );
        }
    }

    fn request_close(&mut self, conn: &Conn) {
        let fd = conn.fd();
        // Already torn down or already closing: concurrent close requests
        // collapse here.
        let proceed = match self.conns.get_mut(&fd) {
            Some(entry) if entry.conn.id() == conn.id() && !entry.closing => {
                entry.closing = true;
                entry.conn.set_state(State::Closing);
                true
            }
            _ => false,
        };

        // Finalizes immediately if nothing is buffered.
        if proceed {
            self.flush(fd);
        }
    }

    fn dispatch(&mut self, event: Event) {
        let token = event.token();

        if token == WAKE_TOKEN {
            self.shared.awakener.cleanup();
            return;
        }

        let fd = token.0 as RawFd;
        let ready = event.readiness();

        if self.conns.contains_key(&fd) {
            self.dispatch_conn(fd, ready);
        } else if self.listeners.contains_key(&fd) {
            self.accept_ready(fd);
        } else {
            trace!("loop {}: event for unknown fd {}", self.shared.id, fd);
        }
    }

    fn dispatch_conn(&mut self, fd: RawFd, ready: Ready) {
        if ready.is_error() {
            let err = match sys::take_socket_error(fd) {
                Ok(err) => err,
                Err(e) => Some(e),
            };
            self.finalize(fd, err);
            return;
        }

        if ready.is_writable() {
            self.flush(fd);
        }

        // A hangup arrives in the same event as the peer's final bytes
        // (write-then-close), so it must not short-circuit the read side:
        // drain everything pending and let the zero-length read perform
        // the teardown. flush may have finalized the entry; read_ready
        // re-checks.
        if ready.is_readable() || ready.is_hup() {
            self.read_ready(fd, ready.is_hup());
        }
    }

    /// One read per call normally; with `drain` set (hangup pending) reads
    /// repeat until EOF or the socket runs dry.
    fn read_ready(&mut self, fd: RawFd, drain: bool) {
        loop {
            let (n, datagram, closing) = {
                let entry = match self.conns.get_mut(&fd) {
                    Some(entry) => entry,
                    None => return,
                };
                let n = (&entry.io).read(&mut self.readbuf);
                (n, entry.conn.is_datagram(), entry.closing)
            };

            match n {
                Ok(0) if !datagram => {
                    // Stream EOF: flush what is buffered, then tear down.
                    self.request_eof_close(fd);
                    return;
                }
                Ok(n) => {
                    if !closing {
                        self.deliver(fd, n, datagram);
                    }
                    if !drain || datagram {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("loop {}: read error on fd {}: {}", self.shared.id, fd, e);
                    self.finalize(fd, Some(e));
                    return;
                }
            }
        }
    }

    fn deliver(&mut self, fd: RawFd, n: usize, datagram: bool) {
        let entry = match self.conns.get_mut(&fd) {
            Some(entry) => entry,
            None => return,
        };

        if datagram {
            // One read is one datagram, delivered whole; there is no
            // carry-over between datagrams.
            self.handler.on_data(&entry.conn, &self.readbuf[..n]);
            return;
        }

        if entry.inbuf.is_empty() {
            let consumed = self.handler.on_data(&entry.conn, &self.readbuf[..n]);
            if consumed < n {
                entry.inbuf.extend_from_slice(&self.readbuf[consumed..n]);
            }
        } else {
            entry.inbuf.extend_from_slice(&self.readbuf[..n]);
            let buf = mem::replace(&mut entry.inbuf, Vec::new());
            let consumed = std::cmp::min(self.handler.on_data(&entry.conn, &buf), buf.len());
            if consumed < buf.len() {
                entry.inbuf = buf[consumed..].to_vec();
            }
        }
    }

    /// Flushes the outbound buffer as far as the socket accepts, maintains
    /// write interest, and completes a pending graceful close once drained.
    fn flush(&mut self, fd: RawFd) {
        enum After {
            Keep,
            Finalize(Option<io::Error>),
            Interest(Ready),
        }

        let after = {
            let entry = match self.conns.get_mut(&fd) {
                Some(entry) => entry,
                None => return,
            };

            let mut failed = None;
            loop {
                match &mut entry.outbuf {
                    OutBuf::Stream(buf) => {
                        if buf.is_empty() {
                            break;
                        }
                        match (&entry.io).write(buf) {
                            Ok(0) => {
                                failed = Some(io::Error::new(
                                    io::ErrorKind::WriteZero,
                                    "socket accepted no bytes",
                                ));
                                break;
                            }
                            Ok(n) => {
                                buf.drain(..n);
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                failed = Some(e);
                                break;
                            }
                        }
                    }
                    OutBuf::Datagram(queue) => {
                        let front = match queue.front() {
                            Some(front) => front,
                            None => break,
                        };
                        // One syscall per queue entry; a datagram goes out
                        // whole or not at all.
                        match (&entry.io).write(front) {
                            Ok(_) => {
                                queue.pop_front();
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                failed = Some(e);
                                break;
                            }
                        }
                    }
                }
            }

            if let Some(e) = failed {
                debug!("loop {}: write error on fd {}: {}", self.shared.id, fd, e);
                After::Finalize(Some(e))
            } else if entry.outbuf.is_empty() {
                if entry.closing {
                    After::Finalize(None)
                } else if entry.interest.is_writable() {
                    After::Interest(Ready::readable())
                } else {
                    After::Keep
                }
            } else if !entry.interest.is_writable() {
                After::Interest(Ready::readable() | Ready::writable())
            } else {
                After::Keep
            }
        };

        match after {
            After::Keep => {}
            After::Finalize(err) => self.finalize(fd, err),
            After::Interest(interest) => self.set_interest(fd, interest),
        }
    }

    fn set_interest(&mut self, fd: RawFd, interest: Ready) {
        if !self.conns.contains_key(&fd) {
            return;
        }

        match self
            .shared
            .selector
            .reregister(fd, Token(fd as usize), interest)
        {
            Ok(()) => {
                if let Some(entry) = self.conns.get_mut(&fd) {
                    entry.interest = interest;
                }
            }
            Err(e) => {
                warn!("loop {}: reregister fd {} failed: {}", self.shared.id, fd, e);
                self.finalize(fd, Some(e));
            }
        }
    }

    /// EOF path: like an application close, buffered outbound bytes drain
    /// first. A retained unconsumed tail gets one final delivery; whatever
    /// the handler leaves after that is dropped, since no further bytes can
    /// arrive to complete it.
    fn request_eof_close(&mut self, fd: RawFd) {
        let tail = match self.conns.get_mut(&fd) {
            Some(entry) if !entry.closing => mem::replace(&mut entry.inbuf, Vec::new()),
            _ => return,
        };

        if !tail.is_empty() {
            if let Some(entry) = self.conns.get(&fd) {
                self.handler.on_data(&entry.conn, &tail);
            }
        }

        let proceed = match self.conns.get_mut(&fd) {
            Some(entry) if !entry.closing => {
                entry.closing = true;
                entry.conn.set_state(State::Closing);
                true
            }
            _ => false,
        };

        if proceed {
            self.flush(fd);
        }
    }

    /// Removes the connection, releases its descriptor, and reports the
    /// close. This is the only place a connection leaves the map, so the
    /// descriptor is closed exactly once and `on_close` fires exactly once.
    fn finalize(&mut self, fd: RawFd, err: Option<io::Error>) {
        if let Some(entry) = self.conns.remove(&fd) {
            let _ = self.shared.selector.deregister(fd);
            entry.conn.set_state(State::Closed);
            trace!(
                "loop {}: conn fd {} closed{}",
                self.shared.id,
                fd,
                err.as_ref()
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            );
            self.handler.on_close(&entry.conn, err.as_ref());
            // entry.io drops here, releasing the descriptor.
        }
    }

    fn accept_ready(&mut self, fd: RawFd) {
        loop {
            let accepted: Result<Acquired> = {
                let entry = match self.listeners.get(&fd) {
                    Some(entry) => entry,
                    None => return,
                };

                match &entry.kind {
                    ListenKind::Tcp(listener) => match listener.accept() {
                        Ok((stream, _)) => acquire::from_tcp(stream),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("loop {}: accept failed on fd {}: {}", self.shared.id, fd, e);
                            return;
                        }
                    },
                    ListenKind::Unix(listener) => match listener.accept() {
                        Ok((stream, _)) => acquire::from_unix_stream(stream),
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("loop {}: accept failed on fd {}: {}", self.shared.id, fd, e);
                            return;
                        }
                    },
                }
            };

            match accepted {
                Ok(acq) => {
                    let ctx = {
                        let entry = match self.listeners.get(&fd) {
                            Some(entry) => entry,
                            None => return,
                        };
                        (entry.make_ctx)()
                    };

                    let target = self.ring.select();
                    let conn = Conn::new(
                        acq.io.as_raw_fd(),
                        acq.local,
                        acq.remote,
                        acq.datagram,
                        target.id,
                        Arc::downgrade(target),
                        ctx,
                    );

                    if let Err(e) = register_conn(target, conn, acq.io) {
                        warn!(
                            "loop {}: failed to register accepted conn: {}",
                            self.shared.id, e
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "loop {}: failed to acquire accepted socket: {}",
                        self.shared.id, e
                    );
                }
            }
        }
    }

    /// Shutdown path: every owned connection is flushed best-effort and
    /// closed, listeners are dropped, then the thread exits.
    fn teardown(&mut self) {
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.flush(fd);
            self.finalize(fd, None);
        }

        let listener_fds: Vec<RawFd> = self.listeners.keys().copied().collect();
        for fd in listener_fds {
            let _ = self.shared.selector.deregister(fd);
            self.listeners.remove(&fd);
        }
    }
}
