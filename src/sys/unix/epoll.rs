use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{self, c_int};

use crate::sys::event::{Event, Ready};
use crate::sys::unix::cvt;
use crate::sys::Token;

/// Readiness multiplexer backed by epoll.
///
/// Owns one epoll instance. Registration and deregistration may be called
/// from any thread; `select` is only ever called by the owning loop.
#[derive(Debug)]
pub struct Selector {
    epfd: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };

        Ok(Selector { epfd })
    }

    /// Wait for events, blocking until at least one arrives or `timeout`
    /// elapses. `None` blocks indefinitely.
    pub fn select(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                // Round up sub-millisecond timeouts so we never spin.
                let millis = to.as_secs() * 1_000 + u64::from(to.subsec_millis())
                    + if to.subsec_nanos() % 1_000_000 > 0 { 1 } else { 0 };
                std::cmp::min(millis, c_int::max_value() as u64) as c_int
            })
            .unwrap_or(-1);

        evts.events.clear();
        unsafe {
            let cnt = cvt(libc::epoll_wait(
                self.epfd,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as c_int,
                timeout_ms,
            ))?;
            evts.events.set_len(cnt as usize);
        }

        Ok(())
    }

    /// Register event interests for the given descriptor.
    ///
    /// Fails with `EEXIST` if the descriptor is already registered.
    pub fn register(&self, fd: RawFd, token: Token, interests: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    /// Change event interests for an already registered descriptor.
    pub fn reregister(&self, fd: RawFd, token: Token, interests: Ready) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    /// Remove the descriptor from the epoll set.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // A non-null event pointer is required on kernels before 2.6.9.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        unsafe {
            cvt(libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev)).map(|_| ())
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: Token, interests: Ready) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interests_to_epoll(interests),
            u64: token.0 as u64,
        };

        unsafe { cvt(libc::epoll_ctl(self.epfd, op, fd, &mut ev)).map(|_| ()) }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

fn interests_to_epoll(interests: Ready) -> u32 {
    let mut kind = 0;

    if interests.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
    }

    if interests.is_writable() {
        kind |= libc::EPOLLOUT;
    }

    kind as u32
}

fn epoll_to_ready(epoll: u32) -> Ready {
    let epoll = epoll as c_int;
    let mut kind = Ready::empty();

    if epoll & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
        kind.insert(Ready::readable());
    }

    if epoll & libc::EPOLLOUT != 0 {
        kind.insert(Ready::writable());
    }

    if epoll & libc::EPOLLERR != 0 {
        kind.insert(Ready::error());
    }

    if epoll & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0 {
        kind.insert(Ready::hup());
    }

    kind
}

/// A reusable batch of readiness events filled in by [`Selector::select`].
pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| {
            Event::new(epoll_to_ready(event.events), Token(event.u64 as usize))
        })
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            events: self,
            pos: 0,
        }
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").field("len", &self.len()).finish()
    }
}

/// Iterator over a batch of readiness events.
#[derive(Debug)]
pub struct Iter<'a> {
    events: &'a Events,
    pos: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        let ret = self.events.get(self.pos);
        self.pos += 1;
        ret
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = Event;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
