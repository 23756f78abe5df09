use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use libc::{self, c_int};

use crate::sys::event::{Event, Ready};
use crate::sys::unix::{cvt, set_cloexec};
use crate::sys::Token;

/// Readiness multiplexer backed by kqueue.
///
/// Owns one kqueue instance. Read and write interest are separate kqueue
/// filters, so interest changes are applied as an add/delete pair.
#[derive(Debug)]
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = unsafe { cvt(libc::kqueue())? };
        if let Err(e) = set_cloexec(kq) {
            unsafe {
                let _ = libc::close(kq);
            }
            return Err(e);
        }

        Ok(Selector { kq })
    }

    /// Wait for events, blocking until at least one arrives or `timeout`
    /// elapses. `None` blocks indefinitely.
    pub fn select(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout = timeout.map(|to| libc::timespec {
            tv_sec: std::cmp::min(to.as_secs(), libc::time_t::max_value() as u64)
                as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timeout = timeout
            .as_ref()
            .map(|s| s as *const _)
            .unwrap_or(ptr::null());

        evts.events.clear();
        unsafe {
            let cnt = cvt(libc::kevent(
                self.kq,
                ptr::null(),
                0,
                evts.events.as_mut_ptr(),
                evts.events.capacity() as c_int,
                timeout,
            ))?;
            evts.events.set_len(cnt as usize);
        }

        Ok(())
    }

    /// Register event interests for the given descriptor.
    pub fn register(&self, fd: RawFd, token: Token, interests: Ready) -> io::Result<()> {
        self.apply(fd, token, interests, false)
    }

    /// Change event interests for an already registered descriptor.
    pub fn reregister(&self, fd: RawFd, token: Token, interests: Ready) -> io::Result<()> {
        self.apply(fd, token, interests, true)
    }

    /// Remove the descriptor from the kqueue.
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.change(fd, libc::EVFILT_READ as i32, libc::EV_DELETE as u32, Token(0), true)?;
        self.change(fd, libc::EVFILT_WRITE as i32, libc::EV_DELETE as u32, Token(0), true)?;
        Ok(())
    }

    fn apply(&self, fd: RawFd, token: Token, interests: Ready, replace: bool) -> io::Result<()> {
        if interests.is_readable() {
            self.change(fd, libc::EVFILT_READ as i32, libc::EV_ADD as u32, token, false)?;
        } else if replace {
            self.change(fd, libc::EVFILT_READ as i32, libc::EV_DELETE as u32, token, true)?;
        }

        if interests.is_writable() {
            self.change(fd, libc::EVFILT_WRITE as i32, libc::EV_ADD as u32, token, false)?;
        } else if replace {
            self.change(fd, libc::EVFILT_WRITE as i32, libc::EV_DELETE as u32, token, true)?;
        }

        Ok(())
    }

    fn change(
        &self,
        fd: RawFd,
        filter: i32,
        flags: u32,
        token: Token,
        ignore_enoent: bool,
    ) -> io::Result<()> {
        let ev = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter: filter as _,
            flags: flags as _,
            fflags: 0,
            data: 0,
            udata: token.0 as _,
        };

        let r = unsafe { cvt(libc::kevent(self.kq, &ev, 1, ptr::null_mut(), 0, ptr::null())) };
        match r {
            Ok(_) => Ok(()),
            Err(ref e) if ignore_enoent && e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

/// A reusable batch of readiness events filled in by [`Selector::select`].
pub struct Events {
    events: Vec<libc::kevent>,
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
        self.events.get(idx).map(|ev| {
            let mut kind = Ready::empty();

            let filter = ev.filter as i32;
            if filter == libc::EVFILT_READ as i32 {
                kind.insert(Ready::readable());
            } else if filter == libc::EVFILT_WRITE as i32 {
                kind.insert(Ready::writable());
            }

            if ev.flags as u32 & libc::EV_ERROR as u32 != 0 {
                kind.insert(Ready::error());
            }

            if ev.flags as u32 & libc::EV_EOF as u32 != 0 {
                kind.insert(Ready::hup());

                // When the read direction is at EOF and an error is pending,
                // kqueue reports it in `fflags`.
                if ev.fflags != 0 {
                    kind.insert(Ready::error());
                }
            }

            Event::new(kind, Token(ev.udata as usize))
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
