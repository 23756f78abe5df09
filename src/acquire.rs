//! Descriptor acquisition: turn a blocking-style connect or accept result
//! into a reactor-owned non-blocking descriptor.
//!
//! The standard library's socket types own their descriptor and close it on
//! drop, so the reactor cannot simply take the fd out of them and keep the
//! wrapper around. Instead the descriptor is duplicated, the original
//! wrapper is dropped (dup semantics keep the socket open through the
//! duplicate), and the duplicate is switched to non-blocking mode. The
//! duplicate lives in an [`Io`], so every failure path after duplication
//! closes it exactly once.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixDatagram, UnixStream};

use crate::addr::{Addr, Scheme};
use crate::error::{Error, Result};
use crate::sys::{dup_fd, set_nonblock, Io};

/// A reactor-owned descriptor plus the addresses captured at connect time.
#[derive(Debug)]
pub(crate) struct Acquired {
    pub(crate) io: Io,
    pub(crate) local: Addr,
    pub(crate) remote: Addr,
    pub(crate) datagram: bool,
}

/// Connects to `address` using the blocking facility for `scheme` and
/// converts the result into a reactor-owned non-blocking descriptor.
///
/// Connect failures are surfaced verbatim; no retry happens here.
pub(crate) fn dial(scheme: Scheme, address: &str) -> Result<Acquired> {
    match scheme {
        Scheme::Tcp | Scheme::Tcp4 | Scheme::Tcp6 => dial_tcp(scheme, address),
        Scheme::Udp | Scheme::Udp4 | Scheme::Udp6 => dial_udp(scheme, address),
        Scheme::Unix => {
            let stream = UnixStream::connect(address).map_err(Error::Connect)?;
            from_unix_stream(stream)
        }
        Scheme::Unixgram => {
            let sock = UnixDatagram::unbound().map_err(Error::Connect)?;
            sock.connect(address).map_err(Error::Connect)?;

            let local = sock
                .local_addr()
                .map(|a| Addr::from_unix(&a))
                .unwrap_or(Addr::Unnamed);
            let remote = sock
                .peer_addr()
                .map(|a| Addr::from_unix(&a))
                .unwrap_or(Addr::Unnamed);

            let io = acquire(sock)?;
            Ok(Acquired {
                io,
                local,
                remote,
                datagram: true,
            })
        }
        Scheme::Unixpacket | Scheme::Ip | Scheme::Ip4 | Scheme::Ip6 => Err(Error::Connect(
            io::Error::new(
                io::ErrorKind::Unsupported,
                format!("dialing {} sockets is not supported", scheme),
            ),
        )),
    }
}

/// Converts an accepted TCP stream into a reactor-owned descriptor.
pub(crate) fn from_tcp(stream: TcpStream) -> Result<Acquired> {
    let local = stream.local_addr().map(Addr::Ip).unwrap_or(Addr::Unnamed);
    let remote = stream.peer_addr().map(Addr::Ip).unwrap_or(Addr::Unnamed);

    let io = acquire(stream)?;
    Ok(Acquired {
        io,
        local,
        remote,
        datagram: false,
    })
}

/// Converts a connected or accepted unix stream into a reactor-owned
/// descriptor.
pub(crate) fn from_unix_stream(stream: UnixStream) -> Result<Acquired> {
    let local = stream
        .local_addr()
        .map(|a| Addr::from_unix(&a))
        .unwrap_or(Addr::Unnamed);
    let remote = stream
        .peer_addr()
        .map(|a| Addr::from_unix(&a))
        .unwrap_or(Addr::Unnamed);

    let io = acquire(stream)?;
    Ok(Acquired {
        io,
        local,
        remote,
        datagram: false,
    })
}

/// Duplicates the socket's descriptor, drops the original wrapper, and
/// switches the duplicate to non-blocking mode.
fn acquire<T: AsRawFd>(sock: T) -> Result<Io> {
    let io = dup_fd(sock.as_raw_fd()).map_err(Error::Acquire)?;

    // The wrapper's close only releases its own handle; the socket stays
    // open through the duplicate.
    drop(sock);

    // On failure `io` is dropped here, closing the duplicate.
    set_nonblock(io.as_raw_fd()).map_err(Error::Acquire)?;

    Ok(io)
}

fn dial_tcp(scheme: Scheme, address: &str) -> Result<Acquired> {
    let addrs = resolve(scheme, address)?;
    let stream = TcpStream::connect(&addrs[..]).map_err(Error::Connect)?;

    let local = stream.local_addr().map(Addr::Ip).unwrap_or(Addr::Unnamed);
    let remote = stream.peer_addr().map(Addr::Ip).unwrap_or(Addr::Unnamed);

    let io = acquire(stream)?;
    Ok(Acquired {
        io,
        local,
        remote,
        datagram: false,
    })
}

fn dial_udp(scheme: Scheme, address: &str) -> Result<Acquired> {
    let addrs = resolve(scheme, address)?;
    let target = addrs[0];

    let bind_addr: SocketAddr = if target.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };

    let sock = UdpSocket::bind(bind_addr).map_err(Error::Connect)?;
    sock.connect(target).map_err(Error::Connect)?;

    let local = sock.local_addr().map(Addr::Ip).unwrap_or(Addr::Unnamed);
    let remote = sock.peer_addr().map(Addr::Ip).unwrap_or(Addr::Unnamed);

    let io = acquire(sock)?;
    Ok(Acquired {
        io,
        local,
        remote,
        datagram: true,
    })
}

/// Resolves `address` and keeps the families allowed by `scheme` (`tcp4`
/// keeps IPv4 only, `tcp6` IPv6 only, and so on).
fn resolve(scheme: Scheme, address: &str) -> Result<Vec<SocketAddr>> {
    let want_v4 = match scheme {
        Scheme::Tcp4 | Scheme::Udp4 => Some(true),
        Scheme::Tcp6 | Scheme::Udp6 => Some(false),
        _ => None,
    };

    let addrs: Vec<SocketAddr> = address
        .to_socket_addrs()
        .map_err(Error::Connect)?
        .filter(|addr| match want_v4 {
            Some(true) => addr.is_ipv4(),
            Some(false) => addr.is_ipv6(),
            None => true,
        })
        .collect();

    if addrs.is_empty() {
        return Err(Error::Connect(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {} addresses for {}", scheme, address),
        )));
    }

    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn dup_keeps_socket_open_after_wrapper_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let acquired = dial(Scheme::Tcp, &addr.to_string()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        // The connect-path wrapper is gone; writing through the duplicate
        // must still reach the peer.
        use std::io::Write;
        (&acquired.io).write_all(b"x").unwrap();

        let mut buf = [0u8; 1];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"x");

        match acquired.local {
            Addr::Ip(local) => assert_eq!(local.ip(), addr.ip()),
            other => panic!("expected ip local addr, got {:?}", other),
        }
        assert_eq!(acquired.remote, Addr::Ip(addr));
        assert!(!acquired.datagram);
    }

    #[test]
    fn failing_dials_do_not_leak_descriptors() {
        let probe = || {
            let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            s.as_raw_fd()
        };

        let before = probe();
        for _ in 0..32 {
            assert!(dial(Scheme::Unix, "/nonexistent/netloop-test.sock").is_err());
        }
        let after = probe();

        // Every failing dial released whatever it opened, so the next free
        // descriptor slot is unchanged.
        assert_eq!(before, after);
    }

    #[test]
    fn udp_dial_is_datagram() {
        let acquired = dial(Scheme::Udp, "127.0.0.1:9").unwrap();
        assert!(acquired.datagram);
        assert!(matches!(acquired.local, Addr::Ip(_)));
    }
}
