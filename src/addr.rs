//! Scheme and address parsing for dial/listen targets.
//!
//! Addresses take the form `scheme://host:port` (or `scheme:///path` for the
//! unix-family schemes). An address without a scheme separator defaults to
//! `tcp://`. Name resolution itself is left to the standard library's
//! connect path; this module only extracts the network family and the
//! address component. IPv6 literals may carry a numeric scope id
//! (`[fe80::1%3]:port`); textual interface zones (`%eth0`) are not resolved
//! and fail downstream as a connect error.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A network scheme recognized by `dial` and `listen`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Ip,
    Ip4,
    Ip6,
    Unix,
    Unixgram,
    Unixpacket,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Tcp4 => "tcp4",
            Scheme::Tcp6 => "tcp6",
            Scheme::Udp => "udp",
            Scheme::Udp4 => "udp4",
            Scheme::Udp6 => "udp6",
            Scheme::Ip => "ip",
            Scheme::Ip4 => "ip4",
            Scheme::Ip6 => "ip6",
            Scheme::Unix => "unix",
            Scheme::Unixgram => "unixgram",
            Scheme::Unixpacket => "unixpacket",
        }
    }

    /// Datagram transports have no stream framing and no remote-closed
    /// signal; each read or write moves one datagram.
    pub fn is_datagram(&self) -> bool {
        matches!(self, Scheme::Udp | Scheme::Udp4 | Scheme::Udp6 | Scheme::Unixgram)
    }

    /// True for the three unix-domain schemes, whose address is a filesystem
    /// path rather than a host:port authority.
    pub fn is_unix(&self) -> bool {
        matches!(self, Scheme::Unix | Scheme::Unixgram | Scheme::Unixpacket)
    }
}

impl FromStr for Scheme {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Scheme, ()> {
        match s {
            "tcp" => Ok(Scheme::Tcp),
            "tcp4" => Ok(Scheme::Tcp4),
            "tcp6" => Ok(Scheme::Tcp6),
            "udp" => Ok(Scheme::Udp),
            "udp4" => Ok(Scheme::Udp4),
            "udp6" => Ok(Scheme::Udp6),
            "ip" => Ok(Scheme::Ip),
            "ip4" => Ok(Scheme::Ip4),
            "ip6" => Ok(Scheme::Ip6),
            "unix" => Ok(Scheme::Unix),
            "unixgram" => Ok(Scheme::Unixgram),
            "unixpacket" => Ok(Scheme::Unixpacket),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Splits an address string into its scheme and address component.
///
/// For unix-family schemes the address is the URI path; for everything else
/// it is the authority (host:port).
pub fn parse(addr: &str) -> Result<(Scheme, String)> {
    let (scheme, rest) = match addr.find("://") {
        Some(idx) => (&addr[..idx], &addr[idx + 3..]),
        None => ("tcp", addr),
    };

    let scheme: Scheme = scheme
        .parse()
        .map_err(|_| Error::Addr(addr.to_string()))?;

    let address = if scheme.is_unix() {
        // unix:///path/to.sock has an empty authority; the path component is
        // the address.
        match rest.find('/') {
            Some(idx) => &rest[idx..],
            None => "",
        }
    } else {
        match rest.find('/') {
            Some(idx) => &rest[..idx],
            None => rest,
        }
    };

    if address.is_empty() {
        return Err(Error::Addr(addr.to_string()));
    }

    Ok((scheme, address.to_string()))
}

/// A resolved socket address: IP, unix path, or unnamed.
///
/// `Unnamed` covers the best-effort cases: unbound datagram sockets and
/// anonymous unix sockets report no meaningful address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Addr {
    Ip(SocketAddr),
    Unix(PathBuf),
    Unnamed,
}

impl Addr {
    pub(crate) fn from_unix(addr: &std::os::unix::net::SocketAddr) -> Addr {
        match addr.as_pathname() {
            Some(path) => Addr::Unix(path.to_path_buf()),
            None => Addr::Unnamed,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Ip(addr) => write!(f, "{}", addr),
            Addr::Unix(path) => write!(f, "{}", path.display()),
            Addr::Unnamed => f.write_str("(unnamed)"),
        }
    }
}

impl From<SocketAddr> for Addr {
    fn from(addr: SocketAddr) -> Addr {
        Addr::Ip(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, Scheme};
    use crate::error::Error;

    #[test]
    fn default_scheme_is_tcp() {
        let (scheme, addr) = parse("127.0.0.1:80").unwrap();
        assert_eq!(scheme, Scheme::Tcp);
        assert_eq!(addr, "127.0.0.1:80");
    }

    #[test]
    fn explicit_schemes() {
        let (scheme, addr) = parse("udp6://[2001:db8::1]:53").unwrap();
        assert_eq!(scheme, Scheme::Udp6);
        assert_eq!(addr, "[2001:db8::1]:53");

        let (scheme, addr) = parse("unix:///tmp/test.sock").unwrap();
        assert_eq!(scheme, Scheme::Unix);
        assert_eq!(addr, "/tmp/test.sock");

        let (scheme, _) = parse("unixgram:///run/dgram.sock").unwrap();
        assert!(scheme.is_datagram());
    }

    #[test]
    fn trailing_path_is_not_part_of_the_authority() {
        let (_, addr) = parse("tcp://example.com:80/ignored").unwrap();
        assert_eq!(addr, "example.com:80");
    }

    #[test]
    fn rejects_unknown_scheme() {
        match parse("quic://localhost:443") {
            Err(Error::Addr(_)) => {}
            other => panic!("expected address error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_empty_address() {
        assert!(parse("tcp://").is_err());
        assert!(parse("unix://").is_err());
    }
}
