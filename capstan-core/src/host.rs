//! Host and endpoint value types.
//!
//! A [`Host`] is an IPv4/IPv6 address value with an `ANY` sentinel meaning
//! "unspecified"; an [`Endpoint`] pairs a host with a 16-bit port. Port 0
//! means "OS-assigned" on binds. Both are cheap immutable values, copied
//! freely.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// An IPv4/IPv6 address value, or the `ANY` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Host(Option<IpAddr>);

impl Host {
    /// The "unspecified" sentinel. Binds to all interfaces; invalid as a
    /// remote address.
    pub const ANY: Host = Host(None);

    /// The IPv4 loopback address.
    pub const LOCALHOST: Host = Host(Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));

    /// Build from four IPv4 octets.
    pub const fn ipv4(a: u8, b: u8, c: u8, d: u8) -> Host {
        Host(Some(IpAddr::V4(Ipv4Addr::new(a, b, c, d))))
    }

    /// True for the `ANY` sentinel.
    pub const fn is_any(self) -> bool {
        self.0.is_none()
    }

    /// The concrete address, if not `ANY`.
    pub const fn ip(self) -> Option<IpAddr> {
        self.0
    }

    /// The concrete address, with `ANY` resolved to the IPv4 unspecified
    /// address (the form binds expect).
    pub fn to_ip(self) -> IpAddr {
        self.0.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// True when the address is IPv6.
    pub fn is_ipv6(self) -> bool {
        matches!(self.0, Some(IpAddr::V6(_)))
    }
}

impl FromStr for Host {
    type Err = HostParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "*" {
            return Ok(Host::ANY);
        }
        s.parse::<IpAddr>()
            .map(|ip| Host(Some(ip)))
            .map_err(|_| HostParseError::Invalid(s.to_string()))
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(ip) => write!(f, "{ip}"),
            None => f.write_str("*"),
        }
    }
}

impl From<IpAddr> for Host {
    fn from(ip: IpAddr) -> Self {
        Host(Some(ip))
    }
}

impl From<Ipv4Addr> for Host {
    fn from(ip: Ipv4Addr) -> Self {
        Host(Some(IpAddr::V4(ip)))
    }
}

impl From<Ipv6Addr> for Host {
    fn from(ip: Ipv6Addr) -> Self {
        Host(Some(IpAddr::V6(ip)))
    }
}

/// A `(host, port)` pair naming one side of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Address part. `Host::ANY` is only meaningful for binds.
    pub host: Host,
    /// Port part. `0` means OS-assigned on binds.
    pub port: u16,
}

impl Endpoint {
    /// Pair `host` with `port`.
    pub fn new(host: impl Into<Host>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve into a `SocketAddr`, with `ANY` mapped to `0.0.0.0`.
    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::new(self.host.to_ip(), self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: Host::from(addr.ip()),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.is_ipv6() {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Errors from parsing a [`Host`].
#[derive(Debug, thiserror::Error)]
pub enum HostParseError {
    #[error("invalid host address: {0}")]
    Invalid(String),
}
