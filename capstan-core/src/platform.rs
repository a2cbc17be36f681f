//! Blocking platform socket primitive.
//!
//! A thin wrapper over a `socket2::Socket` with the narrow operation set the
//! endpoint layer consumes: bind/listen/accept, connect, send/receive,
//! datagram broadcast and multicast membership. Every operation blocks and
//! reports through [`Result`]; an operation on a closed descriptor is
//! [`Error::NotOpen`], anything the OS rejects is [`Error::Io`]. Retry and
//! timeout policy live in the worker threads, not here.
//!
//! The socket slot is guarded by an `RwLock` so a sender and a receiver may
//! perform I/O concurrently (read lock) while open/close are exclusive
//! (write lock). Read and write timeouts are set to the configured retry
//! frequency at open, which bounds how long any worker can sit inside a
//! platform call before observing its cancellation flags.
//!
//! # Safety
//!
//! This module uses unsafe code in exactly one place: viewing a `&mut [u8]`
//! as `&mut [MaybeUninit<u8>]` for `socket2`'s receive calls. The cast is
//! sound because the two types share layout and the callee only writes.

#![allow(unsafe_code)]

use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::trace;

use crate::adapter::NetworkAdapter;
use crate::config;
use crate::error::{Error, Result};
use crate::host::{Endpoint, Host};

/// Transport of a [`PlatformSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Stream socket (TCP).
    Tcp,
    /// Datagram socket (UDP).
    Udp,
}

/// One platform socket, shared by an endpoint and its worker threads.
#[derive(Debug)]
pub struct PlatformSocket {
    kind: SocketKind,
    sock: RwLock<Option<Socket>>,
}

fn uninit_mut(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: `u8` and `MaybeUninit<u8>` have identical layout and the
    // receive calls only ever write into the slice.
    unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) }
}

fn sock_addr_to_endpoint(addr: &SockAddr) -> io::Result<Endpoint> {
    addr.as_socket().map(Endpoint::from).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "non-IP socket address")
    })
}

impl PlatformSocket {
    /// New closed socket of the given kind. The descriptor is created
    /// lazily on the first bind or connect.
    pub fn new(kind: SocketKind) -> Self {
        Self {
            kind,
            sock: RwLock::new(None),
        }
    }

    /// Wrap an accepted stream socket.
    pub fn from_accepted(sock: Socket) -> Self {
        Self {
            kind: SocketKind::Tcp,
            sock: RwLock::new(Some(sock)),
        }
    }

    /// Best-effort adapter list for broadcast fan-out: the loopback
    /// interface plus the limited-broadcast pseudo-adapter. Host
    /// applications with real adapter enumeration should pass their own
    /// list to the explicit broadcast calls instead.
    pub fn network_adapters() -> Vec<NetworkAdapter> {
        vec![NetworkAdapter::loopback(), NetworkAdapter::limited_broadcast()]
    }

    /// Transport of this socket.
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// True while a descriptor is held.
    pub fn is_open(&self) -> bool {
        self.sock.read().is_some()
    }

    fn with_sock<R>(&self, f: impl FnOnce(&Socket) -> io::Result<R>) -> Result<R> {
        match self.sock.read().as_ref() {
            Some(sock) => f(sock).map_err(Error::Io),
            None => Err(Error::NotOpen),
        }
    }

    /// Create the descriptor if it does not exist yet, picking the address
    /// family from `host`.
    fn ensure_open(&self, host: Host) -> Result<()> {
        let mut guard = self.sock.write();
        if guard.is_some() {
            return Ok(());
        }
        let domain = if host.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let (ty, protocol) = match self.kind {
            SocketKind::Tcp => (Type::STREAM, Protocol::TCP),
            SocketKind::Udp => (Type::DGRAM, Protocol::UDP),
        };
        let sock = Socket::new(domain, ty, Some(protocol))?;
        sock.set_reuse_address(true)?;
        let poll = config::retry_frequency();
        sock.set_read_timeout(Some(poll))?;
        sock.set_write_timeout(Some(poll))?;
        trace!(tag = %config::get().log_tag, kind = ?self.kind, "opened platform socket");
        *guard = Some(sock);
        Ok(())
    }

    /// Bind to `endpoint`, opening the descriptor if needed. Returns the
    /// actual local endpoint, which resolves port 0 to the OS-assigned port.
    pub fn bind(&self, endpoint: Endpoint) -> Result<Endpoint> {
        self.ensure_open(endpoint.host)?;
        self.with_sock(|sock| {
            sock.bind(&SockAddr::from(endpoint.to_socket_addr()))?;
            sock_addr_to_endpoint(&sock.local_addr()?)
        })
    }

    /// Start listening. The descriptor is switched to non-blocking so
    /// [`accept`](Self::accept) can poll cooperatively.
    pub fn listen(&self) -> Result<()> {
        self.with_sock(|sock| {
            sock.listen(128)?;
            sock.set_nonblocking(true)
        })
    }

    /// One accept attempt. `Ok(None)` means no connection is pending.
    pub fn accept(&self) -> Result<Option<(PlatformSocket, Endpoint)>> {
        self.with_sock(|sock| match sock.accept() {
            Ok((child, addr)) => {
                child.set_nonblocking(false)?;
                let poll = config::retry_frequency();
                child.set_read_timeout(Some(poll))?;
                child.set_write_timeout(Some(poll))?;
                let remote = sock_addr_to_endpoint(&addr)?;
                Ok(Some((PlatformSocket::from_accepted(child), remote)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        })
    }

    /// One connect attempt, bounded by `timeout` for stream sockets. For
    /// datagram sockets this merely records the default peer and returns
    /// immediately.
    pub fn connect(&self, remote: Endpoint, timeout: Duration) -> Result<()> {
        self.ensure_open(remote.host)?;
        let addr = SockAddr::from(remote.to_socket_addr());
        self.with_sock(|sock| match self.kind {
            SocketKind::Udp => sock.connect(&addr),
            SocketKind::Tcp => {
                let result = sock.connect_timeout(&addr, timeout);
                // connect_timeout toggles non-blocking mode internally
                sock.set_nonblocking(false)?;
                result
            }
        })
    }

    /// Shut down and close the descriptor. Closing an already-closed socket
    /// is a no-op.
    pub fn disconnect(&self) -> Result<()> {
        let sock = self.sock.write().take();
        if let Some(sock) = sock {
            match sock.shutdown(std::net::Shutdown::Both) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Send to the connected peer (or the recorded datagram destination).
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.with_sock(|sock| sock.send(data))
    }

    /// Send a datagram to an explicit endpoint.
    pub fn send_to(&self, data: &[u8], endpoint: Endpoint) -> Result<usize> {
        self.with_sock(|sock| sock.send_to(data, &SockAddr::from(endpoint.to_socket_addr())))
    }

    /// Receive from the connected peer. `Ok(0)` is a clean close on stream
    /// sockets.
    pub fn receive(&self, out: &mut [u8]) -> Result<usize> {
        self.with_sock(|sock| sock.recv(uninit_mut(out)))
    }

    /// Receive one datagram, reporting its source endpoint.
    pub fn receive_from(&self, out: &mut [u8]) -> Result<(usize, Endpoint)> {
        self.with_sock(|sock| {
            let (n, addr) = sock.recv_from(uninit_mut(out))?;
            Ok((n, sock_addr_to_endpoint(&addr)?))
        })
    }

    /// Send `data` to `adapter`'s broadcast address on `port`.
    pub fn broadcast(
        &self,
        adapter: &NetworkAdapter,
        port: u16,
        data: &[u8],
    ) -> Result<usize> {
        self.with_sock(|sock| {
            sock.set_broadcast(true)?;
            let target = SocketAddr::new(adapter.broadcast.to_ip(), port);
            sock.send_to(data, &SockAddr::from(target))
        })
    }

    /// Join a multicast group on `interface`. Joining a group the kernel
    /// already tracks for this socket succeeds.
    pub fn join_multicast(&self, interface: Host, group: Host) -> Result<()> {
        let result = self.with_sock(|sock| match group.to_ip() {
            std::net::IpAddr::V4(group) => {
                let iface = match interface.to_ip() {
                    std::net::IpAddr::V4(v4) => v4,
                    std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                sock.join_multicast_v4(&group, &iface)
            }
            std::net::IpAddr::V6(group) => sock.join_multicast_v6(&group, 0),
        });
        match result {
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::AddrInUse => Ok(()),
            other => other,
        }
    }

    /// Leave a multicast group on `interface`.
    pub fn leave_multicast(&self, interface: Host, group: Host) -> Result<()> {
        self.with_sock(|sock| match group.to_ip() {
            std::net::IpAddr::V4(group) => {
                let iface = match interface.to_ip() {
                    std::net::IpAddr::V4(v4) => v4,
                    std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                };
                sock.leave_multicast_v4(&group, &iface)
            }
            std::net::IpAddr::V6(group) => sock.leave_multicast_v6(&group, 0),
        })
    }

    /// Select the outgoing interface for IPv4 multicast.
    pub fn set_multicast_interface(&self, interface: Host) -> Result<()> {
        self.with_sock(|sock| match interface.to_ip() {
            std::net::IpAddr::V4(v4) => sock.set_multicast_if_v4(&v4),
            std::net::IpAddr::V6(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "multicast interface must be an IPv4 address",
            )),
        })
    }

    /// Set the IPv4 multicast TTL.
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.with_sock(|sock| sock.set_multicast_ttl_v4(ttl))
    }

    /// Enable or disable IPv4 multicast loopback.
    pub fn set_multicast_loopback(&self, on: bool) -> Result<()> {
        self.with_sock(|sock| sock.set_multicast_loop_v4(on))
    }

    /// Override the read timeout, which doubles as the receive poll
    /// interval.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_sock(|sock| sock.set_read_timeout(timeout))
    }

    /// Local endpoint of the descriptor.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.with_sock(|sock| sock_addr_to_endpoint(&sock.local_addr()?))
    }

    /// Remote endpoint of the descriptor.
    pub fn remote_endpoint(&self) -> Result<Endpoint> {
        self.with_sock(|sock| sock_addr_to_endpoint(&sock.peer_addr()?))
    }

    /// True while a peer (or datagram destination) is recorded.
    pub fn is_connected(&self) -> bool {
        self.with_sock(|sock| sock.peer_addr()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_socket_reports_not_open() {
        let sock = PlatformSocket::new(SocketKind::Tcp);
        assert!(!sock.is_open());
        assert!(matches!(sock.send(b"x"), Err(Error::NotOpen)));
        let mut buf = [0u8; 4];
        assert!(matches!(sock.receive(&mut buf), Err(Error::NotOpen)));
        assert!(matches!(sock.local_endpoint(), Err(Error::NotOpen)));
    }

    #[test]
    fn bind_resolves_os_assigned_port() {
        let sock = PlatformSocket::new(SocketKind::Udp);
        let local = sock
            .bind(Endpoint::new(Host::LOCALHOST, 0))
            .expect("bind loopback");
        assert_ne!(local.port, 0);
        assert!(sock.is_open());
        sock.disconnect().unwrap();
        assert!(!sock.is_open());
    }

    #[test]
    fn datagram_round_trip_with_destination() {
        let a = PlatformSocket::new(SocketKind::Udp);
        let b = PlatformSocket::new(SocketKind::Udp);
        let _ = a.bind(Endpoint::new(Host::LOCALHOST, 0)).unwrap();
        let b_local = b.bind(Endpoint::new(Host::LOCALHOST, 0)).unwrap();

        a.connect(b_local, Duration::from_secs(1)).unwrap();
        assert!(a.is_connected());
        a.send(b"ping").unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = loop {
            match b.receive_from(&mut buf) {
                Ok(pair) => break pair,
                Err(e) if e.is_recoverable() => {}
                Err(e) => panic!("receive_from failed: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_endpoint().unwrap());
    }

    #[test]
    fn adapter_list_is_usable() {
        let adapters = PlatformSocket::network_adapters();
        assert!(!adapters.is_empty());
        assert!(adapters.iter().all(|a| !a.broadcast.is_any()));
    }
}
