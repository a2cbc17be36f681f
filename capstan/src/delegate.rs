//! Delegate capability traits, one per endpoint kind.
//!
//! Delegates are the user's callback objects. They are owned by their
//! endpoint and invoked exclusively from inside [`crate::update`], on the
//! pumping thread, after every internal lock has been released, so a
//! delegate may freely call back into the endpoint API. Every method has a
//! no-op default; implement the ones you care about.

use capstan_core::host::Host;
use capstan_core::stream::Stream;

use crate::server::TcpServer;
use crate::tcp::TcpSocket;
use crate::udp::UdpSocket;

/// Callbacks of a TCP client socket.
#[allow(unused_variables)]
pub trait SocketDelegate: Send {
    /// The async connect completed.
    fn on_connected(&mut self, socket: &TcpSocket) {}
    /// The async disconnect completed; `host`/`port` name the old peer.
    fn on_disconnected(&mut self, socket: &TcpSocket, host: Host, port: u16) {}
    /// The async connect gave up.
    fn on_connect_failed(&mut self, socket: &TcpSocket, host: Host, port: u16) {}
    /// The async disconnect failed; the connection is still up.
    fn on_disconnect_failed(&mut self, socket: &TcpSocket) {}

    /// Progress report: `byte_count` more bytes left the socket.
    fn on_sent(&mut self, socket: &TcpSocket, byte_count: usize) {}
    /// The async send drained its whole payload.
    fn on_send_finished(&mut self, socket: &TcpSocket) {}
    /// The async send failed partway.
    fn on_send_failed(&mut self, socket: &TcpSocket) {}

    /// A chunk of inbound bytes arrived. Ownership of `stream` passes to the
    /// delegate.
    fn on_received(&mut self, socket: &TcpSocket, stream: Stream) {}
    /// Receiving ended cleanly (stop request, byte cap, or remote close).
    fn on_receive_finished(&mut self, socket: &TcpSocket) {}
    /// Receiving ended on a platform failure.
    fn on_receive_failed(&mut self, socket: &TcpSocket) {}
}

/// Callbacks of a TCP server.
#[allow(unused_variables)]
pub trait ServerDelegate: Send {
    /// The async bind completed.
    fn on_bound(&mut self, server: &TcpServer) {}
    /// The async bind failed.
    fn on_bind_failed(&mut self, server: &TcpServer) {}
    /// The async unbind completed.
    fn on_unbound(&mut self, server: &TcpServer) {}
    /// The async unbind failed.
    fn on_unbind_failed(&mut self, server: &TcpServer) {}

    /// A connection was accepted. The server keeps ownership of the child;
    /// the handle is a clone.
    fn on_accepted(&mut self, server: &TcpServer, socket: TcpSocket) {}
    /// The accept loop stopped on request.
    fn on_stopped(&mut self, server: &TcpServer) {}
    /// The accept loop died on a platform failure.
    fn on_start_failed(&mut self, server: &TcpServer) {}
}

/// Callbacks of a UDP socket.
///
/// Mirrors the send/receive capability of [`SocketDelegate`] (receive
/// reports the datagram source) and adds bind and broadcast outcomes.
#[allow(unused_variables)]
pub trait UdpDelegate: Send {
    /// The async bind completed.
    fn on_bound(&mut self, socket: &UdpSocket) {}
    /// The async bind failed.
    fn on_bind_failed(&mut self, socket: &UdpSocket) {}
    /// The async unbind completed.
    fn on_unbound(&mut self, socket: &UdpSocket) {}
    /// The async unbind failed.
    fn on_unbind_failed(&mut self, socket: &UdpSocket) {}

    /// Progress report: `byte_count` more bytes left the socket.
    fn on_sent(&mut self, socket: &UdpSocket, byte_count: usize) {}
    /// The async send drained its whole payload.
    fn on_send_finished(&mut self, socket: &UdpSocket) {}
    /// The async send failed partway.
    fn on_send_failed(&mut self, socket: &UdpSocket) {}

    /// A datagram arrived from `host:port`. Ownership of `stream` passes to
    /// the delegate.
    fn on_received(&mut self, socket: &UdpSocket, host: Host, port: u16, stream: Stream) {}
    /// Receiving ended cleanly.
    fn on_receive_finished(&mut self, socket: &UdpSocket) {}
    /// Receiving ended on a platform failure.
    fn on_receive_failed(&mut self, socket: &UdpSocket) {}

    /// The async broadcast reached every adapter.
    fn on_broadcast_finished(&mut self, socket: &UdpSocket) {}
    /// The async broadcast failed on some adapter.
    fn on_broadcast_failed(&mut self, socket: &UdpSocket) {}
}
