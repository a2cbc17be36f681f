//! TCP endpoint integration tests: echo round trip, state legality,
//! composite send/receive states, lifecycle round trips and teardown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use capstan::{Host, ServerDelegate, SocketDelegate, State, Stream, TcpServer, TcpSocket};
use parking_lot::Mutex;

use common::{pump_until, DEADLINE};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Connected,
    ConnectFailed,
    Disconnected,
    DisconnectFailed,
    Sent(usize),
    SendFinished,
    SendFailed,
    Received(Vec<u8>),
    ReceiveFinished,
    ReceiveFailed,
    Bound,
    BindFailed,
    Unbound,
    UnbindFailed,
    Accepted,
    Stopped,
    StartFailed,
}

#[derive(Clone, Default)]
struct SocketRecorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl SocketRecorder {
    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn has(&self, event: &Event) -> bool {
        self.events.lock().contains(event)
    }

    fn len(&self) -> usize {
        self.events.lock().len()
    }

    fn sent_total(&self) -> usize {
        self.events
            .lock()
            .iter()
            .map(|e| match e {
                Event::Sent(n) => *n,
                _ => 0,
            })
            .sum()
    }

    fn received_bytes(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Received(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Index of the first matching event, for ordering assertions.
    fn position_where(&self, matches: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events.lock().iter().position(matches)
    }
}

impl SocketDelegate for SocketRecorder {
    fn on_connected(&mut self, _socket: &TcpSocket) {
        self.push(Event::Connected);
    }
    fn on_disconnected(&mut self, _socket: &TcpSocket, _host: Host, _port: u16) {
        self.push(Event::Disconnected);
    }
    fn on_connect_failed(&mut self, _socket: &TcpSocket, _host: Host, _port: u16) {
        self.push(Event::ConnectFailed);
    }
    fn on_disconnect_failed(&mut self, _socket: &TcpSocket) {
        self.push(Event::DisconnectFailed);
    }
    fn on_sent(&mut self, _socket: &TcpSocket, byte_count: usize) {
        self.push(Event::Sent(byte_count));
    }
    fn on_send_finished(&mut self, _socket: &TcpSocket) {
        self.push(Event::SendFinished);
    }
    fn on_send_failed(&mut self, _socket: &TcpSocket) {
        self.push(Event::SendFailed);
    }
    fn on_received(&mut self, _socket: &TcpSocket, stream: Stream) {
        self.push(Event::Received(stream.into_vec()));
    }
    fn on_receive_finished(&mut self, _socket: &TcpSocket) {
        self.push(Event::ReceiveFinished);
    }
    fn on_receive_failed(&mut self, _socket: &TcpSocket) {
        self.push(Event::ReceiveFailed);
    }
}

#[derive(Clone, Default)]
struct ServerRecorder {
    events: Arc<Mutex<Vec<Event>>>,
    children: Arc<Mutex<Vec<TcpSocket>>>,
}

impl ServerRecorder {
    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn has(&self, event: &Event) -> bool {
        self.events.lock().contains(event)
    }

    fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    fn child(&self, index: usize) -> TcpSocket {
        self.children.lock()[index].clone()
    }
}

impl ServerDelegate for ServerRecorder {
    fn on_bound(&mut self, _server: &TcpServer) {
        self.push(Event::Bound);
    }
    fn on_bind_failed(&mut self, _server: &TcpServer) {
        self.push(Event::BindFailed);
    }
    fn on_unbound(&mut self, _server: &TcpServer) {
        self.push(Event::Unbound);
    }
    fn on_unbind_failed(&mut self, _server: &TcpServer) {
        self.push(Event::UnbindFailed);
    }
    fn on_accepted(&mut self, _server: &TcpServer, socket: TcpSocket) {
        self.children.lock().push(socket);
        self.push(Event::Accepted);
    }
    fn on_stopped(&mut self, _server: &TcpServer) {
        self.push(Event::Stopped);
    }
    fn on_start_failed(&mut self, _server: &TcpServer) {
        self.push(Event::StartFailed);
    }
}

struct Pair {
    server: TcpServer,
    server_rec: ServerRecorder,
    child: TcpSocket,
    child_rec: SocketRecorder,
    client: TcpSocket,
    client_rec: SocketRecorder,
}

/// Bind a server on an OS-assigned loopback port, connect a client and wait
/// for the accepted child.
fn connect_pair() -> Pair {
    let server_rec = ServerRecorder::default();
    let child_rec = SocketRecorder::default();
    let server = TcpServer::new(server_rec.clone(), child_rec.clone());
    server.bind_async(Host::LOCALHOST, 0).unwrap();
    assert!(pump_until(DEADLINE, || server_rec.has(&Event::Bound)));
    let addr = server.local_endpoint().expect("bound endpoint");
    server.start_async().unwrap();

    let client_rec = SocketRecorder::default();
    let client = TcpSocket::new(client_rec.clone());
    client.connect_async(addr).unwrap();
    assert!(pump_until(DEADLINE, || {
        client_rec.has(&Event::Connected) && server_rec.child_count() > 0
    }));
    let child = server_rec.child(0);
    Pair {
        server,
        server_rec,
        child,
        child_rec,
        client,
        client_rec,
    }
}

#[test]
fn echo_round_trip_delivers_payload_and_counts() {
    let _guard = common::lock();
    common::setup();

    let pair = connect_pair();
    pair.child.start_receive_async(0).unwrap();
    pair.client.send_async("hello").unwrap();

    assert!(pump_until(DEADLINE, || {
        pair.client_rec.has(&Event::SendFinished)
            && pair.child_rec.received_bytes() == b"hello"
    }));
    assert_eq!(pair.client_rec.sent_total(), 5);
    // progress reports precede the completion callback
    let first_sent = pair
        .client_rec
        .position_where(|e| matches!(e, Event::Sent(_)))
        .unwrap();
    let finished = pair
        .client_rec
        .position_where(|e| *e == Event::SendFinished)
        .unwrap();
    assert!(first_sent < finished);
    assert_eq!(pair.client.state(), State::Connected);
    assert!(pair.server.is_running());
    assert!(pair.server_rec.has(&Event::Accepted));
    assert_eq!(pair.server.sockets().len(), 1);
}

#[test]
fn illegal_transition_is_rejected_without_side_effect() {
    let _guard = common::lock();
    common::setup();

    let rec = SocketRecorder::default();
    let client = TcpSocket::new(rec.clone());
    let err = client.send_async("x").unwrap_err();
    assert!(err.is_illegal_state());
    assert_eq!(client.state(), State::Idle);

    for _ in 0..5 {
        capstan::update(Duration::from_millis(10));
    }
    assert_eq!(rec.len(), 0);
}

#[test]
fn concurrent_send_receive_composes_in_the_state_lattice() {
    let _guard = common::lock();
    common::setup();

    let pair = connect_pair();
    pair.client.start_receive_async(0).unwrap();
    assert_eq!(pair.client.state(), State::Receiving);

    pair.client.send_async("ping").unwrap();
    assert_eq!(pair.client.state(), State::SendingReceiving);
    assert!(pair.client.is_receiving());

    assert!(pump_until(DEADLINE, || pair
        .client_rec
        .has(&Event::SendFinished)));
    assert_eq!(pair.client.state(), State::Receiving);

    pair.client.stop_receive_async().unwrap();
    assert!(pump_until(DEADLINE, || pair
        .client_rec
        .has(&Event::ReceiveFinished)));
    assert_eq!(pair.client.state(), State::Connected);
}

#[test]
fn second_send_while_sending_is_rejected() {
    let _guard = common::lock();
    common::setup();

    let pair = connect_pair();
    // large enough that the sender is still draining when we re-submit
    let payload = vec![0u8; 4 << 20];
    pair.client.send_async(payload).unwrap();
    // the state stays `Sending` until the pump harvests the result
    assert_eq!(pair.client.state(), State::Sending);
    let err = pair.client.send_async("again").unwrap_err();
    assert!(err.is_illegal_state());
    pair.child.start_receive_async(0).unwrap();
    assert!(pump_until(DEADLINE, || pair
        .client_rec
        .has(&Event::SendFinished)));
    assert_eq!(pair.client_rec.sent_total(), 4 << 20);
}

#[test]
fn sync_send_clamps_count_to_remaining() {
    let _guard = common::lock();
    common::setup();

    let pair = connect_pair();
    pair.child.start_receive_async(0).unwrap();
    let mut stream = Stream::from("abc");
    let sent = pair.client.send_stream(&mut stream, 100).unwrap();
    assert_eq!(sent, 3);
    assert_eq!(stream.remaining(), 0);
    assert!(pump_until(DEADLINE, || pair.child_rec.received_bytes() == b"abc"));
    assert_eq!(pair.client.state(), State::Connected);
}

#[test]
fn connect_to_dead_port_reports_failure() {
    let _guard = common::lock();
    common::setup();

    // bind-then-drop to get a loopback port nobody listens on
    let probe = TcpServer::new(ServerRecorder::default(), SocketRecorder::default());
    let dead = probe.bind(Host::LOCALHOST, 0).unwrap();
    probe.unbind().unwrap();
    drop(probe);

    let rec = SocketRecorder::default();
    let client = TcpSocket::new(rec.clone());
    client.connect_async(dead).unwrap();
    assert_eq!(client.state(), State::Connecting);
    assert!(pump_until(DEADLINE, || rec.has(&Event::ConnectFailed)));
    assert_eq!(client.state(), State::Idle);
    assert_eq!(client.remote_endpoint(), None);
}

#[test]
fn bind_unbind_bind_round_trip_keeps_explicit_endpoint() {
    let _guard = common::lock();
    common::setup();

    let server = TcpServer::new(ServerRecorder::default(), SocketRecorder::default());
    let first = server.bind(Host::LOCALHOST, 0).unwrap();
    assert_eq!(server.state(), State::Bound);
    assert_ne!(first.port, 0);

    server.unbind().unwrap();
    assert_eq!(server.state(), State::Idle);
    assert_eq!(server.local_endpoint(), None);

    let second = server.bind(Host::LOCALHOST, first.port).unwrap();
    assert_eq!(second, first);
    assert_eq!(server.local_endpoint(), Some(first));
}

#[test]
fn server_stop_returns_to_bound() {
    let _guard = common::lock();
    common::setup();

    let server_rec = ServerRecorder::default();
    let server = TcpServer::new(server_rec.clone(), SocketRecorder::default());
    server.bind(Host::LOCALHOST, 0).unwrap();
    server.start_async().unwrap();
    assert!(server.is_running());

    server.stop_async().unwrap();
    assert!(pump_until(DEADLINE, || server_rec.has(&Event::Stopped)));
    assert_eq!(server.state(), State::Bound);

    // a second stop is illegal from `Bound`
    assert!(server.stop_async().unwrap_err().is_illegal_state());
}

#[test]
fn stop_receive_without_receiver_is_rejected() {
    let _guard = common::lock();
    common::setup();

    let pair = connect_pair();
    let err = pair.client.stop_receive_async().unwrap_err();
    assert!(err.is_illegal_state());
    assert_eq!(pair.client.state(), State::Connected);
}

#[test]
fn dropping_a_receiving_socket_joins_workers_and_silences_callbacks() {
    let _guard = common::lock();
    common::setup();

    let pair = connect_pair();
    pair.client.start_receive_async(0).unwrap();
    assert!(pair.client.is_receiving());

    let before = pair.client_rec.len();
    // the destructor must stop the receiver and join it before returning
    drop(pair.client);

    for _ in 0..5 {
        capstan::update(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(pair.client_rec.len(), before);
}

#[test]
fn disconnect_async_reports_old_peer() {
    let _guard = common::lock();
    common::setup();

    let pair = connect_pair();
    let remote = pair.client.remote_endpoint().unwrap();
    assert_eq!(remote, pair.server.local_endpoint().unwrap());

    pair.client.disconnect_async().unwrap();
    assert!(pump_until(DEADLINE, || pair
        .client_rec
        .has(&Event::Disconnected)));
    assert_eq!(pair.client.state(), State::Idle);
    assert_eq!(pair.client.remote_endpoint(), None);
}
