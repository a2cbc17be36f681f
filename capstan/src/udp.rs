//! UDP socket.
//!
//! A bound datagram endpoint composing the binding aspect with sender,
//! receiver and broadcaster workers, plus destination management and
//! multicast membership bookkeeping. Its rest state is `Bound` (where a TCP
//! client rests at `Connected`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capstan_core::adapter::NetworkAdapter;
use capstan_core::config;
use capstan_core::error::{Error, Result};
use capstan_core::host::{Endpoint, Host};
use capstan_core::platform::{PlatformSocket, SocketKind};
use capstan_core::state::{check_state, State};
use capstan_core::stream::Stream;
use parking_lot::Mutex;
use tracing::warn;

use crate::binding::{BindEvent, BindingAspect};
use crate::delegate::UdpDelegate;
use crate::registry::{self, Pump};
use crate::worker::broadcaster::{self, Broadcaster};
use crate::worker::receiver::UdpReceiver;
use crate::worker::sender::{self, Sender};

/// Rest state a UDP socket returns to when composite activity ends.
const IDLE_STATE: State = State::Bound;

/// Buffer size for a single blocking datagram receive.
const DATAGRAM_CHUNK: usize = 65536;

/// States in which multicast membership may be changed.
const MULTICAST_STATES: &[State] = &[
    State::Bound,
    State::Sending,
    State::Receiving,
    State::SendingReceiving,
];

pub(crate) struct UdpInner {
    platform: Arc<PlatformSocket>,
    state: Arc<Mutex<State>>,
    local: Arc<Mutex<Option<Endpoint>>>,
    remote: Mutex<Option<Endpoint>>,
    binding: BindingAspect,
    sender: Sender,
    receiver: UdpReceiver,
    broadcaster: Broadcaster,
    multicast: Mutex<Vec<(Host, Host)>>,
    delegate: Mutex<Box<dyn UdpDelegate>>,
    reg_id: AtomicU64,
}

/// A UDP socket handle.
///
/// Handles are cheap clones of a shared endpoint; the endpoint's workers are
/// stopped and joined when the last handle is dropped.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Arc<UdpInner>,
}

impl UdpSocket {
    /// New idle socket reporting to `delegate`.
    ///
    /// # Panics
    ///
    /// Panics when the library is not initialized.
    pub fn new(delegate: impl UdpDelegate + 'static) -> UdpSocket {
        let platform = Arc::new(PlatformSocket::new(SocketKind::Udp));
        let state = Arc::new(Mutex::new(State::Idle));
        let local = Arc::new(Mutex::new(None));
        let inner = Arc::new(UdpInner {
            binding: BindingAspect::new(
                Arc::clone(&platform),
                Arc::clone(&state),
                Arc::clone(&local),
                false,
            ),
            platform,
            state,
            local,
            remote: Mutex::new(None),
            sender: Sender::new(),
            receiver: UdpReceiver::new(),
            broadcaster: Broadcaster::new(),
            multicast: Mutex::new(Vec::new()),
            delegate: Mutex::new(Box::new(delegate)),
            reg_id: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&(Arc::clone(&inner) as Arc<dyn Pump>));
        let id = registry::register(weak);
        inner.reg_id.store(id, Ordering::Release);
        UdpSocket { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.inner.state.lock()
    }

    /// True while a local endpoint is held (bound or in composite states).
    pub fn is_bound(&self) -> bool {
        matches!(
            self.state(),
            State::Bound | State::Sending | State::Receiving | State::SendingReceiving
        )
    }

    /// True while the sender worker is processing.
    pub fn is_sending(&self) -> bool {
        self.inner.sender.worker.result() == State::Running
    }

    /// True while the receiver worker is processing.
    pub fn is_receiving(&self) -> bool {
        self.inner.receiver.worker.result() == State::Running
    }

    /// True while the broadcaster worker is processing.
    pub fn is_broadcasting(&self) -> bool {
        self.inner.broadcaster.worker.result() == State::Running
    }

    /// True while a destination is recorded on the descriptor.
    pub fn has_destination(&self) -> bool {
        self.inner.platform.is_connected()
    }

    /// Local endpoint, once bound.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        *self.inner.local.lock()
    }

    /// Destination endpoint, once set.
    pub fn destination(&self) -> Option<Endpoint> {
        *self.inner.remote.lock()
    }

    /// Active multicast memberships as `(interface, group)` pairs.
    pub fn multicast_groups(&self) -> Vec<(Host, Host)> {
        self.inner.multicast.lock().clone()
    }

    /// Bind on the binder worker. Outcome: `on_bound` or `on_bind_failed`.
    pub fn bind_async(&self, host: Host, port: u16) -> Result<()> {
        self.inner.binding.bind_async(host, port)
    }

    /// Bind on the calling thread. Returns the resolved local endpoint.
    pub fn bind(&self, host: Host, port: u16) -> Result<Endpoint> {
        self.inner.binding.bind(host, port)
    }

    /// Unbind on the binder worker. Outcome: `on_unbound` or
    /// `on_unbind_failed`. Destination and multicast memberships are cleared
    /// with the descriptor.
    pub fn unbind_async(&self) -> Result<()> {
        self.inner.binding.unbind_async()
    }

    /// Unbind on the calling thread.
    pub fn unbind(&self) -> Result<()> {
        self.inner.binding.unbind()?;
        self.inner.clear_session();
        Ok(())
    }

    /// Record `host:port` as the datagram destination. Not a real connect;
    /// the descriptor merely remembers the default peer for sends.
    pub fn set_destination(&self, host: Host, port: u16) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            check_state(*state, &[State::Bound], "set destination")?;
            // precaution while the descriptor is touched off-lock
            *state = State::Connecting;
        }
        let remote = Endpoint::new(host, port);
        let result = inner.platform.connect(remote, config::connection_timeout());
        let mut state = inner.state.lock();
        *state = State::Bound;
        match result {
            Ok(()) => {
                *inner.remote.lock() = Some(remote);
                Ok(())
            }
            Err(e) => {
                *inner.remote.lock() = None;
                Err(e)
            }
        }
    }

    /// Send the whole payload to the destination on the sender worker.
    /// Progress arrives as `on_sent`; outcome as `on_send_finished` or
    /// `on_send_failed`.
    pub fn send_async(&self, data: impl Into<Stream>) -> Result<()> {
        let stream = data.into();
        let count = stream.remaining();
        self.send_stream_async(&stream, count)
    }

    /// Send `min(count, stream.remaining())` bytes from `stream`'s cursor on
    /// the sender worker. The source cursor is unchanged.
    pub fn send_stream_async(&self, stream: &Stream, count: usize) -> Result<()> {
        let inner = &self.inner;
        let count = count.min(stream.remaining());
        if count == 0 {
            warn!(tag = %config::get().log_tag, "cannot send, no data");
            return Err(Error::NoData);
        }
        if !self.has_destination() {
            warn!(tag = %config::get().log_tag, "cannot send, no destination set");
            return Err(Error::NoDestination);
        }
        let mut state = inner.state.lock();
        check_state(*state, &[State::Bound, State::Receiving], "send")?;
        let mut control = inner.sender.worker.lock();
        *state = state.adding_send();
        control.result = State::Running;
        control.running = true;
        control.ext.last_sent = 0;
        drop(control);
        drop(state);
        let payload = stream.duplicate(count);
        if let Err(e) = inner.sender.start(Arc::clone(&inner.platform), payload) {
            let mut state = inner.state.lock();
            inner.sender.worker.abort_launch();
            *state = state.removing_send(IDLE_STATE);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Send the whole payload on the calling thread. Returns the byte count.
    pub fn send(&self, data: impl Into<Stream>) -> Result<usize> {
        let mut stream = data.into();
        let count = stream.remaining();
        self.send_stream(&mut stream, count)
    }

    /// Send `min(count, stream.remaining())` bytes on the calling thread,
    /// advancing `stream`'s cursor past what was sent.
    pub fn send_stream(&self, stream: &mut Stream, count: usize) -> Result<usize> {
        let inner = &self.inner;
        let count = count.min(stream.remaining());
        if count == 0 {
            warn!(tag = %config::get().log_tag, "cannot send, no data");
            return Err(Error::NoData);
        }
        if !self.has_destination() {
            warn!(tag = %config::get().log_tag, "cannot send, no destination set");
            return Err(Error::NoDestination);
        }
        {
            let mut state = inner.state.lock();
            check_state(*state, &[State::Bound, State::Receiving], "send")?;
            *state = state.adding_send();
        }
        let result = sender::send_blocking(&inner.platform, stream, count);
        let mut state = inner.state.lock();
        *state = state.removing_send(IDLE_STATE);
        drop(state);
        result
    }

    /// Receive one datagram on the calling thread, blocking until it
    /// arrives. Returns the source host, source port and payload.
    pub fn receive(&self) -> Result<(Host, u16, Stream)> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            check_state(*state, &[State::Bound, State::Sending], "receive")?;
            *state = state.adding_receive();
        }
        let mut buf = vec![0u8; DATAGRAM_CHUNK];
        let result = loop {
            match inner.platform.receive_from(&mut buf) {
                Ok((n, from)) => break Ok((from.host, from.port, Stream::from(&buf[..n]))),
                Err(e) if e.is_recoverable() => {}
                Err(e) => break Err(e),
            }
        };
        let mut state = inner.state.lock();
        *state = state.removing_receive(IDLE_STATE);
        drop(state);
        result
    }

    /// Start the receiver worker. Datagrams arrive as `on_received`; the end
    /// as `on_receive_finished` or `on_receive_failed`. `max_packages`
    /// bounds datagrams per worker iteration; zero or negative means
    /// unbounded.
    pub fn start_receive_async(&self, max_packages: i32) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        check_state(*state, &[State::Bound, State::Sending], "start receiving")?;
        let mut control = inner.receiver.worker.lock();
        *state = state.adding_receive();
        control.result = State::Running;
        control.running = true;
        drop(control);
        drop(state);
        if let Err(e) = inner.receiver.start(Arc::clone(&inner.platform), max_packages) {
            let mut state = inner.state.lock();
            inner.receiver.worker.abort_launch();
            *state = state.removing_receive(IDLE_STATE);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Ask the receiver worker to stop; `on_receive_finished` follows once
    /// it winds down.
    pub fn stop_receive_async(&self) -> Result<()> {
        let state = self.inner.state.lock();
        let mut control = self.inner.receiver.worker.lock();
        if control.result != State::Running {
            warn!(tag = %config::get().log_tag, "cannot stop receiving, not receiving");
            return Err(Error::IllegalState {
                op: "stop receiving",
                state: *state,
            });
        }
        control.running = false;
        Ok(())
    }

    /// Broadcast the payload to the default adapter list on the broadcaster
    /// worker. Outcome: `on_broadcast_finished` or `on_broadcast_failed`.
    pub fn broadcast_async(&self, port: u16, data: impl Into<Stream>) -> Result<()> {
        self.broadcast_to_async(PlatformSocket::network_adapters(), port, data)
    }

    /// Broadcast the payload to every adapter in `adapters` on the
    /// broadcaster worker.
    pub fn broadcast_to_async(
        &self,
        adapters: Vec<NetworkAdapter>,
        port: u16,
        data: impl Into<Stream>,
    ) -> Result<()> {
        let inner = &self.inner;
        let payload = data.into();
        if payload.remaining() == 0 {
            warn!(tag = %config::get().log_tag, "cannot broadcast, no data");
            return Err(Error::NoData);
        }
        let mut state = inner.state.lock();
        check_state(*state, &[State::Bound, State::Receiving], "broadcast")?;
        let mut control = inner.broadcaster.worker.lock();
        *state = state.adding_send();
        control.result = State::Running;
        control.running = true;
        drop(control);
        drop(state);
        if let Err(e) =
            inner
                .broadcaster
                .start(Arc::clone(&inner.platform), adapters, port, payload)
        {
            let mut state = inner.state.lock();
            inner.broadcaster.worker.abort_launch();
            *state = state.removing_send(IDLE_STATE);
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Broadcast to the default adapter list on the calling thread.
    pub fn broadcast(&self, port: u16, data: impl Into<Stream>) -> Result<()> {
        self.broadcast_to(&PlatformSocket::network_adapters(), port, data)
    }

    /// Broadcast to every adapter in `adapters` on the calling thread.
    pub fn broadcast_to(
        &self,
        adapters: &[NetworkAdapter],
        port: u16,
        data: impl Into<Stream>,
    ) -> Result<()> {
        let inner = &self.inner;
        let payload = data.into();
        if payload.remaining() == 0 {
            warn!(tag = %config::get().log_tag, "cannot broadcast, no data");
            return Err(Error::NoData);
        }
        {
            let mut state = inner.state.lock();
            check_state(*state, &[State::Bound, State::Receiving], "broadcast")?;
            *state = state.adding_send();
        }
        let result = broadcaster::broadcast_blocking(&inner.platform, adapters, port, &payload);
        let mut state = inner.state.lock();
        *state = state.removing_send(IDLE_STATE);
        drop(state);
        result
    }

    /// Join multicast `group` on `interface` and record the membership.
    /// Duplicate joins succeed and are recorded again.
    pub fn join_multicast_group(&self, interface: Host, group: Host) -> Result<()> {
        {
            let state = self.inner.state.lock();
            check_state(*state, MULTICAST_STATES, "join multicast group")?;
        }
        self.inner.platform.join_multicast(interface, group)?;
        self.inner.multicast.lock().push((interface, group));
        Ok(())
    }

    /// Leave multicast `group` on `interface`. Rejected when the membership
    /// was never recorded.
    pub fn leave_multicast_group(&self, interface: Host, group: Host) -> Result<()> {
        if !self.inner.multicast.lock().contains(&(interface, group)) {
            warn!(
                tag = %config::get().log_tag,
                interface = %interface,
                group = %group,
                "cannot leave multicast group, interface is not assigned to group"
            );
            return Err(Error::MulticastNotJoined { interface, group });
        }
        {
            let state = self.inner.state.lock();
            check_state(*state, MULTICAST_STATES, "leave multicast group")?;
        }
        self.inner.platform.leave_multicast(interface, group)?;
        let mut list = self.inner.multicast.lock();
        if let Some(i) = list.iter().position(|pair| *pair == (interface, group)) {
            list.remove(i);
        }
        Ok(())
    }

    /// Select the outgoing interface for IPv4 multicast.
    pub fn set_multicast_interface(&self, interface: Host) -> Result<()> {
        self.inner.platform.set_multicast_interface(interface)
    }

    /// Set the IPv4 multicast TTL.
    pub fn set_multicast_ttl(&self, ttl: u32) -> Result<()> {
        self.inner.platform.set_multicast_ttl(ttl)
    }

    /// Enable or disable IPv4 multicast loopback.
    pub fn set_multicast_loopback(&self, on: bool) -> Result<()> {
        self.inner.platform.set_multicast_loopback(on)
    }
}

impl UdpInner {
    /// Destination and multicast bookkeeping die with the descriptor.
    fn clear_session(&self) {
        *self.remote.lock() = None;
        self.multicast.lock().clear();
    }

    fn update_sending(&self, handle: &UdpSocket) {
        let sent;
        let result;
        {
            let mut state = self.state.lock();
            let mut control = self.sender.worker.lock();
            sent = std::mem::take(&mut control.ext.last_sent);
            result = control.result;
            if result.is_terminal() {
                control.result = State::Idle;
                control.running = false;
                if state.is_sending() {
                    *state = state.removing_send(IDLE_STATE);
                }
            }
        }
        if sent > 0 {
            self.delegate.lock().on_sent(handle, sent);
        }
        match result {
            State::Finished => self.delegate.lock().on_send_finished(handle),
            State::Failed => self.delegate.lock().on_send_failed(handle),
            _ => {}
        }
    }

    fn update_receiving(&self, handle: &UdpSocket) {
        let result;
        {
            let mut state = self.state.lock();
            let mut control = self.receiver.worker.lock();
            result = control.result;
            if result.is_terminal() {
                control.result = State::Idle;
                control.running = false;
                if state.is_receiving() {
                    *state = state.removing_receive(IDLE_STATE);
                }
            }
        }
        // queued datagrams are delivered even while the worker keeps running
        let datagrams = self.receiver.drain();
        for datagram in datagrams {
            self.delegate
                .lock()
                .on_received(handle, datagram.host, datagram.port, datagram.stream);
        }
        match result {
            State::Finished => self.delegate.lock().on_receive_finished(handle),
            State::Failed => self.delegate.lock().on_receive_failed(handle),
            _ => {}
        }
    }

    fn update_broadcasting(&self, handle: &UdpSocket) {
        let result;
        {
            let mut state = self.state.lock();
            let mut control = self.broadcaster.worker.lock();
            result = control.result;
            if !result.is_terminal() {
                return;
            }
            control.result = State::Idle;
            control.running = false;
            if state.is_sending() {
                *state = state.removing_send(IDLE_STATE);
            }
        }
        match result {
            State::Finished => self.delegate.lock().on_broadcast_finished(handle),
            State::Failed => self.delegate.lock().on_broadcast_failed(handle),
            _ => {}
        }
    }
}

impl Pump for UdpInner {
    fn pump(self: Arc<Self>, _dt: Duration) {
        let handle = UdpSocket {
            inner: Arc::clone(&self),
        };
        if let Some(event) = self.binding.update() {
            if matches!(event, BindEvent::Unbound) {
                self.clear_session();
            }
            let mut delegate = self.delegate.lock();
            match event {
                BindEvent::Bound => delegate.on_bound(&handle),
                BindEvent::BindFailed => delegate.on_bind_failed(&handle),
                BindEvent::Unbound => delegate.on_unbound(&handle),
                BindEvent::UnbindFailed => delegate.on_unbind_failed(&handle),
            }
        }
        self.update_sending(&handle);
        self.update_receiving(&handle);
        self.update_broadcasting(&handle);
    }

    fn halt(&self) {
        self.sender.worker.stop_and_join();
        self.receiver.worker.stop_and_join();
        self.broadcaster.worker.stop_and_join();
        self.binding.halt();
    }
}

impl Drop for UdpInner {
    fn drop(&mut self) {
        registry::unregister(self.reg_id.load(Ordering::Acquire));
        self.halt();
        self.platform.disconnect().ok();
    }
}
