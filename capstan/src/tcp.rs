//! TCP client socket.
//!
//! A connected endpoint owning a sender, a receiver and a connector worker.
//! Asynchronous operations return `Ok(())` once accepted for execution; the
//! final outcome arrives through the [`SocketDelegate`] during
//! [`crate::update`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capstan_core::config;
use capstan_core::error::{Error, Result};
use capstan_core::host::{Endpoint, Host};
use capstan_core::platform::{PlatformSocket, SocketKind};
use capstan_core::state::{check_state, State};
use capstan_core::stream::Stream;
use parking_lot::Mutex;
use tracing::warn;

use crate::delegate::SocketDelegate;
use crate::registry::{self, Pump};
use crate::worker::receiver::Receiver;
use crate::worker::sender::{self, Sender};
use crate::worker::timed::{connect_with_retry, Connector};

/// Delegate shared between a server and all sockets it accepts.
pub(crate) type SharedSocketDelegate = Arc<Mutex<Box<dyn SocketDelegate>>>;

/// Rest state a TCP client returns to when composite activity ends.
const IDLE_STATE: State = State::Connected;

/// Bytes per blocking receive attempt.
const RECEIVE_CHUNK: usize = 8192;

pub(crate) struct TcpInner {
    platform: Arc<PlatformSocket>,
    state: Arc<Mutex<State>>,
    remote: Mutex<Option<Endpoint>>,
    local: Mutex<Option<Endpoint>>,
    sender: Sender,
    receiver: Receiver,
    connector: Connector,
    delegate: SharedSocketDelegate,
    reg_id: AtomicU64,
}

/// A TCP client socket handle.
///
/// Handles are cheap clones of a shared endpoint; the endpoint's workers are
/// stopped and joined when the last handle is dropped.
#[derive(Clone)]
pub struct TcpSocket {
    inner: Arc<TcpInner>,
}

enum ConnectorEvent {
    Connected,
    ConnectFailed(Option<Endpoint>),
    Disconnected(Option<Endpoint>),
    DisconnectFailed,
}

impl TcpSocket {
    /// New idle socket reporting to `delegate`.
    ///
    /// # Panics
    ///
    /// Panics when the library is not initialized.
    pub fn new(delegate: impl SocketDelegate + 'static) -> TcpSocket {
        Self::with_shared_delegate(Arc::new(Mutex::new(Box::new(delegate))))
    }

    pub(crate) fn with_shared_delegate(delegate: SharedSocketDelegate) -> TcpSocket {
        Self::build(
            Arc::new(PlatformSocket::new(SocketKind::Tcp)),
            State::Idle,
            None,
            None,
            delegate,
        )
    }

    /// Wrap a freshly accepted platform socket; used by the server's pump.
    pub(crate) fn from_accepted(
        platform: PlatformSocket,
        remote: Endpoint,
        delegate: SharedSocketDelegate,
    ) -> TcpSocket {
        let local = platform.local_endpoint().ok();
        Self::build(
            Arc::new(platform),
            State::Connected,
            Some(remote),
            local,
            delegate,
        )
    }

    fn build(
        platform: Arc<PlatformSocket>,
        state: State,
        remote: Option<Endpoint>,
        local: Option<Endpoint>,
        delegate: SharedSocketDelegate,
    ) -> TcpSocket {
        let inner = Arc::new(TcpInner {
            platform,
            state: Arc::new(Mutex::new(state)),
            remote: Mutex::new(remote),
            local: Mutex::new(local),
            sender: Sender::new(),
            receiver: Receiver::new(),
            connector: Connector::new(),
            delegate,
            reg_id: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&(Arc::clone(&inner) as Arc<dyn Pump>));
        let id = registry::register(weak);
        inner.reg_id.store(id, Ordering::Release);
        TcpSocket { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.inner.state.lock()
    }

    /// True while connected (including composite send/receive states).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            State::Connected | State::Sending | State::Receiving | State::SendingReceiving
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

    /// Local endpoint, once known.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        *self.inner.local.lock()
    }

    /// Remote endpoint, once known.
    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        *self.inner.remote.lock()
    }

    /// Connect to `remote` on the connector worker. Outcome:
    /// `on_connected` or `on_connect_failed`.
    pub fn connect_async(&self, remote: Endpoint) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        check_state(*state, &[State::Idle], "connect")?;
        let mut control = inner.connector.worker.lock();
        *state = State::Connecting;
        control.result = State::Running;
        control.running = true;
        drop(control);
        *inner.remote.lock() = Some(remote);
        drop(state);
        if let Err(e) = inner.connector.start_connect(Arc::clone(&inner.platform), remote) {
            let mut state = inner.state.lock();
            inner.connector.worker.abort_launch();
            *state = State::Idle;
            *inner.remote.lock() = None;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Connect on the calling thread, retrying until the configured
    /// connection timeout.
    pub fn connect(&self, remote: Endpoint) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            check_state(*state, &[State::Idle], "connect")?;
            *state = State::Connecting;
        }
        let result = connect_with_retry(&self.inner.platform, remote, || true);
        let mut state = self.inner.state.lock();
        match result {
            Ok(()) => {
                *state = State::Connected;
                *self.inner.remote.lock() = Some(remote);
                *self.inner.local.lock() = self.inner.platform.local_endpoint().ok();
                Ok(())
            }
            Err(e) => {
                *state = State::Idle;
                self.inner.platform.disconnect().ok();
                Err(e)
            }
        }
    }

    /// Disconnect on the connector worker. Outcome: `on_disconnected` or
    /// `on_disconnect_failed`. Any in-flight transfer is stopped first.
    pub fn disconnect_async(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        check_state(
            *state,
            &[
                State::Connected,
                State::Sending,
                State::Receiving,
                State::SendingReceiving,
            ],
            "disconnect",
        )?;
        let mut control = inner.connector.worker.lock();
        *state = State::Disconnecting;
        control.result = State::Running;
        control.running = true;
        drop(control);
        drop(state);
        inner.sender.worker.stop();
        inner.receiver.worker.stop();
        if let Err(e) = inner.connector.start_disconnect(Arc::clone(&inner.platform)) {
            let mut state = inner.state.lock();
            inner.connector.worker.abort_launch();
            *state = State::Connected;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Disconnect on the calling thread. In-flight transfers are stopped and
    /// joined; their pending results are discarded without callbacks.
    pub fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            check_state(
                *state,
                &[
                    State::Connected,
                    State::Sending,
                    State::Receiving,
                    State::SendingReceiving,
                ],
                "disconnect",
            )?;
            *state = State::Disconnecting;
        }
        self.inner.sender.worker.stop_and_join();
        self.inner.receiver.worker.stop_and_join();
        self.inner.sender.worker.abort_launch();
        self.inner.receiver.worker.abort_launch();
        let result = self.inner.platform.disconnect();
        let mut state = self.inner.state.lock();
        *state = State::Idle;
        *self.inner.remote.lock() = None;
        *self.inner.local.lock() = None;
        result
    }

    /// Send the whole payload on the sender worker. Progress arrives as
    /// `on_sent`; outcome as `on_send_finished` or `on_send_failed`.
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
        let mut state = inner.state.lock();
        check_state(*state, &[State::Connected, State::Receiving], "send")?;
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
        {
            let mut state = inner.state.lock();
            check_state(*state, &[State::Connected, State::Receiving], "send")?;
            *state = state.adding_send();
        }
        let result = sender::send_blocking(&inner.platform, stream, count);
        let mut state = inner.state.lock();
        *state = state.removing_send(IDLE_STATE);
        drop(state);
        result
    }

    /// Receive on the calling thread, blocking until data, close or failure.
    /// `max_bytes == 0` means one default-sized chunk.
    pub fn receive(&self, max_bytes: usize) -> Result<Stream> {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            check_state(*state, &[State::Connected, State::Sending], "receive")?;
            *state = state.adding_receive();
        }
        let want = if max_bytes > 0 {
            max_bytes.min(RECEIVE_CHUNK)
        } else {
            RECEIVE_CHUNK
        };
        let mut buf = vec![0u8; want];
        let result = loop {
            match inner.platform.receive(&mut buf) {
                Ok(0) => break Err(Error::RemoteClosed),
                Ok(n) => break Ok(Stream::from(&buf[..n])),
                Err(e) if e.is_recoverable() => {}
                Err(e) => break Err(e),
            }
        };
        let mut state = inner.state.lock();
        *state = state.removing_receive(IDLE_STATE);
        drop(state);
        result
    }

    /// Start the receiver worker. Chunks arrive as `on_received`; the end as
    /// `on_receive_finished` or `on_receive_failed`. `max_bytes == 0` means
    /// unbounded.
    pub fn start_receive_async(&self, max_bytes: usize) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        check_state(*state, &[State::Connected, State::Sending], "start receiving")?;
        let mut control = inner.receiver.worker.lock();
        *state = state.adding_receive();
        control.result = State::Running;
        control.running = true;
        drop(control);
        drop(state);
        if let Err(e) = inner.receiver.start(Arc::clone(&inner.platform), max_bytes) {
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
}

impl TcpInner {
    fn update_connector(&self, handle: &TcpSocket) {
        let event;
        {
            let mut state = self.state.lock();
            let mut control = self.connector.worker.lock();
            let result = control.result;
            if !result.is_terminal() {
                return;
            }
            control.result = State::Idle;
            control.running = false;
            event = match *state {
                State::Connecting => {
                    if result == State::Finished {
                        *state = State::Connected;
                        *self.local.lock() = self.platform.local_endpoint().ok();
                        ConnectorEvent::Connected
                    } else {
                        *state = State::Idle;
                        let old = self.remote.lock().take();
                        ConnectorEvent::ConnectFailed(old)
                    }
                }
                State::Disconnecting => {
                    if result == State::Finished {
                        *state = State::Idle;
                        let old = self.remote.lock().take();
                        *self.local.lock() = None;
                        ConnectorEvent::Disconnected(old)
                    } else {
                        *state = State::Connected;
                        ConnectorEvent::DisconnectFailed
                    }
                }
                // endpoint was torn down mid-operation
                _ => return,
            };
        }
        let mut delegate = self.delegate.lock();
        match event {
            ConnectorEvent::Connected => delegate.on_connected(handle),
            ConnectorEvent::ConnectFailed(old) => {
                let old = old.unwrap_or(Endpoint::new(Host::ANY, 0));
                delegate.on_connect_failed(handle, old.host, old.port);
            }
            ConnectorEvent::Disconnected(old) => {
                let old = old.unwrap_or(Endpoint::new(Host::ANY, 0));
                delegate.on_disconnected(handle, old.host, old.port);
            }
            ConnectorEvent::DisconnectFailed => delegate.on_disconnect_failed(handle),
        }
    }

    fn update_sending(&self, handle: &TcpSocket) {
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

    fn update_receiving(&self, handle: &TcpSocket) {
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
        // drained outside the worker mutex; chunks queued before a terminal
        // result are all present by the time the result is observed
        let chunks = self.receiver.drain();
        for chunk in chunks {
            self.delegate.lock().on_received(handle, chunk);
        }
        match result {
            State::Finished => self.delegate.lock().on_receive_finished(handle),
            State::Failed => self.delegate.lock().on_receive_failed(handle),
            _ => {}
        }
    }
}

impl Pump for TcpInner {
    fn pump(self: Arc<Self>, _dt: Duration) {
        let handle = TcpSocket {
            inner: Arc::clone(&self),
        };
        self.update_connector(&handle);
        self.update_sending(&handle);
        self.update_receiving(&handle);
    }

    fn halt(&self) {
        self.sender.worker.stop_and_join();
        self.receiver.worker.stop_and_join();
        self.connector.worker.stop_and_join();
    }
}

impl Drop for TcpInner {
    fn drop(&mut self) {
        registry::unregister(self.reg_id.load(Ordering::Acquire));
        self.halt();
        self.platform.disconnect().ok();
    }
}
