//! TCP server.
//!
//! A listening endpoint composing the binding aspect with an accepter
//! worker. Accepted connections are wrapped into child [`TcpSocket`]s owned
//! by the server; the delegate receives a handle clone for each.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use capstan_core::error::{Error, Result};
use capstan_core::host::{Endpoint, Host};
use capstan_core::platform::{PlatformSocket, SocketKind};
use capstan_core::state::{check_state, State};
use parking_lot::Mutex;

use crate::binding::{BindEvent, BindingAspect};
use crate::delegate::{ServerDelegate, SocketDelegate};
use crate::registry::{self, Pump};
use crate::tcp::{SharedSocketDelegate, TcpSocket};
use crate::worker::timed::Accepter;

pub(crate) struct ServerInner {
    platform: Arc<PlatformSocket>,
    state: Arc<Mutex<State>>,
    local: Arc<Mutex<Option<Endpoint>>>,
    binding: BindingAspect,
    accepter: Accepter,
    children: Mutex<Vec<TcpSocket>>,
    delegate: Mutex<Box<dyn ServerDelegate>>,
    accepted_delegate: SharedSocketDelegate,
    reg_id: AtomicU64,
}

/// A TCP server handle.
///
/// Handles are cheap clones of a shared endpoint; the endpoint's workers are
/// stopped and joined when the last handle is dropped.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    /// New idle server. `delegate` receives server callbacks;
    /// `accepted_delegate` is shared by every accepted child socket.
    ///
    /// # Panics
    ///
    /// Panics when the library is not initialized.
    pub fn new(
        delegate: impl ServerDelegate + 'static,
        accepted_delegate: impl SocketDelegate + 'static,
    ) -> TcpServer {
        let platform = Arc::new(PlatformSocket::new(SocketKind::Tcp));
        let state = Arc::new(Mutex::new(State::Idle));
        let local = Arc::new(Mutex::new(None));
        let inner = Arc::new(ServerInner {
            binding: BindingAspect::new(
                Arc::clone(&platform),
                Arc::clone(&state),
                Arc::clone(&local),
                true,
            ),
            platform,
            state,
            local,
            accepter: Accepter::new(),
            children: Mutex::new(Vec::new()),
            delegate: Mutex::new(Box::new(delegate)),
            accepted_delegate: Arc::new(Mutex::new(Box::new(accepted_delegate))),
            reg_id: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&(Arc::clone(&inner) as Arc<dyn Pump>));
        let id = registry::register(weak);
        inner.reg_id.store(id, Ordering::Release);
        TcpServer { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.inner.state.lock()
    }

    /// True while a local endpoint is held (bound or running).
    pub fn is_bound(&self) -> bool {
        matches!(self.state(), State::Bound | State::Running)
    }

    /// True while the accept loop runs.
    pub fn is_running(&self) -> bool {
        self.state() == State::Running
    }

    /// Local endpoint, once bound.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        *self.inner.local.lock()
    }

    /// Handles to every child socket accepted so far.
    pub fn sockets(&self) -> Vec<TcpSocket> {
        self.inner.children.lock().clone()
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
    /// `on_unbind_failed`.
    pub fn unbind_async(&self) -> Result<()> {
        self.inner.binding.unbind_async()
    }

    /// Unbind on the calling thread.
    pub fn unbind(&self) -> Result<()> {
        self.inner.binding.unbind()
    }

    /// Start the accept loop. Children arrive as `on_accepted`.
    pub fn start_async(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        check_state(*state, &[State::Bound], "start")?;
        let mut control = inner.accepter.worker.lock();
        *state = State::Running;
        control.result = State::Running;
        control.running = true;
        control.executing = true;
        drop(control);
        drop(state);
        if let Err(e) = inner.accepter.start(Arc::clone(&inner.platform)) {
            let mut state = inner.state.lock();
            inner.accepter.worker.abort_launch();
            *state = State::Bound;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Ask the accept loop to stop after its current attempt; `on_stopped`
    /// follows once it winds down.
    pub fn stop_async(&self) -> Result<()> {
        let state = self.inner.state.lock();
        check_state(*state, &[State::Running], "stop")?;
        self.inner.accepter.worker.finish();
        Ok(())
    }
}

impl Pump for ServerInner {
    fn pump(self: Arc<Self>, _dt: Duration) {
        let handle = TcpServer {
            inner: Arc::clone(&self),
        };
        if let Some(event) = self.binding.update() {
            let mut delegate = self.delegate.lock();
            match event {
                BindEvent::Bound => delegate.on_bound(&handle),
                BindEvent::BindFailed => delegate.on_bind_failed(&handle),
                BindEvent::Unbound => delegate.on_unbound(&handle),
                BindEvent::UnbindFailed => delegate.on_unbind_failed(&handle),
            }
        }
        for (platform, remote) in self.accepter.drain() {
            let child =
                TcpSocket::from_accepted(platform, remote, Arc::clone(&self.accepted_delegate));
            self.children.lock().push(child.clone());
            self.delegate.lock().on_accepted(&handle, child);
        }
        let result;
        {
            let mut state = self.state.lock();
            let mut control = self.accepter.worker.lock();
            result = control.result;
            if !result.is_terminal() {
                return;
            }
            control.result = State::Idle;
            control.running = false;
            control.executing = false;
            if *state == State::Running {
                *state = State::Bound;
            }
        }
        match result {
            State::Finished => self.delegate.lock().on_stopped(&handle),
            State::Failed => self.delegate.lock().on_start_failed(&handle),
            _ => {}
        }
    }

    fn halt(&self) {
        self.accepter.worker.stop_and_join();
        self.binding.halt();
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        registry::unregister(self.reg_id.load(Ordering::Acquire));
        self.halt();
        self.platform.disconnect().ok();
    }
}
