//! Binding aspect shared by bindable endpoints.
//!
//! Servers and UDP sockets both own one of these. The aspect is constructed
//! with clones of the owner's shared state mutex and local-endpoint slot, so
//! it operates directly on the owner's fields; it drives the binder worker
//! and yields [`BindEvent`]s that the owner maps onto its own delegate after
//! releasing every lock.

use std::sync::Arc;

use capstan_core::error::{Error, Result};
use capstan_core::host::{Endpoint, Host};
use capstan_core::platform::PlatformSocket;
use capstan_core::state::{check_state, State};
use parking_lot::Mutex;

use crate::worker::timed::{bind_once, Binder};

/// Outcome of an async bind or unbind, ready for delegate dispatch.
pub(crate) enum BindEvent {
    Bound,
    BindFailed,
    Unbound,
    UnbindFailed,
}

pub(crate) struct BindingAspect {
    platform: Arc<PlatformSocket>,
    state: Arc<Mutex<State>>,
    local: Arc<Mutex<Option<Endpoint>>>,
    binder: Binder,
    /// Servers listen right after binding.
    listen: bool,
}

impl BindingAspect {
    pub fn new(
        platform: Arc<PlatformSocket>,
        state: Arc<Mutex<State>>,
        local: Arc<Mutex<Option<Endpoint>>>,
        listen: bool,
    ) -> Self {
        Self {
            platform,
            state,
            local,
            binder: Binder::new(),
            listen,
        }
    }

    /// Bind to `host:port` on the binder worker; outcome arrives through the
    /// owner's delegate. Port 0 asks the OS to pick.
    pub fn bind_async(&self, host: Host, port: u16) -> Result<()> {
        let mut state = self.state.lock();
        check_state(*state, &[State::Idle], "bind")?;
        let mut control = self.binder.worker.lock();
        *state = State::Binding;
        control.result = State::Running;
        control.running = true;
        control.executing = true;
        control.ext.bound = None;
        drop(control);
        drop(state);
        if let Err(e) = self
            .binder
            .start_bind(Arc::clone(&self.platform), Endpoint::new(host, port), self.listen)
        {
            let mut state = self.state.lock();
            self.binder.worker.abort_launch();
            *state = State::Idle;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Bind on the calling thread. Returns the resolved local endpoint.
    pub fn bind(&self, host: Host, port: u16) -> Result<Endpoint> {
        {
            let mut state = self.state.lock();
            check_state(*state, &[State::Idle], "bind")?;
            *state = State::Binding;
        }
        let result = bind_once(&self.platform, Endpoint::new(host, port), self.listen);
        let mut state = self.state.lock();
        match result {
            Ok(endpoint) => {
                *state = State::Bound;
                *self.local.lock() = Some(endpoint);
                Ok(endpoint)
            }
            Err(e) => {
                *state = State::Idle;
                self.platform.disconnect().ok();
                Err(e)
            }
        }
    }

    /// Unbind on the binder worker; outcome arrives through the owner's
    /// delegate.
    pub fn unbind_async(&self) -> Result<()> {
        let mut state = self.state.lock();
        check_state(*state, &[State::Bound], "unbind")?;
        let mut control = self.binder.worker.lock();
        *state = State::Unbinding;
        control.result = State::Running;
        control.running = true;
        drop(control);
        drop(state);
        if let Err(e) = self.binder.start_unbind(Arc::clone(&self.platform)) {
            let mut state = self.state.lock();
            self.binder.worker.abort_launch();
            *state = State::Bound;
            return Err(Error::Io(e));
        }
        Ok(())
    }

    /// Unbind on the calling thread.
    pub fn unbind(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            check_state(*state, &[State::Bound], "unbind")?;
            *state = State::Unbinding;
        }
        let result = self.platform.disconnect();
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                *state = State::Idle;
                *self.local.lock() = None;
                Ok(())
            }
            Err(e) => {
                *state = State::Bound;
                Err(e)
            }
        }
    }

    /// Harvest the binder result. The returned event must be dispatched to
    /// the delegate only after the caller holds no locks.
    pub fn update(&self) -> Option<BindEvent> {
        let mut state = self.state.lock();
        let mut control = self.binder.worker.lock();
        let result = control.result;
        if !result.is_terminal() {
            return None;
        }
        control.result = State::Idle;
        control.running = false;
        let event = match (*state, result) {
            (State::Binding, State::Finished) => {
                *state = State::Bound;
                *self.local.lock() = control.ext.bound.take();
                BindEvent::Bound
            }
            (State::Binding, _) => {
                *state = State::Idle;
                BindEvent::BindFailed
            }
            (State::Unbinding, State::Finished) => {
                *state = State::Idle;
                *self.local.lock() = None;
                BindEvent::Unbound
            }
            (State::Unbinding, _) => {
                *state = State::Bound;
                BindEvent::UnbindFailed
            }
            // stale result from an endpoint torn down mid-operation
            _ => return None,
        };
        Some(event)
    }

    pub fn halt(&self) {
        self.binder.worker.stop_and_join();
    }
}
