//! Socket lifecycle states and transition legality.
//!
//! Every endpoint owns a single `State` guarded by its state mutex; every
//! worker thread owns a result slot holding a `State` as well. The composite
//! values `Sending`, `Receiving` and `SendingReceiving` encode concurrent
//! activity inside the flat enum, and the `adding_*` / `removing_*` helpers
//! implement the two-bit arithmetic on top of it.

use std::fmt;

use tracing::warn;

use crate::config;
use crate::error::{Error, Result};

/// Lifecycle state of an endpoint or worker result slot.
///
/// `Finished` and `Failed` are terminal result markers only ever observed in
/// worker result slots; the remaining values are endpoint lifecycle states.
/// `Running` doubles as "server is listening" and "worker is processing".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Nothing bound, connected or in flight.
    Idle,
    /// A bind operation is in flight.
    Binding,
    /// A local endpoint is held.
    Bound,
    /// An unbind operation is in flight.
    Unbinding,
    /// A connect operation is in flight.
    Connecting,
    /// A remote endpoint is held.
    Connected,
    /// A disconnect operation is in flight.
    Disconnecting,
    /// An outbound transfer is in flight.
    Sending,
    /// An inbound transfer is in flight.
    Receiving,
    /// Outbound and inbound transfers are in flight concurrently.
    SendingReceiving,
    /// Server is accepting, or a worker is actively processing.
    Running,
    /// Terminal worker result: completed.
    Finished,
    /// Terminal worker result: failed.
    Failed,
}

impl State {
    /// Short lowercase name, used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Binding => "binding",
            Self::Bound => "bound",
            Self::Unbinding => "unbinding",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::SendingReceiving => "sending-receiving",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    /// True for the terminal worker-result markers.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// True while an outbound transfer is in flight.
    pub const fn is_sending(self) -> bool {
        matches!(self, Self::Sending | Self::SendingReceiving)
    }

    /// True while an inbound transfer is in flight.
    pub const fn is_receiving(self) -> bool {
        matches!(self, Self::Receiving | Self::SendingReceiving)
    }

    /// State after an outbound transfer starts.
    pub const fn adding_send(self) -> State {
        match self {
            Self::Receiving | Self::SendingReceiving => Self::SendingReceiving,
            _ => Self::Sending,
        }
    }

    /// State after the outbound transfer ends. `idle` is the endpoint's rest
    /// state (`Connected` for TCP clients, `Bound` for UDP sockets).
    pub const fn removing_send(self, idle: State) -> State {
        match self {
            Self::SendingReceiving => Self::Receiving,
            _ => idle,
        }
    }

    /// State after an inbound transfer starts.
    pub const fn adding_receive(self) -> State {
        match self {
            Self::Sending | Self::SendingReceiving => Self::SendingReceiving,
            _ => Self::Receiving,
        }
    }

    /// State after the inbound transfer ends.
    pub const fn removing_receive(self, idle: State) -> State {
        match self {
            Self::SendingReceiving => Self::Sending,
            _ => idle,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check that `current` permits `op`.
///
/// Rejection logs a warning and returns [`Error::IllegalState`]; the caller
/// must not have mutated anything yet, so a rejected operation has no side
/// effect.
pub fn check_state(current: State, allowed: &[State], op: &'static str) -> Result<()> {
    if allowed.contains(&current) {
        return Ok(());
    }
    warn!(
        tag = %config::get().log_tag,
        op,
        state = %current,
        "operation not permitted in current state"
    );
    Err(Error::IllegalState { op, state: current })
}
