//! Capstan error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::host::{Host, HostParseError};
use crate::state::State;

/// Main error type for capstan operations.
///
/// Synchronous operations surface these directly; asynchronous operations
/// return one only when the request is rejected up front (the final outcome
/// of an accepted request is delivered through the delegate instead).
#[derive(Error, Debug)]
pub enum Error {
    /// Operation not permitted in the endpoint's current state. The endpoint
    /// is unchanged.
    #[error("operation `{op}` not permitted in state `{state}`")]
    IllegalState {
        op: &'static str,
        state: State,
    },

    /// The platform socket reported a failure.
    #[error("platform socket error: {0}")]
    Io(#[from] io::Error),

    /// A one-shot operation exceeded its timeout budget.
    #[error("operation `{op}` timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        timeout: Duration,
    },

    /// The remote endpoint closed the connection cleanly.
    #[error("remote endpoint closed the connection")]
    RemoteClosed,

    /// The platform socket has no open descriptor.
    #[error("socket is not open")]
    NotOpen,

    /// Nothing to send.
    #[error("no data to send")]
    NoData,

    /// A UDP send was attempted without a destination.
    #[error("no destination set")]
    NoDestination,

    /// A multicast leave was attempted for a membership never joined.
    #[error("interface {interface} is not joined to multicast group {group}")]
    MulticastNotJoined {
        interface: Host,
        group: Host,
    },

    /// Invalid host string.
    #[error(transparent)]
    Host(#[from] HostParseError),
}

/// Result type alias for capstan operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for a state-check rejection, which is guaranteed side-effect
    /// free.
    #[must_use]
    pub const fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState { .. })
    }

    /// True when retrying later could succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
            ),
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}
