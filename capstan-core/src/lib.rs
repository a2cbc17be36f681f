//! Capstan Core
//!
//! This crate contains the runtime-agnostic core building blocks:
//! - Lifecycle state lattice + transition legality (`state`)
//! - Owned seekable byte buffer (`stream`)
//! - Host / endpoint value types (`host`)
//! - Network adapter descriptors (`adapter`)
//! - Blocking platform socket primitive (`platform`)
//! - Process-wide configuration (`config`)
//! - Error types (`error`)

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod adapter;
pub mod config;
pub mod error;
pub mod host;
pub mod platform;
pub mod state;
pub mod stream;

/// The handful of types nearly every downstream module touches.
pub mod prelude {
    pub use crate::adapter::NetworkAdapter;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::host::{Endpoint, Host};
    pub use crate::platform::{PlatformSocket, SocketKind};
    pub use crate::state::{check_state, State};
    pub use crate::stream::Stream;
}
