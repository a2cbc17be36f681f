//! # Capstan
//!
//! A cross-platform asynchronous socket toolkit: TCP and UDP, client and
//! server, wrapped in a uniform **state-machine-driven, delegate-callback**
//! API.
//!
//! ## Architecture
//!
//! Capstan is structured around three cooperating pieces:
//!
//! - **Per-endpoint state machines**: every socket owns one lifecycle
//!   [`State`] guarded by a mutex; operations are legal only from explicit
//!   state sets and illegal requests are rejected without side effects.
//! - **Worker threads**: every blocking operation (send, receive, connect,
//!   bind, accept, broadcast) runs on a dedicated thread that publishes into
//!   a mutex-guarded result slot. Workers never call user code.
//! - **The frame pump**: the host application calls [`update`] periodically;
//!   the pump harvests worker results and dispatches all delegate callbacks
//!   on the calling thread.
//!
//! There is no event loop and no async/await: the model is
//! blocking-thread-per-operation with cooperative handoff to the pump.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use capstan::{Config, Endpoint, Host, SocketDelegate, TcpSocket};
//!
//! struct Greeter;
//!
//! impl SocketDelegate for Greeter {
//!     fn on_connected(&mut self, socket: &TcpSocket) {
//!         socket.send_async("hello").expect("accepted for execution");
//!     }
//!     fn on_sent(&mut self, _socket: &TcpSocket, byte_count: usize) {
//!         println!("sent {byte_count} bytes");
//!     }
//! }
//!
//! capstan::init(Config::default());
//! let socket = TcpSocket::new(Greeter);
//! socket
//!     .connect_async(Endpoint::new(Host::LOCALHOST, 5555))
//!     .expect("accepted for execution");
//! loop {
//!     // drives every delegate callback, on this thread
//!     capstan::update(Duration::from_millis(16));
//!     std::thread::sleep(Duration::from_millis(16));
//! }
//! ```
//!
//! ## Threading contract
//!
//! - Delegate callbacks fire only inside [`update`], on the calling thread,
//!   with no internal lock held, so delegates may re-enter the endpoint API.
//! - Per socket, send completions are FIFO and received chunks arrive in
//!   order; `on_sent` precedes `on_send_finished`, `on_received` precedes
//!   `on_receive_finished`.
//! - Dropping the last handle of an endpoint stops and joins its workers.
//! - Do not call [`update`] from inside a delegate callback.

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::missing_errors_doc)] // error conditions documented per operation

mod binding;
mod delegate;
mod registry;
mod server;
mod tcp;
mod udp;
mod worker;

/// Development helpers (benches/tests)
pub mod dev_tracing;

// Re-export core types
pub use capstan_core::adapter::NetworkAdapter;
pub use capstan_core::platform::{PlatformSocket, SocketKind};
pub use capstan_core::config::Config;
pub use capstan_core::error::{Error, Result};
pub use capstan_core::host::{Endpoint, Host, HostParseError};
pub use capstan_core::state::State;
pub use capstan_core::stream::Stream;

pub use delegate::{ServerDelegate, SocketDelegate, UdpDelegate};
pub use registry::{init, shutdown, update};
pub use server::TcpServer;
pub use tcp::TcpSocket;
pub use udp::UdpSocket;
