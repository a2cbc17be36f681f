//! Datagram broadcast worker.
//!
//! Owns a payload stream, an adapter list and a target port; sends the
//! payload to every adapter's broadcast address. Composes with send and
//! receive in the state lattice the same way a plain send does.

use std::io;
use std::sync::Arc;
use std::thread;

use capstan_core::adapter::NetworkAdapter;
use capstan_core::config;
use capstan_core::error::Result;
use capstan_core::platform::PlatformSocket;
use capstan_core::state::State;
use capstan_core::stream::Stream;
use tracing::warn;

use super::{Shared, Worker};

pub(crate) struct Broadcaster {
    pub worker: Worker<()>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            worker: Worker::new("capstan broadcaster worker", ()),
        }
    }

    pub fn start(
        &self,
        platform: Arc<PlatformSocket>,
        adapters: Vec<NetworkAdapter>,
        port: u16,
        payload: Stream,
    ) -> io::Result<()> {
        self.worker
            .spawn(move |shared| run(&platform, &adapters, port, &payload, &shared))
    }
}

fn run(
    platform: &PlatformSocket,
    adapters: &[NetworkAdapter],
    port: u16,
    payload: &Stream,
    shared: &Shared<()>,
) {
    for adapter in adapters {
        if !shared.lock().running {
            break;
        }
        if let Err(e) = broadcast_one(platform, adapter, port, payload, || shared.lock().running) {
            let mut control = shared.lock();
            control.result = if control.running {
                warn!(
                    tag = %config::get().log_tag,
                    adapter = %adapter.name,
                    error = %e,
                    "broadcast failed"
                );
                State::Failed
            } else {
                State::Finished
            };
            return;
        }
    }
    shared.lock().result = State::Finished;
}

fn broadcast_one(
    platform: &PlatformSocket,
    adapter: &NetworkAdapter,
    port: u16,
    payload: &Stream,
    keep_going: impl Fn() -> bool,
) -> Result<()> {
    let retry = config::retry_timeout();
    loop {
        match platform.broadcast(adapter, port, payload.peek_remaining()) {
            Ok(_) => return Ok(()),
            Err(e) if e.is_recoverable() && keep_going() => thread::sleep(retry),
            Err(e) => return Err(e),
        }
    }
}

/// Synchronous broadcast used by the blocking variants; runs on the caller
/// thread.
pub(crate) fn broadcast_blocking(
    platform: &PlatformSocket,
    adapters: &[NetworkAdapter],
    port: u16,
    payload: &Stream,
) -> Result<()> {
    for adapter in adapters {
        broadcast_one(platform, adapter, port, payload, || true)?;
    }
    Ok(())
}
