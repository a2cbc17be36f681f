//! Outbound transfer worker.
//!
//! The sender owns the payload stream for the duration of the transfer and
//! drains it in chunks, sleeping the configured retry timeout between
//! partial sends. Progress is published into `last_sent` for the pump to
//! surface as `on_sent` callbacks.

use std::io;
use std::sync::Arc;
use std::thread;

use capstan_core::config;
use capstan_core::error::Result;
use capstan_core::platform::PlatformSocket;
use capstan_core::state::State;
use capstan_core::stream::Stream;
use tracing::warn;

use super::{Shared, Worker};

/// Sender-specific extension of the worker control record.
#[derive(Default)]
pub(crate) struct SendProgress {
    /// Bytes sent since the pump last harvested. Reset by the pump.
    pub last_sent: usize,
}

pub(crate) struct Sender {
    pub worker: Worker<SendProgress>,
}

impl Sender {
    pub fn new() -> Self {
        Self {
            worker: Worker::new("capstan sender worker", SendProgress::default()),
        }
    }

    /// Start draining `payload`. The caller has validated the state
    /// transition and armed the control record.
    pub fn start(&self, platform: Arc<PlatformSocket>, payload: Stream) -> io::Result<()> {
        self.worker.spawn(move |shared| run(&platform, payload, &shared))
    }
}

fn run(platform: &PlatformSocket, mut stream: Stream, shared: &Shared<SendProgress>) {
    let retry = config::retry_timeout();
    loop {
        if !shared.lock().running {
            break;
        }
        match platform.send(stream.peek_remaining()) {
            Ok(n) => {
                stream.advance(n);
                if n > 0 {
                    let mut control = shared.lock();
                    control.ext.last_sent += n;
                    if stream.remaining() == 0 {
                        control.result = State::Finished;
                        return;
                    }
                }
            }
            Err(e) if e.is_recoverable() => {}
            Err(e) => {
                let mut control = shared.lock();
                // owner-initiated teardown is not a send failure
                control.result = if control.running {
                    warn!(tag = %config::get().log_tag, error = %e, "send failed");
                    State::Failed
                } else {
                    State::Finished
                };
                return;
            }
        }
        thread::sleep(retry);
    }
    shared.lock().result = State::Finished;
}

/// Synchronous drain used by the blocking send variants; runs on the caller
/// thread with the same chunk-and-sleep cadence as the worker.
pub(crate) fn send_blocking(
    platform: &PlatformSocket,
    stream: &mut Stream,
    count: usize,
) -> Result<usize> {
    let retry = config::retry_timeout();
    let mut remaining = count.min(stream.remaining());
    let mut total = 0;
    while remaining > 0 {
        match platform.send(&stream.peek_remaining()[..remaining]) {
            Ok(n) => {
                stream.advance(n);
                remaining -= n;
                total += n;
                if remaining == 0 {
                    break;
                }
            }
            Err(e) if e.is_recoverable() => {}
            Err(e) => return Err(e),
        }
        thread::sleep(retry);
    }
    Ok(total)
}
