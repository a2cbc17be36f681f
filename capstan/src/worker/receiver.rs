//! Inbound transfer workers for stream and datagram sockets.
//!
//! Receivers pump bytes into a delivery queue the owner drains during
//! `update`. The platform read timeout doubles as the poll interval, which
//! bounds how long a cancellation request can go unobserved.

use std::io;
use std::sync::Arc;

use capstan_core::config;
use capstan_core::host::Host;
use capstan_core::platform::PlatformSocket;
use capstan_core::state::State;
use capstan_core::stream::Stream;
use smallvec::SmallVec;
use tracing::warn;

use super::{Shared, Worker};

/// Bytes per read attempt on a stream socket.
const READ_CHUNK: usize = 8192;

/// Buffer size for a single datagram.
const DATAGRAM_CHUNK: usize = 65536;

/// Stream-socket receiver.
pub(crate) struct Receiver {
    pub worker: Worker<()>,
    tx: flume::Sender<Stream>,
    rx: flume::Receiver<Stream>,
}

impl Receiver {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            worker: Worker::new("capstan receiver worker", ()),
            tx,
            rx,
        }
    }

    /// Start receiving. `max_bytes == 0` means unbounded; otherwise the
    /// worker finishes once that many bytes were delivered.
    pub fn start(&self, platform: Arc<PlatformSocket>, max_bytes: usize) -> io::Result<()> {
        let tx = self.tx.clone();
        self.worker
            .spawn(move |shared| run_stream(&platform, &tx, max_bytes, &shared))
    }

    /// Harvest queued chunks, in arrival order.
    pub fn drain(&self) -> SmallVec<[Stream; 4]> {
        self.rx.try_iter().collect()
    }
}

fn run_stream(
    platform: &PlatformSocket,
    tx: &flume::Sender<Stream>,
    max_bytes: usize,
    shared: &Shared<()>,
) {
    if let Err(e) = platform.set_read_timeout(Some(config::retry_frequency())) {
        warn!(tag = %config::get().log_tag, error = %e, "receive setup failed");
        shared.lock().result = State::Failed;
        return;
    }
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0usize;
    loop {
        if !shared.lock().running {
            break;
        }
        let want = if max_bytes > 0 {
            buf.len().min(max_bytes - total)
        } else {
            buf.len()
        };
        match platform.receive(&mut buf[..want]) {
            // clean close by the remote side
            Ok(0) => {
                shared.lock().result = State::Finished;
                return;
            }
            Ok(n) => {
                total += n;
                let _ = tx.send(Stream::from(&buf[..n]));
                if max_bytes > 0 && total >= max_bytes {
                    shared.lock().result = State::Finished;
                    return;
                }
            }
            Err(e) if e.is_recoverable() => {}
            Err(e) => {
                let mut control = shared.lock();
                control.result = if control.running {
                    warn!(tag = %config::get().log_tag, error = %e, "receive failed");
                    State::Failed
                } else {
                    State::Finished
                };
                return;
            }
        }
    }
    shared.lock().result = State::Finished;
}

/// One received datagram.
pub(crate) struct Datagram {
    pub host: Host,
    pub port: u16,
    pub stream: Stream,
}

/// Datagram-socket receiver.
pub(crate) struct UdpReceiver {
    pub worker: Worker<()>,
    tx: flume::Sender<Datagram>,
    rx: flume::Receiver<Datagram>,
}

impl UdpReceiver {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            worker: Worker::new("capstan receiver worker", ()),
            tx,
            rx,
        }
    }

    /// Start receiving. `max_packages` bounds datagrams read per worker
    /// iteration before flags are rechecked; zero or negative means
    /// unbounded.
    pub fn start(&self, platform: Arc<PlatformSocket>, max_packages: i32) -> io::Result<()> {
        let tx = self.tx.clone();
        self.worker
            .spawn(move |shared| run_datagram(&platform, &tx, max_packages, &shared))
    }

    /// Harvest queued datagrams, in arrival order.
    pub fn drain(&self) -> SmallVec<[Datagram; 4]> {
        self.rx.try_iter().collect()
    }
}

fn run_datagram(
    platform: &PlatformSocket,
    tx: &flume::Sender<Datagram>,
    max_packages: i32,
    shared: &Shared<()>,
) {
    if let Err(e) = platform.set_read_timeout(Some(config::retry_frequency())) {
        warn!(tag = %config::get().log_tag, error = %e, "receive setup failed");
        shared.lock().result = State::Failed;
        return;
    }
    let mut buf = vec![0u8; DATAGRAM_CHUNK];
    'run: loop {
        if !shared.lock().running {
            break;
        }
        let mut batch = 0i32;
        loop {
            match platform.receive_from(&mut buf) {
                Ok((n, from)) => {
                    let _ = tx.send(Datagram {
                        host: from.host,
                        port: from.port,
                        stream: Stream::from(&buf[..n]),
                    });
                    batch += 1;
                    if max_packages > 0 && batch >= max_packages {
                        break;
                    }
                    if !shared.lock().running {
                        break 'run;
                    }
                }
                Err(e) if e.is_recoverable() => break,
                Err(e) => {
                    let mut control = shared.lock();
                    control.result = if control.running {
                        warn!(tag = %config::get().log_tag, error = %e, "receive failed");
                        State::Failed
                    } else {
                        State::Finished
                    };
                    return;
                }
            }
        }
    }
    shared.lock().result = State::Finished;
}
