//! One-shot workers parameterized by timeout and retry cadence: connector,
//! binder and accepter.
//!
//! Each loops "attempt, sleep the retry frequency, attempt again" until the
//! operation succeeds, the timeout budget runs out, or the owner requests
//! termination. The accepter is the one long-runner of the family: it keeps
//! accepting until its `executing` flag is cleared.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use capstan_core::config;
use capstan_core::error::{Error, Result};
use capstan_core::host::Endpoint;
use capstan_core::platform::PlatformSocket;
use capstan_core::state::State;
use tracing::warn;

use super::{Shared, Worker};

/// Connect / disconnect worker.
pub(crate) struct Connector {
    pub worker: Worker<()>,
}

impl Connector {
    pub fn new() -> Self {
        Self {
            worker: Worker::new("capstan connector worker", ()),
        }
    }

    pub fn start_connect(&self, platform: Arc<PlatformSocket>, remote: Endpoint) -> io::Result<()> {
        self.worker.spawn(move |shared| {
            let result = connect_with_retry(&platform, remote, || shared.lock().running);
            let mut control = shared.lock();
            control.result = match result {
                Ok(()) => State::Finished,
                Err(e) => {
                    if control.running {
                        warn!(tag = %config::get().log_tag, remote = %remote, error = %e, "connect failed");
                    }
                    State::Failed
                }
            };
        })
    }

    pub fn start_disconnect(&self, platform: Arc<PlatformSocket>) -> io::Result<()> {
        self.worker.spawn(move |shared| {
            let result = platform.disconnect();
            let mut control = shared.lock();
            control.result = match result {
                Ok(()) => State::Finished,
                Err(e) => {
                    warn!(tag = %config::get().log_tag, error = %e, "disconnect failed");
                    State::Failed
                }
            };
        })
    }
}

/// Attempt to connect until success, cancellation or the configured
/// connection timeout. Shared by the connector worker and the blocking
/// connect variants.
pub(crate) fn connect_with_retry(
    platform: &PlatformSocket,
    remote: Endpoint,
    keep_going: impl Fn() -> bool,
) -> Result<()> {
    let timeout = config::connection_timeout();
    let retry = config::retry_frequency();
    let deadline = Instant::now() + timeout;
    loop {
        if !keep_going() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "cancelled",
            )));
        }
        // each attempt gets the remaining budget; quick failures (refused,
        // unreachable) are retried at the configured cadence
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout {
                op: "connect",
                timeout,
            });
        }
        match platform.connect(remote, remaining) {
            Ok(()) => return Ok(()),
            Err(e) => {
                if Instant::now() >= deadline {
                    return if e.is_recoverable() {
                        Err(Error::Timeout {
                            op: "connect",
                            timeout,
                        })
                    } else {
                        Err(e)
                    };
                }
                // a failed stream connect leaves the descriptor unusable
                platform.disconnect().ok();
            }
        }
        thread::sleep(retry);
    }
}

/// Extension slot the binder publishes the resolved local endpoint into.
#[derive(Default)]
pub(crate) struct BindSlot {
    pub bound: Option<Endpoint>,
}

/// Bind / unbind worker.
pub(crate) struct Binder {
    pub worker: Worker<BindSlot>,
}

impl Binder {
    pub fn new() -> Self {
        Self {
            worker: Worker::new("capstan binder worker", BindSlot::default()),
        }
    }

    pub fn start_bind(
        &self,
        platform: Arc<PlatformSocket>,
        local: Endpoint,
        listen: bool,
    ) -> io::Result<()> {
        self.worker.spawn(move |shared| {
            let result = bind_with_retry(&platform, local, listen, || shared.lock().running);
            let mut control = shared.lock();
            control.result = match result {
                Ok(endpoint) => {
                    control.ext.bound = Some(endpoint);
                    State::Finished
                }
                Err(e) => {
                    if control.running {
                        warn!(tag = %config::get().log_tag, local = %local, error = %e, "bind failed");
                    }
                    State::Failed
                }
            };
        })
    }

    pub fn start_unbind(&self, platform: Arc<PlatformSocket>) -> io::Result<()> {
        self.worker.spawn(move |shared| {
            let result = platform.disconnect();
            let mut control = shared.lock();
            control.result = match result {
                Ok(()) => State::Finished,
                Err(e) => {
                    warn!(tag = %config::get().log_tag, error = %e, "unbind failed");
                    State::Failed
                }
            };
        })
    }
}

/// One bind attempt: bind, optionally listen, report the resolved local
/// endpoint.
pub(crate) fn bind_once(
    platform: &PlatformSocket,
    local: Endpoint,
    listen: bool,
) -> Result<Endpoint> {
    let endpoint = platform.bind(local)?;
    if listen {
        platform.listen()?;
    }
    Ok(endpoint)
}

fn bind_with_retry(
    platform: &PlatformSocket,
    local: Endpoint,
    listen: bool,
    keep_going: impl Fn() -> bool,
) -> Result<Endpoint> {
    let timeout = config::connection_timeout();
    let retry = config::retry_frequency();
    let deadline = Instant::now() + timeout;
    loop {
        if !keep_going() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "cancelled",
            )));
        }
        match bind_once(platform, local, listen) {
            Ok(endpoint) => return Ok(endpoint),
            Err(e) => {
                if Instant::now() >= deadline {
                    return if e.is_recoverable() {
                        Err(Error::Timeout { op: "bind", timeout })
                    } else {
                        Err(e)
                    };
                }
                platform.disconnect().ok();
            }
        }
        thread::sleep(retry);
    }
}

/// Accept-loop worker. Accepted platform sockets are queued for the owner to
/// wrap and surface during `update`.
pub(crate) struct Accepter {
    pub worker: Worker<()>,
    tx: flume::Sender<(PlatformSocket, Endpoint)>,
    rx: flume::Receiver<(PlatformSocket, Endpoint)>,
}

impl Accepter {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            worker: Worker::new("capstan accepter worker", ()),
            tx,
            rx,
        }
    }

    pub fn start(&self, platform: Arc<PlatformSocket>) -> io::Result<()> {
        let tx = self.tx.clone();
        self.worker.spawn(move |shared| run_accept(&platform, &tx, &shared))
    }

    /// Harvest accepted connections, in arrival order.
    pub fn drain(&self) -> Vec<(PlatformSocket, Endpoint)> {
        self.rx.try_iter().collect()
    }
}

fn run_accept(
    platform: &PlatformSocket,
    tx: &flume::Sender<(PlatformSocket, Endpoint)>,
    shared: &Shared<()>,
) {
    let poll = config::retry_frequency();
    loop {
        {
            let control = shared.lock();
            if !control.running || !control.executing {
                break;
            }
        }
        match platform.accept() {
            Ok(Some(pair)) => {
                let _ = tx.send(pair);
            }
            Ok(None) => thread::sleep(poll),
            Err(e) if e.is_recoverable() => thread::sleep(poll),
            Err(e) => {
                let mut control = shared.lock();
                control.result = if control.running {
                    warn!(tag = %config::get().log_tag, error = %e, "accept failed");
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
