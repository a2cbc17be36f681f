//! Worker thread harness.
//!
//! Every blocking operation runs on a dedicated worker thread that
//! communicates with its owning endpoint exclusively through a small
//! mutex-guarded control record: a result slot plus the two cooperative
//! flags. `running` is the owner's termination request, `executing` the
//! owner's "finish the current unit" request; both are observed at the next
//! platform-call boundary. Workers never invoke delegates.
//!
//! Lock order everywhere in this crate: endpoint state mutex first, then the
//! worker mutex. Delegates are invoked only after both are released.

pub(crate) mod broadcaster;
pub(crate) mod receiver;
pub(crate) mod sender;
pub(crate) mod timed;

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use capstan_core::state::State;
use parking_lot::{Mutex, MutexGuard};

/// Shared control record between an endpoint and one worker.
pub(crate) struct Control<X> {
    /// Result slot: `Idle -> Running -> {Finished, Failed} -> Idle`. The
    /// owner arms it to `Running` before start and resets it to `Idle` after
    /// handling a terminal value.
    pub result: State,
    /// Cleared by the owner to request termination.
    pub running: bool,
    /// Cleared by the owner to request an orderly stop after the current
    /// unit of work.
    pub executing: bool,
    /// Worker-specific extension (e.g. sent-byte progress).
    pub ext: X,
}

pub(crate) type Shared<X> = Arc<Mutex<Control<X>>>;

/// One worker slot: a control record plus the current thread handle.
///
/// A fresh OS thread is spawned per operation; the slot joins the previous
/// thread before reuse, so at most one thread per worker is ever alive.
pub(crate) struct Worker<X> {
    shared: Shared<X>,
    handle: Mutex<Option<JoinHandle<()>>>,
    name: &'static str,
}

impl<X: Send + 'static> Worker<X> {
    pub fn new(name: &'static str, ext: X) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Control {
                result: State::Idle,
                running: false,
                executing: false,
                ext,
            })),
            handle: Mutex::new(None),
            name,
        }
    }

    /// Lock the control record. Callers holding the endpoint state mutex may
    /// take this; never the reverse.
    pub fn lock(&self) -> MutexGuard<'_, Control<X>> {
        self.shared.lock()
    }

    /// Current result slot value.
    pub fn result(&self) -> State {
        self.shared.lock().result
    }

    /// Spawn the worker thread for one operation. The caller has already
    /// armed the control record under its own locking.
    pub fn spawn(&self, f: impl FnOnce(Shared<X>) + Send + 'static) -> io::Result<()> {
        let mut slot = self.handle.lock();
        if let Some(previous) = slot.take() {
            // the previous operation has published its terminal result, so
            // this returns promptly
            let _ = previous.join();
        }
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || f(shared))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Request termination.
    pub fn stop(&self) {
        self.shared.lock().running = false;
    }

    /// Request an orderly stop after the current unit of work.
    pub fn finish(&self) {
        self.shared.lock().executing = false;
    }

    /// Join the current thread, if any. Idempotent.
    pub fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn stop_and_join(&self) {
        self.stop();
        self.join();
    }

    /// Reset the control record after a failed thread launch.
    pub fn abort_launch(&self) {
        let mut control = self.shared.lock();
        control.result = State::Idle;
        control.running = false;
        control.executing = false;
    }
}
