//! Process-wide endpoint registry and frame pump.
//!
//! Endpoints register on construction and unregister on destruction; the
//! host application drives [`update`] periodically, which snapshots the
//! registry and pumps every live endpoint. All delegate callbacks happen
//! inside that call, on the calling thread.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use capstan_core::config::{self, Config};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

/// Pumped by the registry once per [`update`] tick.
pub(crate) trait Pump: Send + Sync {
    /// Harvest worker results and dispatch delegate callbacks.
    fn pump(self: Arc<Self>, dt: Duration);
    /// Stop and join all owned workers.
    fn halt(&self);
}

const OFFLINE: u8 = 0;
const LIVE: u8 = 1;
const TORN_DOWN: u8 = 2;

struct Registry {
    endpoints: DashMap<u64, Weak<dyn Pump>>,
    next_id: AtomicU64,
    phase: AtomicU8,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    endpoints: DashMap::new(),
    next_id: AtomicU64::new(0),
    phase: AtomicU8::new(OFFLINE),
});

/// Initialize the library: install `config` and open the registry.
///
/// Must be called before any endpoint is constructed.
pub fn init(config: Config) {
    config::set(config);
    REGISTRY.phase.store(LIVE, Ordering::Release);
    debug!(tag = %config::get().log_tag, "library initialized");
}

/// Pump every live endpoint once.
///
/// Delegate callbacks are dispatched from inside this call, on the calling
/// thread. Do not call it from within a delegate callback.
pub fn update(dt: Duration) {
    if REGISTRY.phase.load(Ordering::Acquire) != LIVE {
        return;
    }
    REGISTRY.endpoints.retain(|_, weak| weak.strong_count() > 0);
    // snapshot so no registry lock is held while pumping
    let snapshot: Vec<Weak<dyn Pump>> = REGISTRY
        .endpoints
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    for weak in snapshot {
        if let Some(endpoint) = weak.upgrade() {
            endpoint.pump(dt);
        }
    }
}

/// Tear the library down: stop and join every live endpoint's workers and
/// close the registry. Endpoints constructed afterwards panic.
pub fn shutdown() {
    if REGISTRY.phase.swap(TORN_DOWN, Ordering::AcqRel) != LIVE {
        return;
    }
    let snapshot: Vec<Weak<dyn Pump>> = REGISTRY
        .endpoints
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    REGISTRY.endpoints.clear();
    for weak in snapshot {
        if let Some(endpoint) = weak.upgrade() {
            endpoint.halt();
        }
    }
    debug!(tag = %config::get().log_tag, "library torn down");
}

/// Register a newly constructed endpoint.
///
/// # Panics
///
/// Panics when the library is not initialized or already torn down.
pub(crate) fn register(endpoint: Weak<dyn Pump>) -> u64 {
    match REGISTRY.phase.load(Ordering::Acquire) {
        LIVE => {
            let id = REGISTRY.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            REGISTRY.endpoints.insert(id, endpoint);
            id
        }
        OFFLINE => panic!("capstan::init() has not been called"),
        _ => panic!("endpoint constructed after capstan::shutdown()"),
    }
}

pub(crate) fn unregister(id: u64) {
    REGISTRY.endpoints.remove(&id);
}
