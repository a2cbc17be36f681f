//! Shared harness for the integration tests: one-time library init, a
//! process-wide test lock (the pump is global, so tests serialize), and a
//! pump-until-condition helper.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, Once};
use std::time::{Duration, Instant};

use capstan::Config;

static LOCK: Mutex<()> = Mutex::new(());

/// Serialize tests within this binary; the registry and pump are global.
pub fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Initialize the library once per process with test-friendly tunables.
pub fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        capstan::dev_tracing::init_tracing();
        capstan::init(
            Config::default()
                .with_retry_timeout(Duration::from_millis(2))
                .with_retry_frequency(Duration::from_millis(5))
                .with_connection_timeout(Duration::from_secs(2))
                .with_log_tag("capstan-test"),
        );
    });
}

/// Pump until `done` returns true or `deadline` elapses.
pub fn pump_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        capstan::update(Duration::from_millis(10));
        if done() {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Default deadline generous enough for CI schedulers.
pub const DEADLINE: Duration = Duration::from_secs(5);
