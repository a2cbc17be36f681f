//! Process-wide configuration.
//!
//! Tunables are set once at library init and read thread-safely afterwards.
//! Workers read them at operation start, so a change applies to the next
//! operation, not one already in flight.

use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// Process-wide tunables.
///
/// # Examples
///
/// ```
/// use capstan_core::config::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
///     .with_retry_frequency(Duration::from_millis(20))
///     .with_connection_timeout(Duration::from_secs(10));
/// assert_eq!(config.retry_frequency, Duration::from_millis(20));
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Sleep between partial send attempts.
    pub retry_timeout: Duration,

    /// General retry cadence: receiver poll interval, accept poll interval,
    /// sleep between one-shot operation attempts. Cooperative cancellation
    /// latency is bounded by this value plus one platform call.
    pub retry_frequency: Duration,

    /// Total budget for a connect attempt loop.
    pub connection_timeout: Duration,

    /// Tag attached to every log record emitted by the library.
    pub log_tag: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_millis(10),
            retry_frequency: Duration::from_millis(10),
            connection_timeout: Duration::from_secs(5),
            log_tag: "capstan".to_string(),
        }
    }
}

impl Config {
    /// Set the inter-attempt sleep for senders.
    #[must_use]
    pub fn with_retry_timeout(mut self, value: Duration) -> Self {
        self.retry_timeout = value;
        self
    }

    /// Set the general retry cadence.
    #[must_use]
    pub fn with_retry_frequency(mut self, value: Duration) -> Self {
        self.retry_frequency = value;
        self
    }

    /// Set the connect attempt budget.
    #[must_use]
    pub fn with_connection_timeout(mut self, value: Duration) -> Self {
        self.connection_timeout = value;
        self
    }

    /// Set the log tag.
    #[must_use]
    pub fn with_log_tag(mut self, value: impl Into<String>) -> Self {
        self.log_tag = value.into();
        self
    }
}

static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

/// Install `config` as the process-wide configuration.
pub fn set(config: Config) {
    *CONFIG.write() = config;
}

/// Snapshot the process-wide configuration.
pub fn get() -> Config {
    CONFIG.read().clone()
}

/// Sleep between partial send attempts.
pub fn retry_timeout() -> Duration {
    CONFIG.read().retry_timeout
}

/// General retry cadence.
pub fn retry_frequency() -> Duration {
    CONFIG.read().retry_frequency
}

/// Connect attempt budget.
pub fn connection_timeout() -> Duration {
    CONFIG.read().connection_timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::default()
            .with_retry_timeout(Duration::from_millis(1))
            .with_retry_frequency(Duration::from_millis(2))
            .with_connection_timeout(Duration::from_secs(1))
            .with_log_tag("test");
        assert_eq!(config.retry_timeout, Duration::from_millis(1));
        assert_eq!(config.retry_frequency, Duration::from_millis(2));
        assert_eq!(config.connection_timeout, Duration::from_secs(1));
        assert_eq!(config.log_tag, "test");
    }

    #[test]
    fn default_values_are_sane() {
        let config = Config::default();
        assert!(config.retry_frequency > Duration::ZERO);
        assert!(config.connection_timeout > config.retry_frequency);
    }
}
