//! Runtime configuration.
//!
//! Settings resolve in this order (highest priority first):
//!
//! 1. **Programmatic**: values set with the `with_*` methods
//! 2. **Environment variables**: values from `FIBRA_*` variables, via [`RuntimeConfig::from_env`]
//! 3. **Defaults**: [`RuntimeConfig::default()`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `FIBRA_WORKER_THREADS` | `usize` | `worker_threads` |
//! | `FIBRA_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `FIBRA_EVENT_CAPACITY` | `usize` | `event_capacity` |
//! | `FIBRA_METRICS_PORT` | `u16` | `metrics_port` |

use std::str::FromStr;
use std::thread;

use crate::error::{Error, Result};
use crate::event_loop::DEFAULT_EVENT_CAPACITY;

pub const ENV_WORKER_THREADS: &str = "FIBRA_WORKER_THREADS";
pub const ENV_THREAD_NAME_PREFIX: &str = "FIBRA_THREAD_NAME_PREFIX";
pub const ENV_EVENT_CAPACITY: &str = "FIBRA_EVENT_CAPACITY";
pub const ENV_METRICS_PORT: &str = "FIBRA_METRICS_PORT";

/// Upper bound for the default worker count.
const MAX_DEFAULT_WORKERS: usize = 10;

/// Settings for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of event loops, each driven by its own thread.
    pub worker_threads: usize,
    /// Worker threads are named `{prefix}-{id}`.
    pub thread_name_prefix: String,
    /// Events collected per selector poll.
    pub event_capacity: usize,
    /// When set, a Prometheus exporter listens on `127.0.0.1:{port}`.
    pub metrics_port: Option<u16>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let parallelism = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            worker_threads: parallelism.min(MAX_DEFAULT_WORKERS),
            thread_name_prefix: "fibra-worker".to_owned(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            metrics_port: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with `FIBRA_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies every `FIBRA_*` variable that is set. Unparseable values are errors.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(val) = lookup(ENV_WORKER_THREADS) {
            self.worker_threads = parse(ENV_WORKER_THREADS, &val)?;
        }
        if let Some(val) = lookup(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        if let Some(val) = lookup(ENV_EVENT_CAPACITY) {
            self.event_capacity = parse(ENV_EVENT_CAPACITY, &val)?;
        }
        if let Some(val) = lookup(ENV_METRICS_PORT) {
            self.metrics_port = Some(parse(ENV_METRICS_PORT, &val)?);
        }
        self.validate()
    }

    /// Rejects settings the runtime cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(Error::Config {
                key: ENV_WORKER_THREADS,
                value: "0".to_owned(),
            });
        }
        if self.event_capacity == 0 {
            return Err(Error::Config {
                key: ENV_EVENT_CAPACITY,
                value: "0".to_owned(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }

    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = Some(port);
        self
    }
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| Error::Config {
        key,
        value: raw.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn apply(vars: &[(&'static str, &str)]) -> Result<RuntimeConfig> {
        let vars: HashMap<&str, String> = vars.iter().map(|(k, v)| (*k, v.to_string())).collect();
        let mut config = RuntimeConfig::default();
        config.apply_overrides(|key| vars.get(key).cloned())?;
        Ok(config)
    }

    #[test]
    fn defaults_are_bounded() {
        let config = RuntimeConfig::default();
        assert!(config.worker_threads >= 1);
        assert!(config.worker_threads <= MAX_DEFAULT_WORKERS);
        assert_eq!(config.event_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.metrics_port, None);
    }

    #[test]
    fn env_overrides_apply() {
        let config = apply(&[
            (ENV_WORKER_THREADS, "3"),
            (ENV_THREAD_NAME_PREFIX, "io"),
            (ENV_EVENT_CAPACITY, " 64 "),
            (ENV_METRICS_PORT, "9100"),
        ])
        .unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.thread_name_prefix, "io");
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn bad_values_are_reported() {
        let err = apply(&[(ENV_METRICS_PORT, "ninety")]).unwrap_err();
        assert!(matches!(err, Error::Config { key: ENV_METRICS_PORT, .. }));
        let err = apply(&[(ENV_WORKER_THREADS, "0")]).unwrap_err();
        assert!(matches!(err, Error::Config { key: ENV_WORKER_THREADS, .. }));
    }

    #[test]
    fn builder_setters_override() {
        let config = RuntimeConfig::default()
            .with_worker_threads(2)
            .with_thread_name_prefix("loop")
            .with_event_capacity(16)
            .with_metrics_port(9000);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.thread_name_prefix, "loop");
        assert_eq!(config.event_capacity, 16);
        assert_eq!(config.metrics_port, Some(9000));
    }
}
