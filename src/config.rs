//! Defaults for the concurrency primitives, read once from the environment.
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ASYNC_QUEUE_MAX_WORK` | Capacity of queues, parallel queues and flush queues | `1024` |
//! | `ASYNC_INTERVAL_MS` | Tick of autoflush buffers and auto actions | `500` |
//! | `ASYNC_PARALLELISM` | Default worker count of batches and autoflush buffers | available CPUs |
//! | `ASYNC_SHUTDOWN_GRACE_PERIOD_MS` | Time `stop` waits for in-flight flushes | `10000` |
//!
//! Values which cannot be parsed are reported and replaced by the default.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

const ENV_QUEUE_MAX_WORK: &str = "ASYNC_QUEUE_MAX_WORK";
const ENV_INTERVAL_MS: &str = "ASYNC_INTERVAL_MS";
const ENV_PARALLELISM: &str = "ASYNC_PARALLELISM";
const ENV_SHUTDOWN_GRACE_PERIOD_MS: &str = "ASYNC_SHUTDOWN_GRACE_PERIOD_MS";

const FALLBACK_QUEUE_MAX_WORK: usize = 1 << 10;
const FALLBACK_INTERVAL_MS: u64 = 500;
const FALLBACK_SHUTDOWN_GRACE_PERIOD_MS: u64 = 10_000;

/// Default capacity of a [`Queue`](crate::concurrency::Queue) work channel.
pub static QUEUE_MAX_WORK: LazyLock<usize> =
    LazyLock::new(|| env_or(ENV_QUEUE_MAX_WORK, FALLBACK_QUEUE_MAX_WORK).max(1));

/// Default tick of autoflush buffers and auto actions.
pub static INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_or(ENV_INTERVAL_MS, FALLBACK_INTERVAL_MS)));

/// Default parallelism of a [`Batch`](crate::concurrency::Batch) and of the
/// flush handlers of an [`AutoflushBuffer`](crate::concurrency::AutoflushBuffer).
pub static PARALLELISM: LazyLock<usize> = LazyLock::new(|| {
    let cpus = std::thread::available_parallelism()
        .map(|cpus| cpus.get())
        .unwrap_or(1);
    env_or(ENV_PARALLELISM, cpus).max(1)
});

/// Default time an autoflush buffer waits for in-flight flushes when stopping.
pub static SHUTDOWN_GRACE_PERIOD: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_or(
        ENV_SHUTDOWN_GRACE_PERIOD_MS,
        FALLBACK_SHUTDOWN_GRACE_PERIOD_MS,
    ))
});

fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => parse_or(name, &value, default),
        Err(_) => default,
    }
}

fn parse_or<T>(name: &str, value: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value.trim().parse() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!("Ignoring invalid value '{}' for {}: {}", value, name, err);
            default
        }
    }
}

/// Settings of an [`AutoflushBuffer`](crate::concurrency::AutoflushBuffer),
/// e.g. as part of a service's configuration file.
///
/// Missing fields fall back to the environment defaults above.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoflushSettings {
    pub max_len: usize,
    pub interval_ms: u64,
    pub flush_on_stop: bool,
    pub shutdown_grace_period_ms: u64,
    pub parallelism: usize,
    pub max_flushes: usize,
}

impl Default for AutoflushSettings {
    fn default() -> Self {
        Self {
            max_len: *QUEUE_MAX_WORK,
            interval_ms: u64::try_from(INTERVAL.as_millis()).unwrap_or(u64::MAX),
            flush_on_stop: true,
            shutdown_grace_period_ms: u64::try_from(SHUTDOWN_GRACE_PERIOD.as_millis())
                .unwrap_or(u64::MAX),
            parallelism: *PARALLELISM,
            max_flushes: *QUEUE_MAX_WORK,
        }
    }
}

impl AutoflushSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_values() {
        assert_eq!(parse_or::<usize>("X", " 64 ", 1), 64);
        assert_eq!(parse_or::<u64>("X", "250", 1), 250);
    }

    #[test]
    fn falls_back_on_garbage() {
        assert_eq!(parse_or::<usize>("X", "lots", 7), 7);
        assert_eq!(parse_or::<u64>("X", "-3", 9), 9);
    }

    #[test]
    fn missing_variables_use_the_default() {
        assert_eq!(env_or("SANSHO_SURELY_UNSET_VARIABLE", 12usize), 12);
    }

    #[test]
    fn settings_fill_missing_fields() {
        let settings: AutoflushSettings =
            serde_json::from_str(r#"{ "maxLen": 16, "flushOnStop": false }"#).unwrap();

        assert_eq!(settings.max_len, 16);
        assert!(!settings.flush_on_stop);
        assert_eq!(settings.interval(), *INTERVAL);
        assert_eq!(settings.shutdown_grace_period(), *SHUTDOWN_GRACE_PERIOD);
        assert_eq!(settings.parallelism, *PARALLELISM);
    }
}
