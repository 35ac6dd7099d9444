use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::error::ConfigError;

const ENV_PREFIX: &str = "RELAY_";

/// Runtime configuration for every component of the relay.
///
/// All values have defaults; [`RelayConfig::from_env`] overrides them from
/// `RELAY_*` environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Broker URL handed to the connector (`memory://`, `redis://...`).
    pub broker_url: String,
    /// Heartbeat interval requested from the broker.
    pub heartbeat: Duration,
    /// Messages in flight per consumer. `1` serializes a queue.
    pub prefetch: usize,
    /// First delay between reconnect attempts.
    pub reconnect_base: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max: Duration,

    /// Shared idempotency cache. `None` keeps records in process memory.
    pub cache_url: Option<String>,
    /// Lifetime of a committed idempotency record.
    pub idempotency_ttl: Duration,
    /// Lifetime of an in-progress claim. A consumer that dies mid-handler
    /// blocks redeliveries of that message for at most this long.
    pub claim_lease: Duration,

    /// Default wait for a request/reply call.
    pub request_timeout: Duration,

    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_jitter_ms: u64,
    /// Per-attempt HTTP timeout.
    pub http_timeout: Duration,
    pub max_redirects: usize,
    pub worker_count: usize,
    /// Events buffered between `publish_event` and the fan-out task.
    pub fanout_capacity: usize,
    /// How often stale `pending`/`retrying` deliveries are swept up.
    pub reclaim_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            broker_url: "memory://".to_string(),
            heartbeat: Duration::from_secs(30),
            prefetch: 1,
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(10),
            cache_url: None,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            claim_lease: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5),
            max_attempts: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 60_000,
            retry_jitter_ms: 0,
            http_timeout: Duration::from_secs(10),
            max_redirects: 3,
            worker_count,
            fanout_capacity: 1_024,
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

        Ok(Self {
            broker_url: get("BROKER_URL").unwrap_or(defaults.broker_url),
            heartbeat: secs(&get, "BROKER_HEARTBEAT_SECS", defaults.heartbeat)?,
            prefetch: parse(&get, "PREFETCH", defaults.prefetch)?.max(1),
            reconnect_base: millis(&get, "RECONNECT_BASE_MS", defaults.reconnect_base)?,
            reconnect_max: millis(&get, "RECONNECT_MAX_MS", defaults.reconnect_max)?,
            cache_url: get("CACHE_URL").or(defaults.cache_url),
            idempotency_ttl: secs(&get, "IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl)?,
            claim_lease: secs(&get, "IDEMPOTENCY_CLAIM_LEASE_SECS", defaults.claim_lease)?,
            request_timeout: millis(&get, "REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            max_attempts: parse(&get, "WEBHOOK_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            retry_base_ms: parse(&get, "WEBHOOK_BACKOFF_BASE_MS", defaults.retry_base_ms)?,
            retry_max_ms: parse(&get, "WEBHOOK_BACKOFF_MAX_MS", defaults.retry_max_ms)?,
            retry_jitter_ms: parse(&get, "WEBHOOK_BACKOFF_JITTER_MS", defaults.retry_jitter_ms)?,
            http_timeout: secs(&get, "WEBHOOK_TIMEOUT_SECS", defaults.http_timeout)?,
            max_redirects: parse(&get, "WEBHOOK_MAX_REDIRECTS", defaults.max_redirects)?,
            worker_count: parse(&get, "WEBHOOK_WORKERS", defaults.worker_count)?.max(1),
            fanout_capacity: parse(&get, "FANOUT_CAPACITY", defaults.fanout_capacity)?.max(1),
            reclaim_interval: secs(&get, "RECLAIM_INTERVAL_SECS", defaults.reclaim_interval)?,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_ms: self.retry_base_ms,
            max_ms: self.retry_max_ms,
            jitter_ms: self.retry_jitter_ms,
        }
    }
}

fn parse<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw,
        }),
        None => Ok(default),
    }
}

fn secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, key, default.as_secs()).map(Duration::from_secs)
}

fn millis<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse(get, key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = RelayConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.broker_url, "memory://");
        assert_eq!(config.idempotency_ttl, Duration::from_secs(86_400));
        assert_eq!(config.prefetch, 1);
        assert_eq!(config.claim_lease, Duration::from_secs(30));
        assert_eq!(config.http_timeout, Duration::from_secs(10));
    }

    #[test]
    fn overrides_are_read_with_prefix() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("RELAY_BROKER_URL", "redis://cache:6379"),
            ("RELAY_PREFETCH", "4"),
            ("RELAY_IDEMPOTENCY_TTL_SECS", "60"),
            ("RELAY_WEBHOOK_MAX_ATTEMPTS", "7"),
            ("RELAY_WEBHOOK_BACKOFF_BASE_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.broker_url, "redis://cache:6379");
        assert_eq!(config.prefetch, 4);
        assert_eq!(config.idempotency_ttl, Duration::from_secs(60));
        assert_eq!(config.retry_policy().max_attempts, 7);
        assert_eq!(config.retry_policy().base_ms, 250);
    }

    #[test]
    fn unparseable_value_names_the_variable() {
        let err = RelayConfig::from_lookup(lookup(&[("RELAY_PREFETCH", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "RELAY_PREFETCH".into(),
                value: "lots".into()
            }
        );
    }

    #[test]
    fn zero_prefetch_is_clamped() {
        let config = RelayConfig::from_lookup(lookup(&[("RELAY_PREFETCH", "0")])).unwrap();
        assert_eq!(config.prefetch, 1);
    }
}
