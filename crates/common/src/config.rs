use std::net::SocketAddr;
use std::time::Duration;

use reqwest::Url;

use crate::types::EnvelopeMode;

/// Relay configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Broker endpoint (`redis://` or `rediss://`)
    pub redis_url: String,

    /// Stream key the relay consumes from
    pub source_queue: String,

    /// Downstream base URL every message is posted to
    pub post_url: Url,

    /// How message payloads are turned into downstream requests
    pub envelope_mode: EnvelopeMode,

    /// Consumer group shared by all relay instances on this queue
    pub consumer_group: String,

    /// Consumer name of this instance within the group
    pub consumer_name: String,

    /// How long a delivered message stays locked before the broker redelivers
    /// it (default: 120s). Must exceed `http_timeout`.
    pub lock_timeout: Duration,

    /// How long a single receive blocks waiting for a message
    pub receive_wait: Duration,

    /// Timeout for one downstream HTTP request (default: 100s)
    pub http_timeout: Duration,

    /// Pause after a broker fault before the next receive
    pub fault_pause: Duration,

    /// Bind address for the health endpoint; disabled when unset
    pub health_addr: Option<SocketAddr>,
}

impl RelayConfig {
    /// Load configuration from environment variables.
    ///
    /// Connection identity (`RELAY_REDIS_URL`, `RELAY_SOURCE_QUEUE`,
    /// `RELAY_POST_URL`) is required; the relay refuses to start without it.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let redis_url = required("RELAY_REDIS_URL")?;
        if !(redis_url.starts_with("redis://") || redis_url.starts_with("rediss://")) {
            anyhow::bail!("RELAY_REDIS_URL must use the redis:// or rediss:// scheme");
        }

        let post_url = parse_post_url(&required("RELAY_POST_URL")?)?;

        let envelope_mode = std::env::var("RELAY_ENVELOPE_MODE")
            .unwrap_or_else(|_| "raw".to_string())
            .parse()?;

        let health_addr = match std::env::var("RELAY_HEALTH_ADDR") {
            Ok(addr) => Some(
                addr.parse()
                    .map_err(|_| anyhow::anyhow!("RELAY_HEALTH_ADDR must be a socket address"))?,
            ),
            Err(_) => None,
        };

        let lock_timeout = millis("RELAY_LOCK_TIMEOUT_MS", 120_000)?;
        let http_timeout = millis("RELAY_HTTP_TIMEOUT_MS", 100_000)?;
        check_lock_outlives_request(lock_timeout, http_timeout)?;

        Ok(Self {
            redis_url,
            source_queue: required("RELAY_SOURCE_QUEUE")?,
            post_url,
            envelope_mode,
            consumer_group: std::env::var("RELAY_CONSUMER_GROUP")
                .unwrap_or_else(|_| "relay".to_string()),
            consumer_name: std::env::var("RELAY_CONSUMER_NAME")
                .unwrap_or_else(|_| format!("relay-{}", uuid::Uuid::new_v4())),
            lock_timeout,
            receive_wait: millis("RELAY_RECEIVE_WAIT_MS", 5_000)?,
            http_timeout,
            fault_pause: millis("RELAY_FAULT_PAUSE_MS", 1_000)?,
            health_addr,
        })
    }
}

/// Validate the downstream base URL.
///
/// Only absolute http(s) URLs are accepted, since routing-key mode appends a
/// path segment to them.
pub fn parse_post_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("RELAY_POST_URL is invalid: {e}"))?;

    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        anyhow::bail!("RELAY_POST_URL must be an http or https URL");
    }

    Ok(url)
}

/// A lock that can expire during a downstream call lets another instance
/// reclaim the message and post it concurrently.
pub fn check_lock_outlives_request(
    lock_timeout: Duration,
    http_timeout: Duration,
) -> anyhow::Result<()> {
    if lock_timeout <= http_timeout {
        anyhow::bail!(
            "RELAY_LOCK_TIMEOUT_MS ({}) must be greater than RELAY_HTTP_TIMEOUT_MS ({})",
            lock_timeout.as_millis(),
            http_timeout.as_millis()
        );
    }
    Ok(())
}

fn required(name: &str) -> anyhow::Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(anyhow::anyhow!("{name} environment variable is required")),
    }
}

fn millis(name: &str, default: u64) -> anyhow::Result<Duration> {
    let ms: u64 = std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| anyhow::anyhow!("{name} must be a valid u64"))?;

    if ms == 0 {
        anyhow::bail!("{name} must be greater than zero");
    }

    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_post_url_accepts_http() {
        let url = parse_post_url("http://svc").unwrap();
        assert_eq!(url.as_str(), "http://svc/");
    }

    #[test]
    fn test_parse_post_url_rejects_other_schemes() {
        assert!(parse_post_url("ftp://svc/upload").is_err());
        assert!(parse_post_url("mailto:ops@example.com").is_err());
        assert!(parse_post_url("not a url").is_err());
    }

    #[test]
    fn test_default_timeouts_keep_lock_longer_than_request() {
        assert!(
            check_lock_outlives_request(Duration::from_secs(120), Duration::from_secs(100))
                .is_ok()
        );
    }

    #[test]
    fn test_lock_timeout_not_above_http_timeout_is_rejected() {
        for (lock, http) in [(60, 100), (100, 100)] {
            let err = check_lock_outlives_request(
                Duration::from_secs(lock),
                Duration::from_secs(http),
            )
            .unwrap_err();
            assert!(err.to_string().contains("RELAY_LOCK_TIMEOUT_MS"));
        }
    }
}
