use crate::consts::*;
use crate::tracker::{HttpSettings, ScrapeSettings, Tracker, UdpSettings};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Tunables for querying trackers and caching the results
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Hard limit on a single tracker probe, including protocol retries
    pub probe_timeout: Duration,
    /// Hard limit on an entire aggregation run
    pub overall_timeout: Duration,
    /// Maximum number of UDP packets sent to one tracker per probe
    pub udp_attempts: u32,
    /// Time to wait for a reply to the first UDP packet; doubles with each
    /// resend
    pub udp_backoff_base: Duration,
    pub udp_backoff_cap: Duration,
    /// Timeout for a single HTTP request
    pub http_timeout: Duration,
    /// Number of times a timed-out HTTP request is retried
    pub http_retries: u32,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub max_concurrent_probes: usize,
    /// Initial period for which a failing tracker is skipped when
    /// `remember_trackers` is set; doubles with each consecutive failure
    pub endpoint_backoff_base: Duration,
    pub endpoint_backoff_cap: Duration,
    /// Keep per-tracker state (UDP connection IDs, failure backoff) between
    /// queries
    pub remember_trackers: bool,
    /// Trackers queried in addition to those supplied with each query
    pub extra_trackers: Vec<Tracker>,
    /// Route HTTP tracker requests through this proxy (`http`, `https`,
    /// `socks5`, or `socks5h`).  UDP trackers are always contacted directly.
    pub proxy: Option<Url>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("probe_timeout", self.probe_timeout),
            ("overall_timeout", self.overall_timeout),
            ("udp_backoff_base", self.udp_backoff_base),
            ("http_timeout", self.http_timeout),
            ("cache_ttl", self.cache_ttl),
            ("endpoint_backoff_base", self.endpoint_backoff_base),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.udp_attempts == 0 {
            return Err(ConfigError::Zero("udp_attempts"));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Zero("cache_capacity"));
        }
        if self.max_concurrent_probes == 0 {
            return Err(ConfigError::Zero("max_concurrent_probes"));
        }
        if self.udp_backoff_cap < self.udp_backoff_base {
            return Err(ConfigError::BackoffCap("udp_backoff_cap"));
        }
        if self.endpoint_backoff_cap < self.endpoint_backoff_base {
            return Err(ConfigError::BackoffCap("endpoint_backoff_cap"));
        }
        if let Some(proxy) = &self.proxy {
            if !PROXY_SCHEMES.contains(&proxy.scheme()) {
                return Err(ConfigError::ProxyScheme);
            }
            if proxy.host().is_none() {
                return Err(ConfigError::ProxyHost);
            }
        }
        Ok(())
    }

    pub(crate) fn scrape_settings(&self) -> ScrapeSettings {
        ScrapeSettings {
            udp: UdpSettings {
                attempts: self.udp_attempts,
                backoff_base: self.udp_backoff_base,
                backoff_cap: self.udp_backoff_cap,
            },
            http: HttpSettings {
                timeout: self.http_timeout,
                retries: self.http_retries,
                proxy: self.proxy.clone(),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            overall_timeout: DEFAULT_OVERALL_TIMEOUT,
            udp_attempts: DEFAULT_UDP_ATTEMPTS,
            udp_backoff_base: DEFAULT_UDP_BACKOFF_BASE,
            udp_backoff_cap: DEFAULT_UDP_BACKOFF_CAP,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            http_retries: DEFAULT_HTTP_RETRIES,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_concurrent_probes: DEFAULT_MAX_CONCURRENT_PROBES,
            endpoint_backoff_base: DEFAULT_ENDPOINT_BACKOFF_BASE,
            endpoint_backoff_cap: DEFAULT_ENDPOINT_BACKOFF_CAP,
            remember_trackers: false,
            extra_trackers: Vec::new(),
            proxy: None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("{0} must not be less than the corresponding base")]
    BackoffCap(&'static str),
    #[error("proxy scheme must be one of http, https, socks5, or socks5h")]
    ProxyScheme,
    #[error("proxy URL has no host")]
    ProxyHost,
}
