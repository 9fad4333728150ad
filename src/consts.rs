use std::time::Duration;

/// Size of buffer for receiving incoming UDP packets.  Any packets longer than
/// this are truncated.
pub(crate) const UDP_PACKET_LEN: usize = 65535;

/// Maximum number of info hashes that fit in a single UDP scrape request
/// (BEP 15)
pub(crate) const UDP_MAX_SCRAPE_HASHES: usize = 74;

/// How long a UDP tracker connection ID remains valid after it is received
pub(crate) const UDP_CONNECTION_LIFETIME: Duration = Duration::from_secs(60);

/// Number of independently locked shards in the result cache; an entry's
/// shard is picked by the first byte of its info hash
pub(crate) const CACHE_SHARDS: usize = 256;

/// URL schemes accepted for `Config::proxy`
pub(crate) const PROXY_SCHEMES: [&str; 4] = ["http", "https", "socks5", "socks5h"];

/// User agent sent to HTTP trackers
pub(crate) static USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("CARGO_PKG_REPOSITORY"),
    ")",
);

pub(crate) const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(20);
pub(crate) const DEFAULT_OVERALL_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_UDP_ATTEMPTS: u32 = 8;
pub(crate) const DEFAULT_UDP_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub(crate) const DEFAULT_UDP_BACKOFF_CAP: Duration = Duration::from_secs(15);
pub(crate) const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_HTTP_RETRIES: u32 = 1;
pub(crate) const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub(crate) const DEFAULT_CACHE_CAPACITY: usize = 4096;
pub(crate) const DEFAULT_MAX_CONCURRENT_PROBES: usize = 16;
pub(crate) const DEFAULT_ENDPOINT_BACKOFF_BASE: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_ENDPOINT_BACKOFF_CAP: Duration = Duration::from_secs(600);
