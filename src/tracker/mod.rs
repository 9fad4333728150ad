pub(crate) mod http;
pub(crate) mod udp;
pub use self::http::{HttpTracker, HttpTrackerError};
pub use self::udp::{UdpTracker, UdpTrackerError};
use crate::book::TrackerBook;
use crate::infohash::InfoHash;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// A tracker endpoint, identified by its normalized URL
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    /// The normalized URL of the tracker, used as its identity
    pub fn url_string(&self) -> String {
        match self {
            Tracker::Http(tr) => tr.url_string(),
            Tracker::Udp(tr) => tr.url_string(),
        }
    }

    /// Scrape the tracker for the given info hashes.  The returned map is
    /// keyed by each hash's [`InfoHash::swarm_key()`]; hashes the tracker
    /// doesn't know about are omitted.
    pub(crate) async fn scrape(
        &self,
        hashes: &[InfoHash],
        settings: &ScrapeSettings,
        book: &TrackerBook,
    ) -> Result<ScrapeMap, ScrapeError> {
        let keys = hashes.iter().map(InfoHash::swarm_key).collect::<Vec<_>>();
        match self {
            Tracker::Http(tr) => tr.scrape(&keys, &settings.http).await,
            Tracker::Udp(tr) => tr.scrape(&keys, &settings.udp, book).await,
        }
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tracker::Http(http) => write!(f, "{http}"),
            Tracker::Udp(udp) => write!(f, "{udp}"),
        }
    }
}

impl FromStr for Tracker {
    type Err = TrackerUrlError;

    fn from_str(s: &str) -> Result<Tracker, TrackerUrlError> {
        Tracker::try_from(Url::parse(s.trim())?)
    }
}

impl TryFrom<Url> for Tracker {
    type Error = TrackerUrlError;

    fn try_from(url: Url) -> Result<Tracker, TrackerUrlError> {
        match url.scheme() {
            "http" | "https" => Ok(Tracker::Http(HttpTracker::try_from(url)?)),
            "udp" => Ok(Tracker::Udp(UdpTracker::try_from(url)?)),
            sch => Err(TrackerUrlError::UnsupportedScheme(sch.into())),
        }
    }
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TrackerUrlError {
    #[error("invalid tracker URL")]
    Url(#[from] url::ParseError),
    #[error("unsupported tracker URL scheme: {0:?}")]
    UnsupportedScheme(String),
    #[error("no host in tracker URL")]
    NoHost,
    #[error("no port in UDP tracker URL")]
    NoUdpPort,
}

/// Protocol-level knobs for a single scrape of a single tracker
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ScrapeSettings {
    pub(crate) udp: UdpSettings,
    pub(crate) http: HttpSettings,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct UdpSettings {
    /// Total number of packets to send (connect and scrape combined) before
    /// giving up
    pub(crate) attempts: u32,
    /// How long to wait for a reply to the first packet; each resend waits
    /// twice as long as the last, up to `backoff_cap`
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_cap: Duration,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct HttpSettings {
    pub(crate) timeout: Duration,
    /// Number of extra attempts made after a request times out
    pub(crate) retries: u32,
    pub(crate) proxy: Option<Url>,
}

pub type ScrapeMap = HashMap<InfoHash, Scrape>;

/// Swarm statistics reported by a tracker for one torrent
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Scrape {
    /// Number of peers with the complete torrent ("complete")
    pub seeders: u64,
    /// Number of peers still downloading ("incomplete")
    pub leechers: u64,
    /// Number of times the torrent has been fully downloaded, if reported
    pub completed: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("interactions with tracker did not complete in time")]
    Timeout,
    #[error("tracker replied with error message {0:?}")]
    Failure(String),
    #[error(transparent)]
    Http(#[from] HttpTrackerError),
    #[error(transparent)]
    Udp(#[from] UdpTrackerError),
}
