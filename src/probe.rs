use crate::book::TrackerBook;
use crate::config::Config;
use crate::infohash::InfoHash;
use crate::tracker::http::HttpTrackerError;
use crate::tracker::{Scrape, ScrapeError, ScrapeSettings, Tracker};
use std::error::Error;
use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, timeout};

/// Scrapes a single tracker endpoint for a single info hash, folding every
/// failure into the returned [`ScrapeResult`]
#[derive(Clone, Debug)]
pub struct TrackerProbe {
    tracker: Tracker,
    settings: ScrapeSettings,
    timeout: Duration,
}

impl TrackerProbe {
    pub fn new(tracker: Tracker, config: &Config) -> TrackerProbe {
        TrackerProbe {
            tracker,
            settings: config.scrape_settings(),
            timeout: config.probe_timeout,
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Scrape the tracker.  The whole interaction, including any
    /// protocol-level retries, is cut off after the probe timeout.
    #[tracing::instrument(name = "probe", skip_all, fields(tracker = %self.tracker.url_string(), info_hash = %info_hash))]
    pub async fn probe(&self, info_hash: InfoHash, book: &TrackerBook) -> ScrapeResult {
        let start = Instant::now();
        let r = timeout(
            self.timeout,
            self.tracker.scrape(&[info_hash], &self.settings, book),
        )
        .await;
        let outcome = match r {
            Ok(Ok(mut scrapemap)) => match scrapemap.remove(&info_hash.swarm_key()) {
                Some(scrape) => ProbeOutcome::Success(scrape),
                None => ProbeOutcome::Failure(ProbeFailure::NotTracked),
            },
            Ok(Err(e)) => ProbeOutcome::Failure(ProbeFailure::from(e)),
            Err(_) => ProbeOutcome::Failure(ProbeFailure::Timeout),
        };
        let latency = start.elapsed();
        match &outcome {
            ProbeOutcome::Success(s) => tracing::debug!(
                seeders = s.seeders,
                leechers = s.leechers,
                ?latency,
                "Tracker replied"
            ),
            ProbeOutcome::Failure(e) => tracing::debug!(error = %e, ?latency, "Probe failed"),
        }
        ScrapeResult {
            endpoint: self.tracker.url_string(),
            latency,
            outcome,
        }
    }
}

/// One endpoint's answer for one info hash
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScrapeResult {
    /// Normalized URL of the tracker
    pub endpoint: String,
    pub latency: Duration,
    pub outcome: ProbeOutcome,
}

impl ScrapeResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Success(_))
    }

    pub fn scrape(&self) -> Option<&Scrape> {
        match &self.outcome {
            ProbeOutcome::Success(s) => Some(s),
            ProbeOutcome::Failure(_) => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProbeOutcome {
    Success(Scrape),
    Failure(ProbeFailure),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum ProbeFailure {
    #[error("tracker did not reply in time")]
    Timeout,
    #[error("tracker replied with error message {0:?}")]
    Tracker(String),
    #[error("tracker does not know the torrent")]
    NotTracked,
    #[error("tracker does not support scraping")]
    ScrapeUnsupported,
    #[error("{0}")]
    Transport(String),
    #[error("tracker skipped after repeated failures")]
    BackingOff,
    #[error("overall deadline passed before tracker replied")]
    DeadlineExceeded,
}

impl ProbeFailure {
    /// Whether the failure says something about the health of the tracker
    /// itself (as opposed to the torrent or the caller's patience)
    pub(crate) fn counts_against_tracker(&self) -> bool {
        !matches!(
            self,
            ProbeFailure::NotTracked | ProbeFailure::BackingOff | ProbeFailure::DeadlineExceeded
        )
    }
}

impl From<ScrapeError> for ProbeFailure {
    fn from(e: ScrapeError) -> ProbeFailure {
        match e {
            ScrapeError::Timeout => ProbeFailure::Timeout,
            ScrapeError::Failure(msg) => ProbeFailure::Tracker(msg),
            ScrapeError::Http(HttpTrackerError::NoScrape) => ProbeFailure::ScrapeUnsupported,
            e => ProbeFailure::Transport(error_chain(&e)),
        }
    }
}

fn error_chain(e: &dyn Error) -> String {
    let mut s = e.to_string();
    let mut source = e.source();
    while let Some(src) = source {
        let _ = write!(s, ": {src}");
        source = src.source();
    }
    s
}
