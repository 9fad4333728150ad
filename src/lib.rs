//! Resolve magnet links to live swarm health by scraping BitTorrent trackers
//!
//! A [`QueryOrchestrator`] takes a magnet URI or bare info hash, scrapes every
//! known tracker for the swarm concurrently over UDP ([BEP 15]) or HTTP
//! ([BEP 48]), and merges whatever answers arrive before a deadline into an
//! [`AggregatedResult`].  Results are cached for a configurable period, and
//! concurrent requests for the same swarm share a single lookup.
//!
//! ```no_run
//! use swarmhealth::{Config, QueryOrchestrator};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = QueryOrchestrator::new(Config::default())?;
//! let health = orchestrator
//!     .resolve_str("magnet:?xt=urn:btih:28c55196f57753c40aceb6fb58617e6995a7eddb&tr=udp://tracker.opentrackr.org:1337/announce")
//!     .await?;
//! println!("{} seeders, {} leechers", health.seeders, health.leechers);
//! # Ok(())
//! # }
//! ```
//!
//! [BEP 15]: https://www.bittorrent.org/beps/bep_0015.html
//! [BEP 48]: https://www.bittorrent.org/beps/bep_0048.html
mod aggregate;
mod book;
mod cache;
mod config;
mod consts;
mod infohash;
mod magnet;
mod orchestrator;
mod probe;
#[cfg(test)]
mod testing;
mod tracker;
mod util;
pub use crate::aggregate::{AggregatedResult, Aggregator};
pub use crate::book::TrackerBook;
pub use crate::cache::{ComputeAborted, ResultCache, Ttl};
pub use crate::config::{Config, ConfigError};
pub use crate::infohash::{InfoHash, InfoHashError};
pub use crate::magnet::{DecodeError, MagnetLink};
pub use crate::orchestrator::{InputError, Query, QueryError, QueryOrchestrator};
pub use crate::probe::{ProbeFailure, ProbeOutcome, ScrapeResult, TrackerProbe};
pub use crate::tracker::{
    HttpTracker, HttpTrackerError, Scrape, ScrapeError, ScrapeMap, Tracker, TrackerUrlError,
    UdpTracker, UdpTrackerError,
};
pub use crate::util::{PacketError, UnbencodeError};
