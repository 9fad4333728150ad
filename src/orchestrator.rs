use crate::aggregate::{AggregatedResult, Aggregator};
use crate::book::TrackerBook;
use crate::cache::{ComputeAborted, ResultCache, Ttl};
use crate::config::{Config, ConfigError};
use crate::infohash::{InfoHash, InfoHashError};
use crate::magnet::{DecodeError, MagnetLink};
use crate::tracker::Tracker;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// A request for the health of a single swarm
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Query {
    /// A magnet URI, decoded when the query is resolved
    Magnet(String),
    /// A bare info hash along with any trackers known for it
    InfoHash {
        info_hash: InfoHash,
        trackers: Vec<Tracker>,
    },
}

impl From<InfoHash> for Query {
    fn from(info_hash: InfoHash) -> Query {
        Query::InfoHash {
            info_hash,
            trackers: Vec::new(),
        }
    }
}

impl From<MagnetLink> for Query {
    fn from(magnet: MagnetLink) -> Query {
        Query::InfoHash {
            info_hash: magnet.info_hash,
            trackers: magnet.trackers,
        }
    }
}

impl FromStr for Query {
    type Err = InputError;

    /// Anything containing a colon is taken to be a URI; everything else must
    /// be a hex or base32 info hash.
    fn from_str(s: &str) -> Result<Query, InputError> {
        let s = s.trim();
        if s.contains(':') {
            Ok(Query::Magnet(s.to_owned()))
        } else {
            Ok(Query::from(s.parse::<InfoHash>()?))
        }
    }
}

/// Resolves queries to aggregated swarm statistics, sharing results (and
/// lookups still underway) between callers through a [`ResultCache`]
#[derive(Clone, Debug)]
pub struct QueryOrchestrator {
    config: Arc<Config>,
    cache: ResultCache,
    aggregator: Aggregator,
    book: Option<TrackerBook>,
    ttl: Ttl,
}

impl QueryOrchestrator {
    pub fn new(config: Config) -> Result<QueryOrchestrator, ConfigError> {
        let capacity = NonZeroUsize::new(config.cache_capacity)
            .ok_or(ConfigError::Zero("cache_capacity"))?;
        QueryOrchestrator::with_cache(config, ResultCache::new(capacity))
    }

    /// Construct an orchestrator that stores results in an existing cache.
    /// The cache's own capacity takes precedence over `config.cache_capacity`.
    pub fn with_cache(config: Config, cache: ResultCache) -> Result<QueryOrchestrator, ConfigError> {
        config.validate()?;
        let ttl = Ttl::new(config.cache_ttl).ok_or(ConfigError::ZeroDuration("cache_ttl"))?;
        let book = config.remember_trackers.then(TrackerBook::new);
        let config = Arc::new(config);
        Ok(QueryOrchestrator {
            aggregator: Aggregator::new(Arc::clone(&config)),
            config,
            cache,
            book,
            ttl,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    /// Look up the swarm for `query`, reusing a cached or in-progress result
    /// for the same info hash if there is one.
    ///
    /// The trackers queried are those declared by the query followed by the
    /// configured `extra_trackers`.  Failing to reach any tracker is not an
    /// error; it yields a result with `responded == 0`.
    #[tracing::instrument(name = "resolve", skip_all)]
    pub async fn resolve(&self, query: Query) -> Result<AggregatedResult, QueryError> {
        let (info_hash, mut trackers) = match query {
            Query::Magnet(uri) => {
                let magnet = MagnetLink::decode(&uri).map_err(InputError::from)?;
                (magnet.info_hash, magnet.trackers)
            }
            Query::InfoHash {
                info_hash,
                trackers,
            } => (info_hash, trackers),
        };
        for tr in &self.config.extra_trackers {
            if !trackers.contains(tr) {
                trackers.push(tr.clone());
            }
        }
        tracing::debug!(%info_hash, trackers = trackers.len(), "Resolving swarm");
        let aggregator = self.aggregator.clone();
        let book = self.book.clone().unwrap_or_default();
        let overall_timeout = self.config.overall_timeout;
        let compute = move || async move {
            aggregator
                .query(info_hash, &trackers, overall_timeout, &book)
                .await
        };
        Ok(self.cache.get_or_compute(info_hash, compute, self.ttl).await?)
    }

    /// Parse `input` as a magnet URI or info hash and resolve it
    pub async fn resolve_str(&self, input: &str) -> Result<AggregatedResult, QueryError> {
        let query = input.parse::<Query>()?;
        self.resolve(query).await
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum QueryError {
    #[error("invalid input")]
    InvalidInput(#[from] InputError),
    #[error(transparent)]
    Aborted(#[from] ComputeAborted),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum InputError {
    #[error("failed to decode magnet link")]
    Magnet(#[from] DecodeError),
    #[error("invalid info hash")]
    InfoHash(#[from] InfoHashError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockBehavior, MockUdpTracker};
    use std::collections::HashMap;
    use std::time::Duration;

    const HASH: &str = "28c55196f57753c40aceb6fb58617e6995a7eddb";

    fn ih() -> InfoHash {
        HASH.parse().unwrap()
    }

    fn fast_config() -> Config {
        Config {
            probe_timeout: Duration::from_secs(1),
            overall_timeout: Duration::from_secs(2),
            udp_attempts: 3,
            udp_backoff_base: Duration::from_millis(50),
            udp_backoff_cap: Duration::from_millis(200),
            ..Config::default()
        }
    }

    fn magnet(mock: &MockUdpTracker) -> String {
        format!("magnet:?xt=urn:btih:{HASH}&tr={}", mock.url())
    }

    #[test]
    fn test_parse_query() {
        assert_eq!("magnet:?xt=x".parse::<Query>(), Ok(Query::Magnet("magnet:?xt=x".into())));
        assert_eq!(
            HASH.parse::<Query>(),
            Ok(Query::InfoHash {
                info_hash: ih(),
                trackers: Vec::new(),
            })
        );
        assert_eq!(
            "FDCVDFXVO5J4ICWOW35VQYL6NGK2P3O3".parse::<Query>(),
            Ok(Query::from(ih()))
        );
        assert!(matches!(
            "not-a-hash".parse::<Query>(),
            Err(InputError::InfoHash(_))
        ));
    }

    #[test]
    fn test_new_validates_config() {
        let cfg = Config {
            cache_capacity: 0,
            ..Config::default()
        };
        assert_eq!(
            QueryOrchestrator::new(cfg).unwrap_err(),
            ConfigError::Zero("cache_capacity")
        );
    }

    #[tokio::test]
    async fn test_resolve_invalid_magnet() {
        let orch = QueryOrchestrator::new(fast_config()).unwrap();
        assert_eq!(
            orch.resolve_str("magnet:?dn=nothing").await,
            Err(QueryError::InvalidInput(InputError::Magnet(
                DecodeError::MissingInfoHash
            )))
        );
        assert!(orch.cache().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_magnet() {
        let mock = MockUdpTracker::spawn(MockBehavior {
            stats: HashMap::from([(ih(), (21, 400, 6))]),
            ..MockBehavior::default()
        })
        .await;
        let orch = QueryOrchestrator::new(fast_config()).unwrap();
        let r = orch.resolve_str(&magnet(&mock)).await.unwrap();
        assert_eq!(r.info_hash, ih());
        assert_eq!(r.seeders, 21);
        assert_eq!(r.leechers, 6);
        assert_eq!(r.completed, Some(400));
        assert_eq!((r.responded, r.total), (1, 1));
        assert!(!r.partial);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_lookup() {
        let mock = MockUdpTracker::spawn(MockBehavior {
            stats: HashMap::from([(ih(), (3, 0, 1))]),
            delay: Duration::from_millis(200),
            ..MockBehavior::default()
        })
        .await;
        // The first retransmission must come after the delayed reply, or a
        // resent scrape would be counted as a second lookup
        let config = Config {
            probe_timeout: Duration::from_secs(3),
            overall_timeout: Duration::from_secs(5),
            udp_backoff_base: Duration::from_secs(1),
            udp_backoff_cap: Duration::from_secs(2),
            ..fast_config()
        };
        let orch = QueryOrchestrator::new(config).unwrap();
        let uri = magnet(&mock);
        let results =
            futures_util::future::join_all((0..8).map(|_| orch.resolve_str(&uri))).await;
        assert_eq!(mock.connects(), 1);
        assert_eq!(mock.scrapes(), 1);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.seeders, 3);
        assert!(results.iter().all(|r| r.as_ref() == Ok(first)));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let mock = MockUdpTracker::spawn(MockBehavior {
            stats: HashMap::from([(ih(), (3, 0, 1))]),
            ..MockBehavior::default()
        })
        .await;
        let orch = QueryOrchestrator::new(fast_config()).unwrap();
        let first = orch.resolve_str(&magnet(&mock)).await.unwrap();
        // Same swarm, asked for by bare hash this time
        let second = orch.resolve_str(HASH).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.connects(), 1);
        assert_eq!(mock.scrapes(), 1);
    }

    #[tokio::test]
    async fn test_bare_hash_uses_extra_trackers() {
        let mock = MockUdpTracker::spawn(MockBehavior {
            stats: HashMap::from([(ih(), (9, 1, 2))]),
            ..MockBehavior::default()
        })
        .await;
        let cfg = Config {
            extra_trackers: vec![mock.tracker()],
            ..fast_config()
        };
        let orch = QueryOrchestrator::new(cfg).unwrap();
        let r = orch.resolve_str(HASH).await.unwrap();
        assert_eq!(r.seeders, 9);
        assert_eq!(r.total, 1);
    }

    #[tokio::test]
    async fn test_bare_hash_without_trackers() {
        let orch = QueryOrchestrator::new(fast_config()).unwrap();
        let r = orch.resolve_str(HASH).await.unwrap();
        assert_eq!((r.responded, r.total), (0, 0));
        assert!(r.partial);
        assert!(r.endpoints.is_empty());
    }

    #[tokio::test]
    async fn test_shared_cache_between_orchestrators() {
        let mock = MockUdpTracker::spawn(MockBehavior {
            stats: HashMap::from([(ih(), (1, 0, 0))]),
            ..MockBehavior::default()
        })
        .await;
        let cache = ResultCache::new(NonZeroUsize::new(8).unwrap());
        let a = QueryOrchestrator::with_cache(fast_config(), cache.clone()).unwrap();
        let b = QueryOrchestrator::with_cache(fast_config(), cache).unwrap();
        a.resolve_str(&magnet(&mock)).await.unwrap();
        b.resolve_str(&magnet(&mock)).await.unwrap();
        assert_eq!(mock.scrapes(), 1);
        assert_eq!(b.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_remembered_trackers_reuse_connections() {
        let other = InfoHash::V1([0x42; 20]);
        for (remember, connects) in [(false, 2), (true, 1)] {
            let mock = MockUdpTracker::spawn(MockBehavior::default()).await;
            let cfg = Config {
                remember_trackers: remember,
                ..fast_config()
            };
            let orch = QueryOrchestrator::new(cfg).unwrap();
            for info_hash in [ih(), other] {
                orch.resolve(Query::InfoHash {
                    info_hash,
                    trackers: vec![mock.tracker()],
                })
                .await
                .unwrap();
            }
            assert_eq!(mock.connects(), connects, "remember_trackers = {remember}");
        }
    }
}
