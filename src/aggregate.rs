use crate::book::TrackerBook;
use crate::config::Config;
use crate::infohash::InfoHash;
use crate::probe::{ProbeFailure, ProbeOutcome, ScrapeResult, TrackerProbe};
use crate::tracker::Tracker;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::Instrument;

/// Merged swarm statistics for one info hash across every tracker queried
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AggregatedResult {
    pub info_hash: InfoHash,
    /// Largest seeder count reported by any tracker
    pub seeders: u64,
    /// Largest leecher count reported by any tracker
    pub leechers: u64,
    /// Largest completed-download count reported by any tracker, if any
    /// reported one
    pub completed: Option<u64>,
    /// Number of trackers that answered
    pub responded: usize,
    /// Number of distinct trackers queried
    pub total: usize,
    /// True if any tracker failed, timed out, or was skipped, or if no
    /// tracker answered at all
    pub partial: bool,
    pub computed_at: SystemTime,
    /// Each tracker's individual result, sorted by endpoint URL
    pub endpoints: Vec<ScrapeResult>,
}

impl AggregatedResult {
    /// Combine per-tracker results into a single summary.
    ///
    /// Counts are merged by taking the maximum rather than the sum, as a peer
    /// registered with several trackers is reported by each of them.  The
    /// outcome does not depend on the order of `results`.
    pub fn merge<I>(
        info_hash: InfoHash,
        total: usize,
        results: I,
        computed_at: SystemTime,
    ) -> AggregatedResult
    where
        I: IntoIterator<Item = ScrapeResult>,
    {
        let mut endpoints = results.into_iter().collect::<Vec<_>>();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        let mut seeders = 0;
        let mut leechers = 0;
        let mut completed = None;
        let mut responded = 0;
        for s in endpoints.iter().filter_map(ScrapeResult::scrape) {
            responded += 1;
            seeders = seeders.max(s.seeders);
            leechers = leechers.max(s.leechers);
            completed = completed.max(s.completed);
        }
        AggregatedResult {
            info_hash,
            seeders,
            leechers,
            completed,
            responded,
            total,
            partial: responded == 0 || responded < total,
            computed_at,
            endpoints,
        }
    }
}

/// Fans a lookup out across many trackers at once
#[derive(Clone, Debug)]
pub struct Aggregator {
    config: Arc<Config>,
}

impl Aggregator {
    pub fn new(config: Arc<Config>) -> Aggregator {
        Aggregator { config }
    }

    /// Probe every distinct endpoint concurrently (at most
    /// `max_concurrent_probes` at a time) and merge whatever results arrive
    /// before `overall_timeout` elapses.  Never fails: trackers that do not
    /// answer in time are reported as failures in the result.
    #[tracing::instrument(name = "aggregate", skip_all, fields(info_hash = %info_hash))]
    pub async fn query(
        &self,
        info_hash: InfoHash,
        endpoints: &[Tracker],
        overall_timeout: Duration,
        book: &TrackerBook,
    ) -> AggregatedResult {
        let start = Instant::now();
        let deadline = start + overall_timeout;
        let mut endpoints = dedup(endpoints);
        let total = endpoints.len();
        // Trackers that answered most recently get the first permits.
        endpoints.sort_by_cached_key(|tr| Reverse(book.last_success(&tr.url_string())));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_probes));
        let mut results = Vec::with_capacity(total);
        let mut outstanding = HashSet::new();
        let mut tasks = JoinSet::new();
        for tracker in endpoints {
            let endpoint = tracker.url_string();
            if book.is_backing_off(&endpoint) {
                tracing::debug!(%endpoint, "Skipping tracker after repeated failures");
                results.push(ScrapeResult {
                    endpoint,
                    latency: Duration::ZERO,
                    outcome: ProbeOutcome::Failure(ProbeFailure::BackingOff),
                });
                continue;
            }
            outstanding.insert(endpoint);
            let probe = TrackerProbe::new(tracker, &self.config);
            let permits = Arc::clone(&permits);
            let book = book.clone();
            tasks.spawn(
                async move {
                    // The semaphore is never closed, so this always yields a
                    // permit.
                    let _permit = permits.acquire_owned().await.ok();
                    probe.probe(info_hash, &book).await
                }
                .in_current_span(),
            );
        }
        let mut timed_out = false;
        while !tasks.is_empty() {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(r))) => {
                    outstanding.remove(&r.endpoint);
                    self.record(book, &r);
                    results.push(r);
                }
                Ok(Some(Err(e))) => tracing::warn!(error = %e, "Probe task failed"),
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(
                        outstanding = outstanding.len(),
                        "Overall deadline reached; abandoning remaining trackers"
                    );
                    timed_out = true;
                    break;
                }
            }
        }
        tasks.abort_all();
        let elapsed = start.elapsed();
        for endpoint in outstanding {
            let failure = if timed_out {
                ProbeFailure::DeadlineExceeded
            } else {
                ProbeFailure::Transport(String::from("probe task terminated abnormally"))
            };
            results.push(ScrapeResult {
                endpoint,
                latency: elapsed,
                outcome: ProbeOutcome::Failure(failure),
            });
        }
        let result = AggregatedResult::merge(info_hash, total, results, SystemTime::now());
        tracing::info!(
            seeders = result.seeders,
            leechers = result.leechers,
            responded = result.responded,
            total = result.total,
            partial = result.partial,
            "Aggregated tracker results"
        );
        result
    }

    fn record(&self, book: &TrackerBook, r: &ScrapeResult) {
        match &r.outcome {
            ProbeOutcome::Success(_) => book.record_success(&r.endpoint),
            ProbeOutcome::Failure(f) if f.counts_against_tracker() => book.record_failure(
                &r.endpoint,
                self.config.endpoint_backoff_base,
                self.config.endpoint_backoff_cap,
            ),
            ProbeOutcome::Failure(_) => (),
        }
    }
}

/// Remove duplicate endpoints, keeping the first occurrence of each
fn dedup(endpoints: &[Tracker]) -> Vec<Tracker> {
    let mut seen = HashSet::new();
    endpoints
        .iter()
        .filter(|tr| seen.insert(tr.url_string()))
        .cloned()
        .collect()
}
