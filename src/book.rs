use crate::tracker::udp::Connection;
use crate::util::backoff_delay;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Transient per-endpoint state, keyed by normalized tracker URL.
///
/// A fresh book is used for every aggregation run unless the caller supplies
/// one; a long-lived book lets UDP connection IDs be reused across runs and
/// lets repeatedly failing endpoints be skipped for a while.
///
/// Cloning a `TrackerBook` produces another handle to the same state.
#[derive(Clone, Debug, Default)]
pub struct TrackerBook {
    inner: Arc<Mutex<HashMap<String, EndpointState>>>,
}

#[derive(Clone, Debug, Default)]
struct EndpointState {
    udp_conn: Option<Connection>,
    last_success: Option<Instant>,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
}

impl TrackerBook {
    pub fn new() -> TrackerBook {
        TrackerBook::default()
    }

    /// Return a still-valid UDP connection ID previously obtained from the
    /// endpoint, if any
    pub(crate) fn udp_connection(&self, endpoint: &str) -> Option<Connection> {
        let now = Instant::now();
        self.inner
            .lock()
            .get(endpoint)
            .and_then(|st| st.udp_conn)
            .filter(|c| now < c.expiration)
            .map(|c| Connection { fresh: false, ..c })
    }

    pub(crate) fn store_udp_connection(&self, endpoint: &str, conn: Connection) {
        self.inner
            .lock()
            .entry(endpoint.to_owned())
            .or_default()
            .udp_conn = Some(conn);
    }

    pub(crate) fn record_success(&self, endpoint: &str) {
        let mut inner = self.inner.lock();
        let st = inner.entry(endpoint.to_owned()).or_default();
        st.last_success = Some(Instant::now());
        st.consecutive_failures = 0;
        st.retry_after = None;
    }

    /// Note a failed probe of `endpoint`.  After each consecutive failure the
    /// endpoint is skipped for an exponentially growing period starting at
    /// `base` and capped at `cap`.
    pub(crate) fn record_failure(&self, endpoint: &str, base: Duration, cap: Duration) {
        let mut inner = self.inner.lock();
        let st = inner.entry(endpoint.to_owned()).or_default();
        let delay = backoff_delay(base, cap, st.consecutive_failures);
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);
        st.retry_after = Some(Instant::now() + delay);
        st.udp_conn = None;
    }

    /// Whether `endpoint` is currently being skipped after repeated failures
    pub(crate) fn is_backing_off(&self, endpoint: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .get(endpoint)
            .and_then(|st| st.retry_after)
            .is_some_and(|t| now < t)
    }

    pub(crate) fn last_success(&self, endpoint: &str) -> Option<Instant> {
        self.inner.lock().get(endpoint).and_then(|st| st.last_success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EP: &str = "udp://tracker.example.com:6969/announce";

    #[tokio::test(start_paused = true)]
    async fn test_backoff_window_grows() {
        let book = TrackerBook::new();
        let base = Duration::from_secs(30);
        let cap = Duration::from_secs(600);
        assert!(!book.is_backing_off(EP));
        book.record_failure(EP, base, cap);
        assert!(book.is_backing_off(EP));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!book.is_backing_off(EP));
        book.record_failure(EP, base, cap);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(book.is_backing_off(EP));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!book.is_backing_off(EP));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_clears_backoff() {
        let book = TrackerBook::new();
        book.record_failure(EP, Duration::from_secs(30), Duration::from_secs(600));
        book.record_success(EP);
        assert!(!book.is_backing_off(EP));
        assert!(book.last_success(EP).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_connection_expires() {
        let book = TrackerBook::new();
        book.store_udp_connection(
            EP,
            Connection {
                id: 42,
                expiration: Instant::now() + Duration::from_secs(60),
                fresh: true,
            },
        );
        let conn = book.udp_connection(EP).unwrap();
        assert_eq!(conn.id, 42);
        assert!(!conn.fresh);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(book.udp_connection(EP), None);
    }
}
