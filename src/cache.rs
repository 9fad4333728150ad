use crate::aggregate::AggregatedResult;
use crate::consts::CACHE_SHARDS;
use crate::infohash::InfoHash;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Flight = Shared<BoxFuture<'static, Result<AggregatedResult, ComputeAborted>>>;

type Shard = HashMap<InfoHash, Slot>;

/// A TTL- and size-bounded cache of aggregated results that runs at most one
/// computation per info hash at a time.
///
/// Computations run as detached tasks: a caller that stops waiting does not
/// cancel the computation, which still completes for any other waiters and
/// for the cache.  Cloning a `ResultCache` produces another handle to the
/// same cache.
///
/// Entries are spread over independently locked shards, so lookups for
/// different info hashes never wait on each other beyond a brief update of
/// the shared recency index.  Only finished results count against the
/// capacity; computations underway are never evicted.
#[derive(Clone)]
pub struct ResultCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    capacity: usize,
    shards: [Mutex<Shard>; CACHE_SHARDS],
    /// Ready entries by last use; the first entry is the least recently used.
    /// Only ever locked while holding at most one shard lock, and never held
    /// while acquiring one.
    recency: Mutex<BTreeMap<u64, InfoHash>>,
    clock: AtomicU64,
    generations: AtomicU64,
}

impl ResultCache {
    pub fn new(capacity: NonZeroUsize) -> ResultCache {
        ResultCache {
            inner: Arc::new(CacheInner {
                capacity: capacity.get(),
                shards: std::array::from_fn(|_| Mutex::new(HashMap::new())),
                recency: Mutex::new(BTreeMap::new()),
                clock: AtomicU64::new(0),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Return the cached result for `info_hash` if it has not expired.
    /// Otherwise, if a computation for `info_hash` is already underway, wait
    /// for its result; if not, start one with `compute` and cache its result
    /// for `ttl`.
    ///
    /// `compute` is called without any cache lock held.
    pub async fn get_or_compute<F, Fut>(
        &self,
        info_hash: InfoHash,
        compute: F,
        ttl: Ttl,
    ) -> Result<AggregatedResult, ComputeAborted>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = AggregatedResult> + Send + 'static,
    {
        let (flight, start) = {
            let mut shard = self.inner.shard(&info_hash).lock();
            match self.inner.lookup(&mut shard, &info_hash, Instant::now()) {
                Lookup::Hit(result) => {
                    tracing::debug!(%info_hash, "Cache hit");
                    return Ok(result);
                }
                Lookup::InFlight(flight) => {
                    tracing::debug!(%info_hash, "Joining in-flight lookup");
                    (flight, None)
                }
                Lookup::Miss => {
                    tracing::debug!(%info_hash, "Cache miss; starting lookup");
                    let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                    let (sender, receiver) = oneshot::channel();
                    let flight = receiver
                        .map(|r| r.map_err(|_| ComputeAborted))
                        .boxed()
                        .shared();
                    shard.insert(
                        info_hash,
                        Slot::Pending {
                            flight: flight.clone(),
                            generation,
                        },
                    );
                    (flight, Some((sender, generation)))
                }
            }
        };
        if let Some((sender, generation)) = start {
            // Armed before `compute` runs so that a panic there still clears
            // the pending slot
            let guard = PendingGuard {
                inner: Arc::clone(&self.inner),
                info_hash,
                generation,
                armed: true,
            };
            launch(guard, compute(), ttl, sender);
        }
        flight.await
    }

    /// Remove any entry for `info_hash`.  A computation already underway is
    /// not cancelled, but its result will not be cached.  Returns `true` if
    /// there was an entry.
    pub fn invalidate(&self, info_hash: &InfoHash) -> bool {
        let mut shard = self.inner.shard(info_hash).lock();
        self.inner.remove_from(&mut shard, info_hash)
    }

    /// Evict all expired entries, returning how many were evicted
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for shard in &self.inner.shards {
            let mut shard = shard.lock();
            let expired = shard
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready { expires_at, .. } if now >= *expires_at => Some(*k),
                    _ => None,
                })
                .collect::<Vec<_>>();
            for k in &expired {
                self.inner.remove_from(&mut shard, k);
            }
            purged += expired.len();
        }
        purged
    }

    /// Number of entries, including computations underway
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of finished results retained
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Spawn `fut` as a detached task that commits its result to the cache before
/// handing it to the waiters
fn launch<Fut>(
    mut guard: PendingGuard,
    fut: Fut,
    ttl: Ttl,
    sender: oneshot::Sender<AggregatedResult>,
) where
    Fut: Future<Output = AggregatedResult> + Send + 'static,
{
    tokio::spawn(async move {
        let result = fut.await;
        guard.commit(result.clone(), ttl);
        // All waiters may have gone away.
        let _ = sender.send(result);
    });
}

/// Removes a pending slot if its computation ends without committing (i.e.,
/// panics or is cancelled by runtime shutdown)
struct PendingGuard {
    inner: Arc<CacheInner>,
    info_hash: InfoHash,
    generation: u64,
    armed: bool,
}

impl PendingGuard {
    fn commit(&mut self, result: AggregatedResult, ttl: Ttl) {
        self.armed = false;
        let expires_at = Instant::now() + ttl.get();
        self.inner
            .commit(self.info_hash, self.generation, result, expires_at);
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(info_hash = %self.info_hash, "Lookup ended without a result");
            self.inner.abandon(&self.info_hash, self.generation);
        }
    }
}

enum Slot {
    Ready {
        result: AggregatedResult,
        expires_at: Instant,
        last_used: u64,
    },
    Pending {
        flight: Flight,
        generation: u64,
    },
}

enum Lookup {
    Hit(AggregatedResult),
    InFlight(Flight),
    Miss,
}

fn is_pending(slot: Option<&Slot>, generation: u64) -> bool {
    matches!(slot, Some(Slot::Pending { generation: g, .. }) if *g == generation)
}

impl CacheInner {
    fn shard(&self, key: &InfoHash) -> &Mutex<Shard> {
        let byte = key.as_bytes().first().copied().unwrap_or_default();
        &self.shards[usize::from(byte) % CACHE_SHARDS]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lookup(&self, shard: &mut Shard, key: &InfoHash, now: Instant) -> Lookup {
        match shard.get_mut(key) {
            Some(Slot::Ready {
                result,
                expires_at,
                last_used,
            }) if now < *expires_at => {
                let tick = self.tick();
                let mut recency = self.recency.lock();
                recency.remove(&*last_used);
                recency.insert(tick, *key);
                *last_used = tick;
                Lookup::Hit(result.clone())
            }
            Some(Slot::Ready { .. }) => {
                tracing::trace!(info_hash = %key, "Evicting expired entry");
                self.remove_from(shard, key);
                Lookup::Miss
            }
            Some(Slot::Pending { flight, .. }) => Lookup::InFlight(flight.clone()),
            None => Lookup::Miss,
        }
    }

    fn commit(
        &self,
        key: InfoHash,
        generation: u64,
        result: AggregatedResult,
        expires_at: Instant,
    ) {
        {
            let mut shard = self.shard(&key).lock();
            if !is_pending(shard.get(&key), generation) {
                // Invalidated while the computation was underway
                return;
            }
            let last_used = self.tick();
            shard.insert(
                key,
                Slot::Ready {
                    result,
                    expires_at,
                    last_used,
                },
            );
            self.recency.lock().insert(last_used, key);
        }
        self.evict_excess();
    }

    fn abandon(&self, key: &InfoHash, generation: u64) {
        let mut shard = self.shard(key).lock();
        if is_pending(shard.get(key), generation) {
            shard.remove(key);
        }
    }

    fn remove_from(&self, shard: &mut Shard, key: &InfoHash) -> bool {
        match shard.remove(key) {
            Some(Slot::Ready { last_used, .. }) => {
                self.recency.lock().remove(&last_used);
                true
            }
            Some(Slot::Pending { .. }) => true,
            None => false,
        }
    }

    /// Evict least recently used results until no more than `capacity`
    /// remain
    fn evict_excess(&self) {
        loop {
            let (tick, key) = {
                let mut recency = self.recency.lock();
                if recency.len() <= self.capacity {
                    return;
                }
                let Some(lru) = recency.pop_first() else {
                    return;
                };
                lru
            };
            let mut shard = self.shard(&key).lock();
            // The entry may have been used again since it was popped, in which
            // case it is now filed under a newer tick.
            if matches!(
                shard.get(&key),
                Some(Slot::Ready { last_used, .. }) if *last_used == tick
            ) {
                tracing::trace!(info_hash = %key, "Evicting least recently used entry");
                shard.remove(&key);
            }
        }
    }
}

/// A strictly positive time-to-live
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Ttl(Duration);

impl Ttl {
    /// Returns `None` if `d` is zero
    pub fn new(d: Duration) -> Option<Ttl> {
        (!d.is_zero()).then_some(Ttl(d))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

#[derive(Copy, Clone, Debug, Eq, Error, PartialEq)]
#[error("swarm lookup terminated without producing a result")]
pub struct ComputeAborted;
