//! Content Cache
//!
//! Maps a [`Fingerprint`] to previously generated content and guarantees
//! that at most one generation per fingerprint is in flight at a time.
//! Concurrent callers for the same fingerprint wait on the first caller's
//! generation and all receive its result. Failures are handed to everyone
//! who was waiting and then forgotten, so the next caller tries again.
//!
//! Entries are persisted in a [`KeyValueStore`] off the hot path. The store
//! may evict anything at any time; a miss simply falls through to
//! generation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{FailureCause, GenerationError};
use crate::fingerprint::Fingerprint;

/// Byte-oriented storage backing the content cache.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fails when the backend cannot be reached.
    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process [`KeyValueStore`] that evicts the least-recently-used entries
/// once the stored bytes exceed a ceiling.
pub struct MemoryKeyValueStore {
    inner: Mutex<LruInner>,
}

struct LruInner {
    map: HashMap<String, Vec<u8>>,
    /// front = oldest, back = newest
    order: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
}

impl LruInner {
    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }

    fn evict_until_fits(&mut self) {
        while self.bytes > self.max_bytes {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(value) = self.map.remove(&oldest) {
                self.bytes -= oldest.len() + value.len();
                debug!(key = %oldest, "Evicted cache entry");
            }
        }
    }
}

impl MemoryKeyValueStore {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
                max_bytes,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map.contains_key(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let Some(value) = inner.map.get(key).cloned() else {
            return Ok(None);
        };
        inner.touch(key);
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock();
        let size = key.len() + value.len();
        if let Some(previous) = inner.map.insert(key.to_string(), value) {
            inner.bytes -= key.len() + previous.len();
        }
        inner.bytes += size;
        inner.touch(key);
        inner.evict_until_fits();
        Ok(())
    }
}

/// What the cache persists per fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Counters describing how the cache has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Served from the key-value store.
    pub hits: u64,
    /// Not in the store; the caller generated.
    pub misses: u64,
    /// Shared another caller's in-flight generation.
    pub joined: u64,
    pub generations: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    generations: AtomicU64,
    failures: AtomicU64,
}

type Outcome = Option<Result<Value, GenerationError>>;

struct CacheInner {
    store: Arc<dyn KeyValueStore>,
    inflight: Mutex<HashMap<Fingerprint, watch::Receiver<Outcome>>>,
    counters: Counters,
}

impl CacheInner {
    /// Drops the in-flight record for `fingerprint` if it still belongs to
    /// the flight `ours` is watching.
    fn retire(&self, fingerprint: &Fingerprint, ours: &watch::Receiver<Outcome>) {
        let mut inflight = self.inflight.lock();
        if inflight
            .get(fingerprint)
            .is_some_and(|current| current.same_channel(ours))
        {
            inflight.remove(fingerprint);
        }
    }
}

/// Single-flight content cache. Cheap to clone.
#[derive(Clone)]
pub struct ContentCache {
    inner: Arc<CacheInner>,
}

enum Role {
    Leader(watch::Sender<Outcome>, watch::Receiver<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

/// Releases followers if the leading caller is dropped mid-generation.
struct Flight {
    inner: Arc<CacheInner>,
    fingerprint: Fingerprint,
    tx: watch::Sender<Outcome>,
    rx: watch::Receiver<Outcome>,
    landed: bool,
}

impl Flight {
    fn land(&mut self, outcome: Result<Value, GenerationError>) {
        self.tx.send_replace(Some(outcome));
        self.landed = true;
    }
}

impl Drop for Flight {
    fn drop(&mut self) {
        if !self.landed {
            self.tx.send_replace(Some(Err(GenerationError::new(
                FailureCause::UpstreamError,
                0,
                "generation was abandoned before it completed",
            ))));
            self.inner.retire(&self.fingerprint, &self.rx);
        }
    }
}

impl ContentCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                inflight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the cached value for `fingerprint`, or runs `generate` to
    /// produce it.
    ///
    /// At most one `generate` runs per fingerprint at any moment; concurrent
    /// callers receive the same result, failures included.
    pub async fn get_or_generate<T, F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        generate: F,
    ) -> Result<T, GenerationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let role = {
            let mut inflight = self.inner.inflight.lock();
            match inflight.get(fingerprint) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(fingerprint.clone(), rx.clone());
                    Role::Leader(tx, rx)
                }
            }
        };

        match role {
            Role::Follower(rx) => self.follow(fingerprint, rx).await,
            Role::Leader(tx, rx) => {
                let flight = Flight {
                    inner: self.inner.clone(),
                    fingerprint: fingerprint.clone(),
                    tx,
                    rx,
                    landed: false,
                };
                self.lead(flight, generate).await
            }
        }
    }

    async fn follow<T: DeserializeOwned>(
        &self,
        fingerprint: &Fingerprint,
        mut rx: watch::Receiver<Outcome>,
    ) -> Result<T, GenerationError> {
        self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
        debug!(%fingerprint, "Joining in-flight generation");
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(payload)) => decode(payload),
            Some(Err(err)) => Err(err),
            None => Err(GenerationError::new(
                FailureCause::UpstreamError,
                0,
                "generation was abandoned before it completed",
            )),
        }
    }

    async fn lead<T, F, Fut>(&self, mut flight: Flight, generate: F) -> Result<T, GenerationError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GenerationError>>,
    {
        let counters = &self.inner.counters;
        if let Some(payload) = self.lookup(&flight.fingerprint).await {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(value) => {
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(fingerprint = %flight.fingerprint, "Cache hit");
                    flight.land(Ok(payload));
                    self.inner.retire(&flight.fingerprint, &flight.rx);
                    return Ok(value);
                }
                Err(err) => {
                    warn!(fingerprint = %flight.fingerprint, error = %err, "Discarding unreadable cache entry");
                }
            }
        }

        counters.misses.fetch_add(1, Ordering::Relaxed);
        counters.generations.fetch_add(1, Ordering::Relaxed);
        debug!(fingerprint = %flight.fingerprint, "Cache miss, generating");

        let generated = generate().await.and_then(|value| {
            serde_json::to_value(&value)
                .map(|payload| (value, payload))
                .map_err(|err| {
                    GenerationError::new(FailureCause::InvalidResponse, 1, err.to_string())
                })
        });

        match generated {
            Ok((value, payload)) => {
                flight.land(Ok(payload.clone()));
                self.persist(&flight, payload);
                Ok(value)
            }
            Err(err) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                flight.land(Err(err.clone()));
                self.inner.retire(&flight.fingerprint, &flight.rx);
                Err(err)
            }
        }
    }

    /// Read failures and unreadable entries count as misses.
    async fn lookup(&self, fingerprint: &Fingerprint) -> Option<Value> {
        match self.inner.store.get(fingerprint.as_str()).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                Ok(entry) => Some(entry.payload),
                Err(err) => {
                    warn!(%fingerprint, error = %err, "Cache entry is not valid JSON");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(%fingerprint, error = %err, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Writes the entry in the background. The in-flight record stays
    /// until the write lands so callers arriving meanwhile still share it.
    fn persist(&self, flight: &Flight, payload: Value) {
        let inner = self.inner.clone();
        let fingerprint = flight.fingerprint.clone();
        let rx = flight.rx.clone();
        tokio::spawn(async move {
            let entry = CacheEntry {
                fingerprint: fingerprint.clone(),
                payload,
                created_at: Utc::now(),
            };
            match serde_json::to_vec(&entry) {
                Ok(bytes) => {
                    if let Err(err) = inner.store.put(fingerprint.as_str(), bytes).await {
                        warn!(%fingerprint, error = %err, "Cache write failed");
                    }
                }
                Err(err) => warn!(%fingerprint, error = %err, "Could not encode cache entry"),
            }
            inner.retire(&fingerprint, &rx);
        });
    }

    pub async fn health(&self) -> Result<()> {
        self.inner.store.health().await
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            generations: c.generations.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Number of generations currently in flight (including pending writes).
    pub fn inflight(&self) -> usize {
        self.inner.inflight.lock().len()
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, GenerationError> {
    serde_json::from_value(payload)
        .map_err(|err| GenerationError::new(FailureCause::InvalidResponse, 1, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course::{ExperienceLevel, GenerationRequest};
    use crate::fingerprint::Stage;
    use anyhow::anyhow;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fingerprint() -> Fingerprint {
        Fingerprint::of(
            &GenerationRequest::new("basic statistics", ExperienceLevel::Beginner),
            &Stage::Metadata,
        )
    }

    fn cache() -> (ContentCache, Arc<MemoryKeyValueStore>) {
        let store = Arc::new(MemoryKeyValueStore::new(1 << 20));
        (ContentCache::new(store.clone()), store)
    }

    async fn settle(cache: &ContentCache) {
        for _ in 0..100 {
            if cache.inflight() == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_generation() {
        let (cache, _) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint();

        let results = join_all((0..8).map(|_| {
            let calls = calls.clone();
            cache.get_or_generate(&fp, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, GenerationError>("Statistics for athletes".to_string())
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.unwrap(), "Statistics for athletes");
        }
        let stats = cache.stats();
        assert_eq!(stats.generations, 1);
        assert_eq!(stats.joined, 7);
    }

    #[tokio::test]
    async fn stored_entries_are_served_without_generating() {
        let (cache, store) = cache();
        let fp = fingerprint();

        let first: u32 = cache.get_or_generate(&fp, || async { Ok(42) }).await.unwrap();
        settle(&cache).await;
        assert!(store.contains(fp.as_str()));

        let regenerated = AtomicUsize::new(0);
        let second: u32 = cache
            .get_or_generate(&fp, || async {
                regenerated.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            })
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(regenerated.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (cache, store) = cache();
        let fp = fingerprint();

        let failed: Result<u32, _> = cache
            .get_or_generate(&fp, || async {
                Err(GenerationError::new(FailureCause::Timeout, 3, "slow"))
            })
            .await;
        assert_eq!(failed.unwrap_err().cause, FailureCause::Timeout);
        assert!(!store.contains(fp.as_str()));
        assert_eq!(cache.inflight(), 0);

        let retried: u32 = cache.get_or_generate(&fp, || async { Ok(7) }).await.unwrap();
        assert_eq!(retried, 7);
        assert_eq!(cache.stats().generations, 2);
    }

    #[tokio::test]
    async fn waiting_callers_receive_the_failure() {
        let (cache, _) = cache();
        let fp = fingerprint();
        let calls = Arc::new(AtomicUsize::new(0));

        let results: Vec<Result<u32, GenerationError>> = join_all((0..3).map(|_| {
            let calls = calls.clone();
            cache.get_or_generate(&fp, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(GenerationError::new(FailureCause::RateLimited, 3, "quota"))
            })
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(
            results
                .iter()
                .all(|r| r.as_ref().unwrap_err().cause == FailureCause::RateLimited)
        );
    }

    #[tokio::test]
    async fn dropped_leader_releases_followers() {
        let (cache, _) = cache();
        let fp = fingerprint();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = {
            let cache = cache.clone();
            let fp = fp.clone();
            tokio::spawn(async move {
                cache
                    .get_or_generate(&fp, move || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<Result<u32, GenerationError>>().await
                    })
                    .await
            })
        };
        started_rx.await.unwrap();

        let follower = {
            let cache = cache.clone();
            let fp = fp.clone();
            tokio::spawn(async move {
                cache
                    .get_or_generate(&fp, || async { Ok::<u32, GenerationError>(1) })
                    .await
            })
        };
        while cache.stats().joined == 0 {
            tokio::task::yield_now().await;
        }
        leader.abort();

        let err = follower.await.unwrap().unwrap_err();
        assert_eq!(err.cause, FailureCause::UpstreamError);
        assert_eq!(cache.inflight(), 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Err(anyhow!("connection refused"))
        }
        async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    #[tokio::test]
    async fn store_failures_degrade_to_generation() {
        let cache = ContentCache::new(Arc::new(BrokenStore));
        let value: String = cache
            .get_or_generate(&fingerprint(), || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
        settle(&cache).await;
        assert_eq!(cache.inflight(), 0);
    }

    #[tokio::test]
    async fn memory_store_evicts_least_recently_used() {
        // Each entry is a 1-byte key plus a 4-byte value.
        let store = MemoryKeyValueStore::new(10);
        store.put("a", vec![0; 4]).await.unwrap();
        store.put("b", vec![0; 4]).await.unwrap();
        assert!(store.get("a").await.unwrap().is_some());

        store.put("c", vec![0; 4]).await.unwrap();

        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
        assert_eq!(store.len(), 2);
    }
}
