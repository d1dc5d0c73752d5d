//! Content-addressed compile cache.
//!
//! Keeps compiled artifacts keyed by [`CacheKey`] with single-flight
//! deduplication of concurrent compiles and hybrid TTL / LRU eviction.
//! Eviction runs inline on every [`CompileCache::ensure`] call; there is no
//! background timer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::artifact::CompiledArtifact;
use super::key::CacheKey;
use crate::utils::singleflight::{FlightOutcome, InFlight};
use crate::{Error, Result};

type Flight = InFlight<Arc<CompiledArtifact>>;

/// Compile cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of stored entries. Zero disables storage; compiles are
    /// still deduplicated while in flight.
    pub capacity: usize,
    /// Maximum entry age measured from creation. `None` disables expiry.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 32,
            ttl: Some(Duration::from_secs(3600)),
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }
}

struct CacheEntry {
    artifact: Arc<CompiledArtifact>,
    created_at: Instant,
    last_used_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    in_flight: HashMap<CacheKey, Arc<Flight>>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    joins: AtomicU64,
    compiles: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub ttl_secs: Option<u64>,
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub compiles: u64,
    pub failures: u64,
    pub evictions: u64,
    pub expirations: u64,
}

enum Role {
    Hit(Arc<CompiledArtifact>),
    Follower(Arc<Flight>),
    Leader(Arc<Flight>),
}

/// Compile cache shared by all workers.
pub struct CompileCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    counters: Counters,
}

impl CompileCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the artifact for `key`, compiling it with `compile` at most once
    /// across concurrent callers.
    ///
    /// Callers that find a compile in flight wait for it and share its result,
    /// including its failure. A failed compile is not remembered, so the next
    /// call retries. If the leading caller is dropped mid-compile, waiters
    /// wake up and one of them becomes the new leader.
    pub async fn ensure<F, Fut>(&self, key: &CacheKey, compile: F) -> Result<Arc<CompiledArtifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CompiledArtifact>>,
    {
        let mut compile = Some(compile);

        loop {
            let (role, evicted) = self.claim(key);
            drop(evicted);

            match role {
                Role::Hit(artifact) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key.short(), "Compile cache hit");
                    return Ok(artifact);
                }
                Role::Follower(flight) => {
                    self.counters.joins.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key.short(), flight = flight.id(), "Joining in-flight compile");
                    match flight.wait().await {
                        FlightOutcome::Done(artifact) => return Ok(artifact),
                        FlightOutcome::Failed(message) => return Err(Error::Compile(message)),
                        FlightOutcome::Abandoned => {
                            debug!(key = %key.short(), "In-flight compile abandoned, retrying");
                            continue;
                        }
                    }
                }
                Role::Leader(flight) => {
                    let Some(compile) = compile.take() else {
                        // A leader never loops back, so the closure is always present here.
                        return Err(Error::Other("compile closure already consumed".into()));
                    };
                    return self.lead(key, flight, compile).await;
                }
            }
        }
    }

    /// Decide this caller's role under the lock. Evicted artifacts are handed
    /// back so they are dropped after the lock is released.
    fn claim(&self, key: &CacheKey) -> (Role, Vec<Arc<CompiledArtifact>>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let evicted = self.evict_locked(&mut state, now);

        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_used_at = now;
            return (Role::Hit(entry.artifact.clone()), evicted);
        }

        if let Some(flight) = state.in_flight.get(key) {
            return (Role::Follower(flight.clone()), evicted);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let flight = InFlight::new();
        state.in_flight.insert(key.clone(), flight.clone());
        (Role::Leader(flight), evicted)
    }

    async fn lead<F, Fut>(
        &self,
        key: &CacheKey,
        flight: Arc<Flight>,
        compile: F,
    ) -> Result<Arc<CompiledArtifact>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CompiledArtifact>>,
    {
        let mut guard = LeaderGuard {
            cache: self,
            key,
            flight,
            armed: true,
        };

        info!(key = %key.short(), "Compiling composition");
        let started = std::time::Instant::now();
        let result = compile().await;
        guard.armed = false;

        let evicted;
        let outcome = {
            let mut state = self.state.lock();
            remove_flight(&mut state, key, &guard.flight);

            match result {
                Ok(artifact) => {
                    let artifact = Arc::new(artifact);
                    self.counters.compiles.fetch_add(1, Ordering::Relaxed);

                    if self.config.capacity > 0 {
                        let now = Instant::now();
                        state.entries.insert(
                            key.clone(),
                            CacheEntry {
                                artifact: artifact.clone(),
                                created_at: now,
                                last_used_at: now,
                            },
                        );
                    }
                    evicted = self.evict_locked(&mut state, Instant::now());
                    Ok(artifact)
                }
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    evicted = Vec::new();
                    Err(e)
                }
            }
        };
        drop(evicted);

        match outcome {
            Ok(artifact) => {
                info!(
                    key = %key.short(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Composition compiled"
                );
                guard.flight.finish(FlightOutcome::Done(artifact.clone()));
                Ok(artifact)
            }
            Err(e) => {
                warn!(key = %key.short(), error = %e, "Composition compile failed");
                let message = match &e {
                    Error::Compile(message) => message.clone(),
                    other => other.to_string(),
                };
                guard.flight.finish(FlightOutcome::Failed(message));
                Err(e)
            }
        }
    }

    /// Purge expired entries, then evict least-recently-used entries until
    /// the cache is at or under capacity.
    fn evict_locked(&self, state: &mut CacheState, now: Instant) -> Vec<Arc<CompiledArtifact>> {
        let mut evicted = Vec::new();

        if let Some(ttl) = self.config.ttl {
            let expired: Vec<CacheKey> = state
                .entries
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.created_at) >= ttl)
                .map(|(key, _)| key.clone())
                .collect();

            for key in expired {
                if let Some(entry) = state.entries.remove(&key) {
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key.short(), "Compile cache entry expired");
                    evicted.push(entry.artifact);
                }
            }
        }

        while state.entries.len() > self.config.capacity {
            let Some(lru) = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used_at)
                .map(|(key, _)| key.clone())
            else {
                break;
            };

            if let Some(entry) = state.entries.remove(&lru) {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %lru.short(), "Evicted least recently used compile");
                evicted.push(entry.artifact);
            }
        }

        evicted
    }

    /// Whether a live entry exists for `key`. Does not refresh it.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let state = self.state.lock();
        match (state.entries.get(key), self.config.ttl) {
            (Some(entry), Some(ttl)) => entry.created_at.elapsed() < ttl,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, in_flight) = {
            let state = self.state.lock();
            (state.entries.len(), state.in_flight.len())
        };

        CacheStats {
            entries,
            in_flight,
            capacity: self.config.capacity,
            ttl_secs: self.config.ttl.map(|ttl| ttl.as_secs()),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            joins: self.counters.joins.load(Ordering::Relaxed),
            compiles: self.counters.compiles.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

fn remove_flight(state: &mut CacheState, key: &CacheKey, flight: &Arc<Flight>) {
    if state
        .in_flight
        .get(key)
        .is_some_and(|current| Arc::ptr_eq(current, flight))
    {
        state.in_flight.remove(key);
    }
}

/// Clears the in-flight marker and wakes waiters if the leader is dropped
/// before publishing a result.
struct LeaderGuard<'a> {
    cache: &'a CompileCache,
    key: &'a CacheKey,
    flight: Arc<Flight>,
    armed: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        {
            let mut state = self.cache.state.lock();
            remove_flight(&mut state, self.key, &self.flight);
        }
        warn!(key = %self.key.short(), "Compile leader dropped before finishing");
        self.flight.finish(FlightOutcome::Abandoned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutputGeometry;
    use std::sync::atomic::AtomicUsize;

    fn key(source: &str) -> CacheKey {
        CacheKey::new(
            source,
            &OutputGeometry {
                width: 1080,
                height: 1920,
                fps: 30,
                duration_frames: 150,
            },
        )
    }

    fn artifact(key: &CacheKey) -> CompiledArtifact {
        CompiledArtifact::new(key.clone(), "/tmp/bundle", "/tmp/bundle/index.js")
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_compile() {
        let cache = Arc::new(CompileCache::new(CacheConfig::default()));
        let compiles = Arc::new(AtomicUsize::new(0));
        let k = key("shared");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let compiles = compiles.clone();
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .ensure(&k, || async {
                        compiles.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(artifact(&k))
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().compiles, 1);
    }

    #[tokio::test]
    async fn failure_is_shared_then_retried() {
        let cache = Arc::new(CompileCache::new(CacheConfig::default()));
        let k = key("broken");

        let leader = {
            let cache = cache.clone();
            let k = k.clone();
            tokio::spawn(async move {
                cache
                    .ensure(&k, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::compile("syntax error"))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = cache
            .ensure(&k, || async { Err(Error::Other("follower must not compile".into())) })
            .await;
        match follower {
            Err(Error::Compile(message)) => assert_eq!(message, "syntax error"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(leader.await.unwrap().is_err());
        assert!(cache.is_empty());

        let retried = cache.ensure(&k, || async { Ok(artifact(&k)) }).await;
        assert!(retried.is_ok());
        assert_eq!(cache.stats().failures, 1);
        assert_eq!(cache.stats().compiles, 1);
    }

    #[tokio::test]
    async fn cancelled_leader_hands_over_to_a_waiter() {
        let cache = Arc::new(CompileCache::new(CacheConfig::default()));
        let k = key("cancelled");

        let leader = {
            let cache = cache.clone();
            let k = k.clone();
            tokio::spawn(async move {
                cache
                    .ensure(&k, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(artifact(&k))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let cache = cache.clone();
            let k = k.clone();
            tokio::spawn(async move { cache.ensure(&k, || async { Ok(artifact(&k)) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter must not hang")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_recompiled() {
        let cache = CompileCache::new(
            CacheConfig::default().with_ttl(Some(Duration::from_millis(50))),
        );
        let k = key("ttl");
        let compiles = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .ensure(&k, || async {
                    compiles.fetch_add(1, Ordering::SeqCst);
                    Ok(artifact(&k))
                })
                .await
                .unwrap();
        }
        assert_eq!(compiles.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!cache.contains(&k));

        cache
            .ensure(&k, || async {
                compiles.fetch_add(1, Ordering::SeqCst);
                Ok(artifact(&k))
            })
            .await
            .unwrap();
        assert_eq!(compiles.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn least_recently_used_is_evicted_first() {
        let cache = CompileCache::new(CacheConfig::default().with_capacity(2));
        let (a, b, c) = (key("a"), key("b"), key("c"));

        cache.ensure(&a, || async { Ok(artifact(&a)) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.ensure(&b, || async { Ok(artifact(&b)) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Touch `a` so `b` becomes the least recently used.
        cache
            .ensure(&a, || async { Err(Error::Other("a is cached".into())) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.ensure(&c, || async { Ok(artifact(&c)) }).await.unwrap();

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn zero_capacity_stores_nothing() {
        let cache = CompileCache::new(CacheConfig::default().with_capacity(0));
        let k = key("nocache");
        let compiles = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .ensure(&k, || async {
                    compiles.fetch_add(1, Ordering::SeqCst);
                    Ok(artifact(&k))
                })
                .await
                .unwrap();
        }

        assert_eq!(compiles.load(Ordering::SeqCst), 3);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn evicted_artifact_stays_valid_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CompileCache::new(CacheConfig::default().with_capacity(1));
        let (a, b) = (key("held-a"), key("held-b"));

        let bundle = dir.path().join("a");
        std::fs::create_dir_all(&bundle).unwrap();
        let held = cache
            .ensure(&a, || async {
                Ok(CompiledArtifact::new(a.clone(), &bundle, bundle.join("index.js")).remove_on_drop())
            })
            .await
            .unwrap();

        cache.ensure(&b, || async { Ok(artifact(&b)) }).await.unwrap();
        assert!(!cache.contains(&a));
        assert!(held.bundle_dir().exists());

        drop(held);
        // Removal runs on the blocking pool.
        for _ in 0..50 {
            if !bundle.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!bundle.exists());
    }
}
