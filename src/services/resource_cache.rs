//! Process-wide cache of retrieval indices, one per grading theme.
//!
//! Builds are single-flight: every theme has its own async lock, and a caller
//! that loses the race re-checks the map after acquiring it. Writes to a
//! theme's examples hold the same lock, so an index built after a write was
//! acknowledged always reflects that write. Readers keep an `Arc` to the index
//! they were handed, so invalidation never changes an index mid-read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::repositories::{ExampleFilter, ExampleStore, NewExample};
use crate::resilience::{CircuitBreaker, PipelineError, RetryPolicy};
use crate::services::retrieval::{ContextSnippet, ThemeIndex};

/// Read-only view of a cached index.
#[derive(Debug, Clone)]
pub(crate) struct ThemeHandle {
    index: Arc<ThemeIndex>,
}

impl ThemeHandle {
    #[cfg(test)]
    pub(crate) fn theme(&self) -> &str {
        self.index.theme()
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn fingerprint(&self) -> &str {
        self.index.fingerprint()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, example_id: &str) -> bool {
        self.index.contains(example_id)
    }

    pub(crate) fn query(&self, submission: &str, k: usize) -> Vec<ContextSnippet> {
        self.index.query(submission, k)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub(crate) struct CacheStats {
    pub(crate) themes: usize,
    pub(crate) capacity: usize,
    pub(crate) builds: u64,
    pub(crate) hits: u64,
    pub(crate) misses: u64,
    pub(crate) evictions: u64,
}

struct CachedIndex {
    index: Arc<ThemeIndex>,
    last_used: AtomicU64,
}

#[derive(Default)]
struct Counters {
    builds: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

pub(crate) struct ResourceCache {
    store: Arc<dyn ExampleStore>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    capacity: usize,
    top_k: usize,
    entries: RwLock<HashMap<String, CachedIndex>>,
    build_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    clock: AtomicU64,
    counters: Counters,
}

/// Exclusive hold on one theme. Dropping it, including on cancellation,
/// releases the lock and forgets it once nobody else is waiting.
struct ThemeLock<'a> {
    cache: &'a ResourceCache,
    theme: String,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThemeLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.cache.build_locks.lock().unwrap_or_else(|err| err.into_inner());
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.theme);
        }
    }
}

impl ResourceCache {
    pub(crate) fn new(
        store: Arc<dyn ExampleStore>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        capacity: usize,
        top_k: usize,
    ) -> Self {
        Self {
            store,
            breaker,
            retry,
            capacity: capacity.max(1),
            top_k,
            entries: RwLock::new(HashMap::new()),
            build_locks: StdMutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Returns the theme's index, building it on first use.
    pub(crate) async fn get(&self, theme: &str) -> Result<ThemeHandle, PipelineError> {
        if let Some(handle) = self.lookup(theme).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rag_cache_hits_total").increment(1);
            return Ok(handle);
        }

        let _lock = self.lock_theme(theme).await;
        if let Some(handle) = self.lookup(theme).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rag_cache_hits_total").increment(1);
            return Ok(handle);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rag_cache_misses_total").increment(1);
        self.build(theme).await
    }

    /// Retrieval context for `submission` from the theme's index.
    pub(crate) async fn query(
        &self,
        theme: &str,
        submission: &str,
    ) -> Result<Vec<ContextSnippet>, PipelineError> {
        let handle = self.get(theme).await?;
        let snippets = handle.query(submission, self.top_k);
        tracing::debug!(
            theme,
            fingerprint = handle.fingerprint(),
            indexed = handle.len(),
            returned = snippets.len(),
            "Retrieval query served"
        );
        Ok(snippets)
    }

    /// Merges examples into the store and drops the cached index.
    pub(crate) async fn populate(
        &self,
        theme: &str,
        examples: &[NewExample],
    ) -> Result<u64, PipelineError> {
        let _lock = self.lock_theme(theme).await;
        let inserted = self.store.upsert(theme, examples).await?;
        self.invalidate(theme).await;
        tracing::info!(theme, submitted = examples.len(), inserted, "Examples populated");
        Ok(inserted)
    }

    /// Removes matching examples and drops the cached index.
    pub(crate) async fn delete(
        &self,
        theme: &str,
        filter: &ExampleFilter,
    ) -> Result<u64, PipelineError> {
        let _lock = self.lock_theme(theme).await;
        let removed = self.store.remove(theme, filter).await?;
        self.invalidate(theme).await;
        tracing::info!(
            theme,
            example_id = filter.example_id.as_deref(),
            language = filter.language.as_deref(),
            removed,
            "Examples deleted"
        );
        Ok(removed)
    }

    pub(crate) async fn stats(&self) -> CacheStats {
        let themes = self.entries.read().await.len();
        CacheStats {
            themes,
            capacity: self.capacity,
            builds: self.counters.builds.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    async fn lookup(&self, theme: &str) -> Option<ThemeHandle> {
        let entries = self.entries.read().await;
        let cached = entries.get(theme)?;
        cached.last_used.store(self.tick(), Ordering::Relaxed);
        Some(ThemeHandle { index: cached.index.clone() })
    }

    async fn build(&self, theme: &str) -> Result<ThemeHandle, PipelineError> {
        let examples = self
            .retry
            .run_guarded("retrieval_load", &self.breaker, || {
                let store = self.store.clone();
                let theme = theme.to_string();
                async move { store.list(&theme).await }
            })
            .await?;

        let index = Arc::new(ThemeIndex::build(theme, examples));
        self.counters.builds.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rag_cache_builds_total").increment(1);
        tracing::info!(
            theme = index.theme(),
            examples = index.len(),
            fingerprint = %index.fingerprint(),
            "Theme index built"
        );

        let mut entries = self.entries.write().await;
        if !entries.contains_key(theme) && entries.len() >= self.capacity {
            self.evict_least_recent(&mut entries);
        }
        entries.insert(
            theme.to_string(),
            CachedIndex { index: index.clone(), last_used: AtomicU64::new(self.tick()) },
        );

        Ok(ThemeHandle { index })
    }

    fn evict_least_recent(&self, entries: &mut HashMap<String, CachedIndex>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, cached)| cached.last_used.load(Ordering::Relaxed))
            .map(|(theme, _)| theme.clone());

        if let Some(theme) = oldest {
            entries.remove(&theme);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rag_cache_evictions_total").increment(1);
            tracing::debug!(theme = %theme, "Evicted least recently used theme index");
        }
    }

    async fn invalidate(&self, theme: &str) {
        if self.entries.write().await.remove(theme).is_some() {
            tracing::debug!(theme, "Theme index invalidated");
        }
    }

    async fn lock_theme(&self, theme: &str) -> ThemeLock<'_> {
        let lock = {
            let mut locks = self.build_locks.lock().unwrap_or_else(|err| err.into_inner());
            locks.entry(theme.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let mut held =
            ThemeLock { cache: self, theme: theme.to_string(), lock: lock.clone(), guard: None };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[cfg(test)]
    pub(crate) fn pending_build_locks(&self) -> usize {
        self.build_locks.lock().unwrap_or_else(|err| err.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::resilience::{BreakerConfig, CircuitState};
    use crate::test_support::{new_example, MemoryExampleStore};

    fn cache_with(store: Arc<MemoryExampleStore>, capacity: usize) -> ResourceCache {
        let breaker = Arc::new(CircuitBreaker::new(
            "retrieval",
            BreakerConfig { failure_threshold: 2, open_duration: Duration::from_secs(30) },
        ));
        let retry = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(50));
        ResourceCache::new(store, breaker, retry, capacity, 3)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_gets_share_one_build() {
        let store = Arc::new(MemoryExampleStore::default());
        store.seed("python_basics", vec![new_example("1", "print('hi')")]);
        store.set_delay(Duration::from_millis(200));
        let cache = Arc::new(cache_with(store.clone(), 4));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get("python_basics").await }));
        }
        for handle in handles {
            let index = handle.await.expect("join").expect("index");
            assert_eq!(index.len(), 1);
        }

        assert_eq!(store.list_calls(), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 15);
        assert_eq!(cache.pending_build_locks(), 0);
    }

    #[tokio::test]
    async fn populate_is_visible_to_the_next_get() {
        let store = Arc::new(MemoryExampleStore::default());
        let cache = cache_with(store.clone(), 4);

        let before = cache.get("python_basics").await.expect("cold index");
        assert_eq!(before.len(), 0);

        let inserted = cache
            .populate("python_basics", &[new_example("1", "x = [1, 2, 3]")])
            .await
            .expect("populate");
        assert_eq!(inserted, 1);

        let after = cache.get("python_basics").await.expect("rebuilt index");
        assert!(after.contains("1"));
        assert_ne!(before.fingerprint(), after.fingerprint());
        assert_eq!(before.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn populate_during_build_is_seen_by_the_next_get() {
        let store = Arc::new(MemoryExampleStore::default());
        store.set_delay(Duration::from_millis(200));
        let cache = Arc::new(cache_with(store.clone(), 4));

        let building = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get("python_basics").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.list_calls(), 1);

        let populating = tokio::spawn({
            let cache = cache.clone();
            async move { cache.populate("python_basics", &[new_example("1", "x = [1, 2, 3]")]).await }
        });

        let in_flight = building.await.expect("join").expect("index");
        assert_eq!(in_flight.len(), 0);
        assert_eq!(populating.await.expect("join").expect("populate"), 1);

        let after = cache.get("python_basics").await.expect("rebuilt index");
        assert!(after.contains("1"));
        assert_eq!(store.list_calls(), 2);
        assert_eq!(cache.pending_build_locks(), 0);
    }

    #[tokio::test]
    async fn repeated_populate_is_idempotent() {
        let store = Arc::new(MemoryExampleStore::default());
        let cache = cache_with(store.clone(), 4);
        let examples = vec![new_example("1", "print('Hello')"), new_example("2", "x = [1, 2, 3]")];

        assert_eq!(cache.populate("python_basics", &examples).await.unwrap(), 2);
        let first = cache.get("python_basics").await.unwrap();
        assert_eq!(cache.populate("python_basics", &examples).await.unwrap(), 0);
        let second = cache.get("python_basics").await.unwrap();

        assert_eq!(store.count("python_basics"), 2);
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[tokio::test]
    async fn delete_invalidates_with_filter() {
        let store = Arc::new(MemoryExampleStore::default());
        let cache = cache_with(store.clone(), 4);
        let mut java = new_example("2", "class Main {}");
        java.language = Some("java".to_string());
        cache.populate("oop", &[new_example("1", "class Main: pass"), java]).await.unwrap();
        assert_eq!(cache.get("oop").await.unwrap().len(), 2);

        let filter = ExampleFilter { example_id: None, language: Some("java".to_string()) };
        assert_eq!(cache.delete("oop", &filter).await.unwrap(), 1);

        let index = cache.get("oop").await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains("1"));
    }

    #[tokio::test]
    async fn least_recently_used_theme_is_evicted() {
        let store = Arc::new(MemoryExampleStore::default());
        let cache = cache_with(store.clone(), 2);

        cache.get("a").await.unwrap();
        cache.get("b").await.unwrap();
        cache.get("a").await.unwrap();
        cache.get("c").await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.themes, 2);
        assert_eq!(stats.evictions, 1);

        let loads = store.list_calls();
        cache.get("a").await.unwrap();
        assert_eq!(store.list_calls(), loads);
        cache.get("b").await.unwrap();
        assert_eq!(store.list_calls(), loads + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_build_releases_the_theme_lock() {
        let store = Arc::new(MemoryExampleStore::default());
        store.set_delay(Duration::from_secs(60));
        let cache = cache_with(store.clone(), 4);

        let timed_out = tokio::time::timeout(Duration::from_secs(1), cache.get("slow")).await;
        assert!(timed_out.is_err());
        assert_eq!(cache.pending_build_locks(), 0);

        store.set_delay(Duration::ZERO);
        let index = cache.get("slow").await.expect("index after cancellation");
        assert_eq!(index.theme(), "slow");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_store_opens_the_retrieval_breaker() {
        let store = Arc::new(MemoryExampleStore::default());
        store.fail_lists(usize::MAX);
        let cache = cache_with(store.clone(), 4);

        let first = cache.get("python_basics").await;
        assert!(matches!(first, Err(PipelineError::RetriesExhausted { .. })));
        assert_eq!(cache.breaker().state(), CircuitState::Open);

        let calls = store.list_calls();
        let second = cache.get("python_basics").await;
        assert!(matches!(second, Err(PipelineError::CircuitOpen { .. })));
        assert_eq!(store.list_calls(), calls);
    }
}
