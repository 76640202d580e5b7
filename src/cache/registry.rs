use crate::cache::entry::{runtime_handle, RefreshEntry, Trigger};
use crate::cache::floor::{FloorGuard, PollFloor};
use crate::cache::{
    CacheEntry, CacheError, EntryConfig, FailureObserver, Fetch, PollEntry, Refresh,
    TracingObserver,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Result of one call burst against the source.
#[derive(Debug, Default)]
pub struct PollReport {
    pub started: Vec<String>,
    pub throttled: bool,
    handles: Vec<JoinHandle<()>>,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.started.is_empty()
    }

    /// Waits until every fetch started by this burst has been applied.
    pub async fn wait(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Refresh task did not complete");
            }
        }
    }
}

/// Registry of cache entries belonging to one upstream source.
///
/// Entries are added through [`PollCache::get_or_create`] and never removed.
/// Besides each entry's own TTL, the registry enforces a source-wide floor:
/// no new call burst starts until `min_between_polls` has passed since the
/// previous one, whatever the individual TTLs say. Entries share the floor,
/// so refreshing through an entry handle is limited the same way.
///
/// Refreshes run on the runtime captured when the cache was built, falling
/// back to the caller's runtime. Without either, refresh calls return
/// [`CacheError::NoRuntime`].
pub struct PollCache {
    name: String,
    observer: Arc<dyn FailureObserver>,
    runtime: Option<Handle>,
    floor: Arc<PollFloor>,
    entries: RwLock<HashMap<String, Arc<dyn RefreshEntry>>>,
}

impl PollCache {
    pub fn new(name: impl Into<String>, min_between_polls: Duration) -> Self {
        Self {
            name: name.into(),
            observer: Arc::new(TracingObserver),
            runtime: Handle::try_current().ok(),
            floor: Arc::new(PollFloor::new(min_between_polls)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Observer handed to entries created after this call.
    pub fn with_observer(mut self, observer: Arc<dyn FailureObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Runtime used for refreshes of this cache and of entries created after this call.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_between_polls(&self) -> Duration {
        self.floor.min_between_polls()
    }

    /// Returns the entry for `key`, creating it with `fetch` if it does not exist.
    ///
    /// The first registration wins. Registering the same key again with a
    /// different TTL or value type is rejected instead of silently ignored.
    pub fn get_or_create<T, F>(
        &self,
        key: impl Into<String>,
        config: EntryConfig,
        fetch: F,
    ) -> Result<Arc<CacheEntry<T>>, CacheError>
    where
        T: Send + Sync + 'static,
        F: Fetch<T> + 'static,
    {
        let key = key.into();

        if let Some(existing) = self.read_entries().get(&key) {
            return Self::reuse(&key, existing, config);
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&key) {
            return Self::reuse(&key, existing, config);
        }

        let entry = Arc::new(CacheEntry::new(
            key.clone(),
            config,
            Arc::new(fetch),
            Arc::clone(&self.observer),
            Arc::clone(&self.floor),
            self.runtime.clone(),
        ));
        entries.insert(key, Arc::clone(&entry) as Arc<dyn RefreshEntry>);
        tracing::debug!(
            source = %self.name,
            key = %entry.key(),
            ttl_secs = config.ttl.as_secs(),
            "Registered cache entry"
        );

        Ok(entry)
    }

    fn reuse<T>(
        key: &str,
        existing: &Arc<dyn RefreshEntry>,
        config: EntryConfig,
    ) -> Result<Arc<CacheEntry<T>>, CacheError>
    where
        T: Send + Sync + 'static,
    {
        if existing.ttl() != config.ttl {
            return Err(CacheError::Conflict {
                key: key.to_string(),
                reason: format!(
                    "registered with ttl {:?}, requested {:?}",
                    existing.ttl(),
                    config.ttl
                ),
            });
        }

        let existing_type = existing.value_type();
        Arc::clone(existing)
            .into_any()
            .downcast::<CacheEntry<T>>()
            .map_err(|_| CacheError::Conflict {
                key: key.to_string(),
                reason: format!(
                    "holds {}, requested {}",
                    existing_type,
                    std::any::type_name::<T>()
                ),
            })
    }

    /// Typed lookup of an existing entry.
    pub fn get<T>(&self, key: &str) -> Option<Arc<CacheEntry<T>>>
    where
        T: Send + Sync + 'static,
    {
        let entry = Arc::clone(self.read_entries().get(key)?);
        entry.into_any().downcast::<CacheEntry<T>>().ok()
    }

    /// All entries, ordered by key.
    pub fn entries(&self) -> Vec<Arc<dyn PollEntry>> {
        self.sorted_entries()
            .into_iter()
            .map(|e| e.as_poll_entry())
            .collect()
    }

    pub fn entries_with_data(&self) -> Vec<Arc<dyn PollEntry>> {
        self.entries().into_iter().filter(|e| e.has_data()).collect()
    }

    pub fn entry_keys(&self) -> Vec<String> {
        self.sorted_entries()
            .iter()
            .map(|e| e.key().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_poll_attempt(&self) -> Option<Instant> {
        self.floor.last_attempt()
    }

    /// Earliest instant at which the floor allows another call burst.
    pub fn next_poll_at(&self) -> Option<Instant> {
        self.floor.next_at()
    }

    /// Refreshes one entry if it is due, not in flight, and the source floor allows it.
    pub fn maybe_refresh(&self, key: &str, now: Instant) -> Result<Refresh, CacheError> {
        let entry = self.lookup(key)?;
        let runtime = runtime_handle(self.runtime.as_ref())?;
        let mut floor = self.floor.lock();
        Ok(entry.start(now, Trigger::Due, &mut floor, &runtime))
    }

    /// Starts every due entry in a single burst, if the source floor allows it.
    pub fn poll(&self, now: Instant) -> Result<PollReport, CacheError> {
        let due: Vec<_> = self
            .sorted_entries()
            .into_iter()
            .filter(|e| !e.is_in_flight() && e.is_due(now))
            .collect();
        if due.is_empty() {
            return Ok(PollReport::default());
        }

        let runtime = runtime_handle(self.runtime.as_ref())?;
        let mut floor = self.floor.lock();
        if !floor.allows(now) {
            tracing::debug!(
                source = %self.name,
                due = due.len(),
                "Poll throttled by poll floor"
            );
            return Ok(PollReport {
                throttled: true,
                ..PollReport::default()
            });
        }

        let report = Self::start_all(due, now, Trigger::Burst, &mut floor, &runtime);
        if !report.is_idle() {
            tracing::info!(
                source = %self.name,
                entries = ?report.started,
                "Polling source"
            );
        }
        Ok(report)
    }

    /// Refreshes one entry now, ignoring its TTL and the poll floor.
    pub fn force_refresh(&self, key: &str, now: Instant) -> Result<Refresh, CacheError> {
        let entry = self.lookup(key)?;
        let runtime = runtime_handle(self.runtime.as_ref())?;
        let mut floor = self.floor.lock();
        Ok(entry.start(now, Trigger::Force, &mut floor, &runtime))
    }

    /// Refreshes every entry that is not already in flight.
    pub fn force_refresh_all(&self, now: Instant) -> Result<PollReport, CacheError> {
        let entries = self.sorted_entries();
        let runtime = runtime_handle(self.runtime.as_ref())?;
        let mut floor = self.floor.lock();

        Ok(Self::start_all(entries, now, Trigger::Force, &mut floor, &runtime))
    }

    fn start_all(
        entries: Vec<Arc<dyn RefreshEntry>>,
        now: Instant,
        trigger: Trigger,
        floor: &mut FloorGuard<'_>,
        runtime: &Handle,
    ) -> PollReport {
        let mut report = PollReport::default();
        for entry in entries {
            let key = entry.key().to_string();
            if let Refresh::Started(handle) = entry.start(now, trigger, floor, runtime) {
                report.started.push(key);
                report.handles.push(handle);
            }
        }
        report
    }

    fn sorted_entries(&self) -> Vec<Arc<dyn RefreshEntry>> {
        let mut entries: Vec<_> = self.read_entries().values().cloned().collect();
        entries.sort_by(|a, b| a.key().cmp(b.key()));
        entries
    }

    fn lookup(&self, key: &str) -> Result<Arc<dyn RefreshEntry>, CacheError> {
        self.read_entries()
            .get(key)
            .cloned()
            .ok_or_else(|| CacheError::UnknownKey(key.to_string()))
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn RefreshEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FetchError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    struct Counting {
        value: u32,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Fetch<u32> for Counting {
        async fn fetch(&self) -> Result<u32, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.value)
        }
    }

    fn counting(value: u32) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = Counting {
            value,
            calls: Arc::clone(&calls),
        };
        (fetch, calls)
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing_entry() {
        let cache = PollCache::new("test", HOUR);
        let (first, first_calls) = counting(1);
        let (second, second_calls) = counting(2);

        let a = cache.get_or_create("users", EntryConfig::new(HOUR), first).unwrap();
        let b = cache.get_or_create("users", EntryConfig::new(HOUR), second).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.maybe_refresh("users", Instant::now()).unwrap().wait().await;
        assert_eq!(b.data().as_deref(), Some(&1));
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_get_or_create_rejects_different_ttl() {
        let cache = PollCache::new("test", HOUR);
        let (fetch, _) = counting(1);
        cache.get_or_create("users", EntryConfig::new(HOUR), fetch).unwrap();

        let (fetch, _) = counting(1);
        let err = cache
            .get_or_create("users", EntryConfig::new(MINUTE), fetch)
            .unwrap_err();
        assert!(matches!(err, CacheError::Conflict { ref key, .. } if key == "users"));
    }

    #[tokio::test]
    async fn test_get_or_create_rejects_different_type() {
        let cache = PollCache::new("test", HOUR);
        let (fetch, _) = counting(1);
        cache.get_or_create("users", EntryConfig::new(HOUR), fetch).unwrap();

        let result = cache.get_or_create("users", EntryConfig::new(HOUR), || async {
            Ok::<_, FetchError>("text".to_string())
        });
        assert!(matches!(result, Err(CacheError::Conflict { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_yields_one_entry() {
        let cache = Arc::new(PollCache::new("test", HOUR));

        let mut tasks = Vec::new();
        for i in 0..16u32 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                let (fetch, _) = counting(i);
                cache
                    .get_or_create("shared", EntryConfig::new(HOUR), fetch)
                    .unwrap()
            }));
        }

        let mut entries = Vec::new();
        for task in tasks {
            entries.push(task.await.unwrap());
        }
        assert_eq!(cache.len(), 1);
        assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let cache = PollCache::new("test", HOUR);
        let err = cache.maybe_refresh("missing", Instant::now()).unwrap_err();
        assert!(matches!(err, CacheError::UnknownKey(ref key) if key == "missing"));
        assert!(cache.get::<u32>("missing").is_none());
    }

    #[tokio::test]
    async fn test_typed_lookup() {
        let cache = PollCache::new("test", HOUR);
        let (fetch, _) = counting(4);
        let entry = cache.get_or_create("n", EntryConfig::new(HOUR), fetch).unwrap();

        assert!(Arc::ptr_eq(&cache.get::<u32>("n").unwrap(), &entry));
        assert!(cache.get::<String>("n").is_none());
    }

    #[tokio::test]
    async fn test_floor_blocks_second_entry() {
        let cache = PollCache::new("test", HOUR);
        let (a, a_calls) = counting(1);
        let (b, b_calls) = counting(2);
        cache.get_or_create("a", EntryConfig::new(MINUTE), a).unwrap();
        cache.get_or_create("b", EntryConfig::new(MINUTE), b).unwrap();
        let t0 = Instant::now();

        cache.maybe_refresh("a", t0).unwrap().wait().await;
        let second = cache.maybe_refresh("b", t0 + Duration::from_secs(10)).unwrap();
        assert!(matches!(second, Refresh::Throttled));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 0);

        let later = cache.maybe_refresh("b", t0 + HOUR).unwrap();
        assert!(later.is_started());
        later.wait().await;
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_floor_wins_over_shorter_ttl() {
        let cache = PollCache::new("test", HOUR);
        let (fetch, calls) = counting(1);
        cache.get_or_create("fast", EntryConfig::new(MINUTE), fetch).unwrap();
        let t0 = Instant::now();

        cache.poll(t0).unwrap().wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Entry TTL has expired, the source floor has not.
        let report = cache.poll(t0 + MINUTE * 5).unwrap();
        assert!(report.throttled);
        assert!(report.is_idle());
        assert!(matches!(
            cache.maybe_refresh("fast", t0 + MINUTE * 5).unwrap(),
            Refresh::Throttled
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.poll(t0 + HOUR).unwrap().wait().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_starts_all_due_entries_in_one_burst() {
        let cache = PollCache::new("test", HOUR);
        let (a, a_calls) = counting(1);
        let (b, b_calls) = counting(2);
        cache.get_or_create("a", EntryConfig::new(HOUR), a).unwrap();
        cache.get_or_create("b", EntryConfig::new(HOUR), b).unwrap();
        let t0 = Instant::now();

        let report = cache.poll(t0).unwrap();
        assert_eq!(report.started, vec!["a".to_string(), "b".to_string()]);
        assert!(!report.throttled);
        report.wait().await;

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.last_poll_attempt(), Some(t0));
        assert_eq!(cache.next_poll_at(), Some(t0 + HOUR));
        assert_eq!(cache.entries_with_data().len(), 2);
    }

    #[tokio::test]
    async fn test_fresh_entries_do_not_claim_floor() {
        let cache = PollCache::new("test", HOUR);
        let (a, _) = counting(1);
        cache.get_or_create("a", EntryConfig::new(HOUR * 2), a).unwrap();
        let t0 = Instant::now();

        cache.poll(t0).unwrap().wait().await;
        let report = cache.poll(t0 + HOUR).unwrap();
        assert!(report.is_idle());
        assert!(!report.throttled);
        assert_eq!(cache.last_poll_attempt(), Some(t0));
    }

    #[tokio::test]
    async fn test_failed_attempt_still_counts_against_floor() {
        let cache = PollCache::new("test", HOUR);
        cache
            .get_or_create("a", EntryConfig::new(MINUTE).log_failures(false), || async {
                Err::<u32, _>(FetchError::other("down"))
            })
            .unwrap();
        let t0 = Instant::now();

        cache.poll(t0).unwrap().wait().await;
        assert!(cache.poll(t0 + MINUTE).unwrap().throttled);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_ttl_and_floor() {
        let cache = PollCache::new("test", HOUR);
        let (fetch, calls) = counting(1);
        cache.get_or_create("a", EntryConfig::new(HOUR), fetch).unwrap();
        let t0 = Instant::now();

        cache.poll(t0).unwrap().wait().await;
        cache
            .force_refresh("a", t0 + MINUTE)
            .unwrap()
            .wait()
            .await;
        cache.force_refresh_all(t0 + MINUTE * 2).unwrap().wait().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.last_poll_attempt(), Some(t0 + MINUTE * 2));
    }

    #[tokio::test]
    async fn test_entry_handles_share_the_floor() {
        let cache = PollCache::new("test", HOUR);
        let (a_fetch, a_calls) = counting(1);
        let (b_fetch, b_calls) = counting(2);
        let a = cache.get_or_create("a", EntryConfig::new(MINUTE), a_fetch).unwrap();
        let b = cache.get_or_create("b", EntryConfig::new(MINUTE), b_fetch).unwrap();
        let t0 = Instant::now();

        cache.poll(t0).unwrap().wait().await;

        // Both TTLs have expired, the source floor has not.
        let at = |secs: u64| t0 + Duration::from_secs(secs);
        assert!(matches!(a.maybe_refresh(at(120)).unwrap(), Refresh::Throttled));
        assert!(matches!(b.maybe_refresh(at(121)).unwrap(), Refresh::Throttled));
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.last_poll_attempt(), Some(t0));

        // A refresh through the entry claims the floor for the whole source.
        a.maybe_refresh(t0 + HOUR).unwrap().wait().await;
        assert_eq!(cache.last_poll_attempt(), Some(t0 + HOUR));
        assert!(cache.poll(t0 + HOUR + MINUTE).unwrap().throttled);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_floor_never_moves_backwards() {
        let cache = PollCache::new("test", HOUR);
        let (fetch, calls) = counting(1);
        let entry = cache.get_or_create("a", EntryConfig::new(HOUR), fetch).unwrap();
        let t0 = Instant::now();

        cache.force_refresh_all(t0 + MINUTE * 2).unwrap().wait().await;
        cache.force_refresh("a", t0 + MINUTE).unwrap().wait().await;
        entry.force_refresh(t0).unwrap().wait().await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.last_poll_attempt(), Some(t0 + MINUTE * 2));
    }

    #[test]
    fn test_refresh_without_runtime_is_an_error() {
        let cache = PollCache::new("test", HOUR);
        let (fetch, calls) = counting(1);
        let entry = cache.get_or_create("a", EntryConfig::new(HOUR), fetch).unwrap();
        let now = Instant::now();

        assert!(matches!(cache.poll(now), Err(CacheError::NoRuntime)));
        assert!(matches!(cache.maybe_refresh("a", now), Err(CacheError::NoRuntime)));
        assert!(matches!(cache.force_refresh_all(now), Err(CacheError::NoRuntime)));
        assert!(matches!(entry.maybe_refresh(now), Err(CacheError::NoRuntime)));

        assert!(!entry.current_value().in_flight);
        assert!(cache.last_poll_attempt().is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_configured_runtime_runs_refreshes_from_plain_threads() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let cache = PollCache::new("test", HOUR).with_runtime(runtime.handle().clone());
        let (fetch, calls) = counting(7);
        let entry = cache.get_or_create("a", EntryConfig::new(HOUR), fetch).unwrap();

        let report = cache.poll(Instant::now()).unwrap();
        assert_eq!(report.started, vec!["a".to_string()]);
        runtime.block_on(report.wait());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(entry.data().as_deref(), Some(&7));
    }

    #[tokio::test]
    async fn test_entries_sorted_by_key() {
        let cache = PollCache::new("test", HOUR);
        for key in ["c", "a", "b"] {
            let (fetch, _) = counting(0);
            cache.get_or_create(key, EntryConfig::new(HOUR), fetch).unwrap();
        }
        assert_eq!(cache.entry_keys(), vec!["a", "b", "c"]);
        assert!(cache.entries_with_data().is_empty());
    }
}
