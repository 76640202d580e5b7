use crate::cache::floor::{FloorGuard, PollFloor};
use crate::cache::{CacheError, FailureObserver, Fetch, FetchError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryConfig {
    pub ttl: Duration,
    pub log_failures: bool,
}

impl EntryConfig {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            log_failures: true,
        }
    }

    pub fn log_failures(mut self, enabled: bool) -> Self {
        self.log_failures = enabled;
        self
    }
}

/// Outcome of asking an entry (or the registry) to refresh.
#[derive(Debug)]
pub enum Refresh {
    /// A fetch was launched; the handle resolves once its result is applied.
    Started(JoinHandle<()>),
    /// The cached value is still inside its TTL.
    Fresh,
    /// Another fetch for this entry has not finished yet.
    InFlight,
    /// The source-wide poll floor has not elapsed.
    Throttled,
}

impl Refresh {
    pub fn is_started(&self) -> bool {
        matches!(self, Refresh::Started(_))
    }

    /// Waits for a started fetch to be applied. Returns immediately otherwise.
    pub async fn wait(self) {
        if let Refresh::Started(handle) = self {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Refresh task did not complete");
            }
        }
    }
}

/// A consistent view of one entry at a single point in time.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub value: Option<Arc<T>>,
    pub fetched_at: Option<Instant>,
    pub updated_at: Option<DateTime<Utc>>,
    pub error: Option<FetchError>,
    pub error_at: Option<Instant>,
    pub in_flight: bool,
}

impl<T> Snapshot<T> {
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn data(&self) -> Option<&T> {
        self.value.as_deref()
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            fetched_at: self.fetched_at,
            updated_at: self.updated_at,
            error: self.error.clone(),
            error_at: self.error_at,
            in_flight: self.in_flight,
        }
    }
}

/// Type-erased description of an entry, used for listings and status output.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub key: String,
    pub ttl_secs: u64,
    pub present: bool,
    pub in_flight: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub fetch_count: u64,
    pub failure_count: u64,
}

/// Read-only view of an entry without knowing its value type.
pub trait PollEntry: Send + Sync {
    fn key(&self) -> &str;
    fn ttl(&self) -> Duration;
    fn value_type(&self) -> &'static str;
    fn has_data(&self) -> bool;
    fn is_in_flight(&self) -> bool;
    fn is_due(&self, now: Instant) -> bool;
    fn summary(&self) -> EntrySummary;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// What a refresh request is allowed to skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    /// Due entries only, gated by the source floor.
    Due,
    /// Due entries only. The caller already checked the floor for the whole burst.
    Burst,
    /// Ignores TTL and floor.
    Force,
}

/// Registry-side handle that can start fetches while holding the source floor.
pub(crate) trait RefreshEntry: PollEntry {
    fn start(
        self: Arc<Self>,
        now: Instant,
        trigger: Trigger,
        floor: &mut FloorGuard<'_>,
        runtime: &Handle,
    ) -> Refresh;

    fn as_poll_entry(self: Arc<Self>) -> Arc<dyn PollEntry>;
}

/// The configured runtime, or the one the caller is running on.
pub(crate) fn runtime_handle(configured: Option<&Handle>) -> Result<Handle, CacheError> {
    match configured {
        Some(handle) => Ok(handle.clone()),
        None => Handle::try_current().map_err(|_| CacheError::NoRuntime),
    }
}

struct EntryState<T> {
    value: Option<Arc<T>>,
    fetched_at: Option<Instant>,
    updated_at: Option<DateTime<Utc>>,
    in_flight: bool,
    last_error: Option<FetchError>,
    last_error_at: Option<Instant>,
    fetch_count: u64,
    failure_count: u64,
}

impl<T> Default for EntryState<T> {
    fn default() -> Self {
        Self {
            value: None,
            fetched_at: None,
            updated_at: None,
            in_flight: false,
            last_error: None,
            last_error_at: None,
            fetch_count: 0,
            failure_count: 0,
        }
    }
}

impl<T> EntryState<T> {
    fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        match self.fetched_at {
            Some(fetched_at) => now.saturating_duration_since(fetched_at) >= ttl,
            None => true,
        }
    }
}

/// One keyed cache slot.
///
/// All state lives behind a single mutex that is only held for bookkeeping,
/// never across the fetch itself, so a completed fetch is applied as one unit.
/// The entry shares its source's poll floor, so refreshes started through the
/// entry handle obey the same source-wide limit as those started by the registry.
pub struct CacheEntry<T> {
    key: String,
    config: EntryConfig,
    fetcher: Arc<dyn Fetch<T>>,
    observer: Arc<dyn FailureObserver>,
    floor: Arc<PollFloor>,
    runtime: Option<Handle>,
    state: Mutex<EntryState<T>>,
    generation: watch::Sender<u64>,
}

impl<T> CacheEntry<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(
        key: String,
        config: EntryConfig,
        fetcher: Arc<dyn Fetch<T>>,
        observer: Arc<dyn FailureObserver>,
        floor: Arc<PollFloor>,
        runtime: Option<Handle>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            key,
            config,
            fetcher,
            observer,
            floor,
            runtime,
            state: Mutex::new(EntryState::default()),
            generation,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> EntryConfig {
        self.config
    }

    /// Returns the cached value and error state. Never starts a fetch.
    pub fn current_value(&self) -> Snapshot<T> {
        let state = self.lock();
        Snapshot {
            value: state.value.clone(),
            fetched_at: state.fetched_at,
            updated_at: state.updated_at,
            error: state.last_error.clone(),
            error_at: state.last_error_at,
            in_flight: state.in_flight,
        }
    }

    pub fn data(&self) -> Option<Arc<T>> {
        self.lock().value.clone()
    }

    pub fn contains_data(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Due when nothing has ever been fetched or the last success is at least one TTL old.
    pub fn is_due(&self, now: Instant) -> bool {
        self.lock().is_stale(now, self.config.ttl)
    }

    /// Starts a background fetch if the entry is due, none is running and the
    /// source floor has elapsed.
    pub fn maybe_refresh(self: &Arc<Self>, now: Instant) -> Result<Refresh, CacheError> {
        self.trigger(now, Trigger::Due)
    }

    /// Starts a background fetch regardless of TTL and floor, unless one is
    /// already running. The attempt still counts against the floor.
    pub fn force_refresh(self: &Arc<Self>, now: Instant) -> Result<Refresh, CacheError> {
        self.trigger(now, Trigger::Force)
    }

    /// Watch channel bumped every time a fetch result is applied.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    fn trigger(self: &Arc<Self>, now: Instant, trigger: Trigger) -> Result<Refresh, CacheError> {
        let runtime = runtime_handle(self.runtime.as_ref())?;
        let mut floor = self.floor.lock();
        Ok(Arc::clone(self).begin(now, trigger, &mut floor, &runtime))
    }

    fn begin(
        self: Arc<Self>,
        now: Instant,
        trigger: Trigger,
        floor: &mut FloorGuard<'_>,
        runtime: &Handle,
    ) -> Refresh {
        {
            let mut state = self.lock();
            if state.in_flight {
                return Refresh::InFlight;
            }
            if trigger != Trigger::Force && !state.is_stale(now, self.config.ttl) {
                return Refresh::Fresh;
            }
            if trigger == Trigger::Due && !floor.allows(now) {
                tracing::debug!(key = %self.key, "Refresh throttled by poll floor");
                return Refresh::Throttled;
            }
            state.in_flight = true;
        }
        floor.claim(now);

        tracing::debug!(key = %self.key, ?trigger, "Starting cache refresh");
        Refresh::Started(runtime.spawn(async move {
            let fetcher = Arc::clone(&self.fetcher);
            // A panicking fetch must still release the in-flight flag.
            let result = tokio::spawn(async move { fetcher.fetch().await })
                .await
                .unwrap_or_else(|e| Err(FetchError::Aborted(e.to_string())));
            self.complete(now, result);
        }))
    }

    fn complete(&self, started_at: Instant, result: Result<T, FetchError>) {
        let failure = {
            let mut state = self.lock();
            state.in_flight = false;
            match result {
                Ok(value) => {
                    state.value = Some(Arc::new(value));
                    state.fetched_at = Some(started_at);
                    state.updated_at = Some(Utc::now());
                    state.last_error = None;
                    state.last_error_at = None;
                    state.fetch_count += 1;
                    None
                }
                Err(error) => {
                    state.last_error = Some(error.clone());
                    state.last_error_at = Some(started_at);
                    state.failure_count += 1;
                    Some((error, state.value.is_some()))
                }
            }
        };

        match failure {
            None => tracing::debug!(key = %self.key, "Cache refresh succeeded"),
            Some((error, has_stale_value)) if self.config.log_failures => {
                self.observer.on_failure(&self.key, &error, has_stale_value);
            }
            Some(_) => {}
        }

        self.generation.send_modify(|generation| *generation += 1);
    }

    fn lock(&self) -> MutexGuard<'_, EntryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for CacheEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T> PollEntry for CacheEntry<T>
where
    T: Send + Sync + 'static,
{
    fn key(&self) -> &str {
        &self.key
    }

    fn ttl(&self) -> Duration {
        self.config.ttl
    }

    fn value_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn has_data(&self) -> bool {
        self.contains_data()
    }

    fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    fn is_due(&self, now: Instant) -> bool {
        CacheEntry::is_due(self, now)
    }

    fn summary(&self) -> EntrySummary {
        let state = self.lock();
        EntrySummary {
            key: self.key.clone(),
            ttl_secs: self.config.ttl.as_secs(),
            present: state.value.is_some(),
            in_flight: state.in_flight,
            updated_at: state.updated_at,
            error: state.last_error.as_ref().map(ToString::to_string),
            fetch_count: state.fetch_count,
            failure_count: state.failure_count,
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T> RefreshEntry for CacheEntry<T>
where
    T: Send + Sync + 'static,
{
    fn start(
        self: Arc<Self>,
        now: Instant,
        trigger: Trigger,
        floor: &mut FloorGuard<'_>,
        runtime: &Handle,
    ) -> Refresh {
        self.begin(now, trigger, floor, runtime)
    }

    fn as_poll_entry(self: Arc<Self>) -> Arc<dyn PollEntry> {
        self
    }
}
