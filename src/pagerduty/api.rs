use crate::cache::{
    CacheEntry, CacheError, EntryConfig, EntrySummary, MonitorStatus, PollCache, PollReport,
    StatusRollup,
};
use crate::core::settings::PollingSettings;
use crate::pagerduty::models::{
    Incident, IncidentsResponse, OnCall, OnCallsResponse, PagerDutyPerson, Schedule,
    SchedulesResponse, UsersResponse,
};
use crate::pagerduty::PagerDutyClient;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const SOURCE_NAME: &str = "PagerDutyAPI";
pub const MIN_SECONDS_BETWEEN_POLLS: u64 = 3600;
const CACHE_PREFIX: &str = "PagerDuty - API: ";

const USERS_PATH: &str = "users/";
const ONCALLS_PATH: &str = "oncalls";
const INCIDENTS_PATH: &str = "incidents?statuses[]=triggered&statuses[]=acknowledged";
const SCHEDULES_PATH: &str = "schedules";

/// The PagerDuty data source: one poll cache holding every PagerDuty dataset.
pub struct PagerDutyApi {
    cache: PollCache,
    all_users: Arc<CacheEntry<Vec<PagerDutyPerson>>>,
    on_call_users: Arc<CacheEntry<Vec<OnCall>>>,
    incidents: Arc<CacheEntry<Vec<Incident>>>,
    all_schedules: Arc<CacheEntry<Vec<Schedule>>>,
}

impl PagerDutyApi {
    pub fn new(client: PagerDutyClient, polling: &PollingSettings) -> Result<Self, CacheError> {
        Self::with_cache(
            client,
            PollCache::new(SOURCE_NAME, polling.min_between_polls()),
            polling.cache_duration(),
        )
    }

    pub fn with_cache(
        client: PagerDutyClient,
        cache: PollCache,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        let client = Arc::new(client);

        let all_users = register(
            &cache,
            &client,
            "AllUsers",
            ttl,
            USERS_PATH,
            |r: UsersResponse| r.users,
        )?;
        let on_call_users = register(
            &cache,
            &client,
            "OnCallUsers",
            ttl,
            ONCALLS_PATH,
            |r: OnCallsResponse| r.oncalls,
        )?;
        let incidents = register(
            &cache,
            &client,
            "Incidents",
            ttl,
            INCIDENTS_PATH,
            |r: IncidentsResponse| r.incidents,
        )?;
        let all_schedules = register(
            &cache,
            &client,
            "AllSchedules",
            ttl,
            SCHEDULES_PATH,
            |r: SchedulesResponse| r.schedules,
        )?;

        Ok(Self {
            cache,
            all_users,
            on_call_users,
            incidents,
            all_schedules,
        })
    }

    pub fn cache(&self) -> &PollCache {
        &self.cache
    }

    pub fn all_users(&self) -> &Arc<CacheEntry<Vec<PagerDutyPerson>>> {
        &self.all_users
    }

    pub fn on_call_users(&self) -> &Arc<CacheEntry<Vec<OnCall>>> {
        &self.on_call_users
    }

    pub fn incidents(&self) -> &Arc<CacheEntry<Vec<Incident>>> {
        &self.incidents
    }

    pub fn all_schedules(&self) -> &Arc<CacheEntry<Vec<Schedule>>> {
        &self.all_schedules
    }

    pub fn get_schedule(&self, id: &str) -> Option<Schedule> {
        self.all_schedules
            .data()?
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn get_person(&self, id: &str) -> Option<PagerDutyPerson> {
        self.all_users
            .data()?
            .iter()
            .find(|u| u.id == id)
            .cloned()
    }

    /// Current on-call slots, primary escalation level first.
    pub fn on_call_schedule(&self) -> Vec<OnCall> {
        let mut schedule = self
            .on_call_users
            .data()
            .map(|oncalls| oncalls.as_ref().clone())
            .unwrap_or_default();
        schedule.sort_by(|a, b| {
            a.escalation_level
                .cmp(&b.escalation_level)
                .then_with(|| a.start.cmp(&b.start))
        });
        schedule
    }

    /// Worst status across on-call coverage and open incidents.
    ///
    /// Datasets that have never been fetched are ignored, so a source with no
    /// data at all reports `Good` unless `require_data` is set.
    pub fn monitor_status(&self, require_data: bool) -> MonitorStatus {
        StatusRollup::new()
            .require_data(require_data)
            .entry(&self.on_call_users, |oncalls| {
                MonitorStatus::worst(oncalls.iter().map(OnCall::monitor_status))
                    .unwrap_or_default()
            })
            .entry(&self.incidents, |incidents| {
                MonitorStatus::worst(incidents.iter().map(Incident::monitor_status))
                    .unwrap_or_default()
            })
            .finish()
    }

    pub fn summaries(&self) -> Vec<EntrySummary> {
        self.cache.entries().iter().map(|e| e.summary()).collect()
    }

    pub fn poll(&self, now: Instant) -> Result<PollReport, CacheError> {
        self.cache.poll(now)
    }

    pub fn refresh_all(&self, now: Instant) -> Result<PollReport, CacheError> {
        self.cache.force_refresh_all(now)
    }
}

fn register<T, R>(
    cache: &PollCache,
    client: &Arc<PagerDutyClient>,
    name: &str,
    ttl: Duration,
    path: &'static str,
    extract: fn(R) -> T,
) -> Result<Arc<CacheEntry<T>>, CacheError>
where
    T: Send + Sync + 'static,
    R: DeserializeOwned + Send + 'static,
{
    let client = Arc::clone(client);
    cache.get_or_create(
        format!("{CACHE_PREFIX}{name}"),
        EntryConfig::new(ttl),
        move || {
            let client = Arc::clone(&client);
            async move { client.get::<R>(path).await.map(extract) }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HOUR: Duration = Duration::from_secs(3600);

    async fn mount(server: &MockServer, route: &str, status: u16, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    fn api_for(server: &MockServer) -> PagerDutyApi {
        let client = PagerDutyClient::with_base_url("test_key", server.uri()).unwrap();
        PagerDutyApi::with_cache(client, PollCache::new(SOURCE_NAME, HOUR), HOUR).unwrap()
    }

    #[tokio::test]
    async fn test_registers_named_caches() {
        let server = MockServer::start().await;
        let api = api_for(&server);

        assert_eq!(
            api.cache().entry_keys(),
            vec![
                "PagerDuty - API: AllSchedules",
                "PagerDuty - API: AllUsers",
                "PagerDuty - API: Incidents",
                "PagerDuty - API: OnCallUsers",
            ]
        );
        assert_eq!(api.monitor_status(false), MonitorStatus::Good);
        assert_eq!(api.monitor_status(true), MonitorStatus::Unknown);
    }

    #[tokio::test]
    async fn test_poll_populates_all_caches() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/users/",
            200,
            json!({"users": [{"id": "P1", "name": "Ada"}, {"id": "P2", "name": "Grace"}]}),
        )
        .await;
        mount(
            &server,
            "/oncalls",
            200,
            json!({"oncalls": [
                {"user": {"id": "P2"}, "escalation_level": 2},
                {"user": {"id": "P1"}, "escalation_level": 1}
            ]}),
        )
        .await;
        mount(
            &server,
            "/incidents",
            200,
            json!({"incidents": [{"id": "I1", "status": "acknowledged"}]}),
        )
        .await;
        mount(
            &server,
            "/schedules",
            200,
            json!({"schedules": [{"id": "S1", "name": "Primary", "users": [{"id": "P1"}]}]}),
        )
        .await;

        let api = api_for(&server);
        let report = api.poll(Instant::now()).unwrap();
        assert_eq!(report.started.len(), 4);
        report.wait().await;

        assert_eq!(api.get_person("P2").map(|p| p.name), Some("Grace".to_string()));
        assert_eq!(
            api.get_schedule("S1").map(|s| s.display_name().to_string()),
            Some("Primary".to_string())
        );
        assert!(api.get_schedule("S9").is_none());
        assert!(api.get_person("P9").is_none());

        let schedule = api.on_call_schedule();
        assert_eq!(schedule[0].user.as_ref().map(|u| u.id.as_str()), Some("P1"));
        assert_eq!(api.monitor_status(true), MonitorStatus::Warning);
        assert!(api.summaries().iter().all(|s| s.present && s.error.is_none()));
    }

    #[tokio::test]
    async fn test_triggered_incident_is_critical() {
        let server = MockServer::start().await;
        mount(&server, "/users/", 200, json!({"users": []})).await;
        mount(&server, "/oncalls", 200, json!({"oncalls": []})).await;
        mount(
            &server,
            "/incidents",
            200,
            json!({"incidents": [
                {"id": "I1", "status": "acknowledged"},
                {"id": "I2", "status": "triggered"}
            ]}),
        )
        .await;

        let api = api_for(&server);
        api.refresh_all(Instant::now()).unwrap().wait().await;

        assert_eq!(api.monitor_status(false), MonitorStatus::Critical);
    }

    #[tokio::test]
    async fn test_failed_dataset_is_isolated() {
        let server = MockServer::start().await;
        mount(&server, "/users/", 500, json!({"error": "boom"})).await;
        mount(&server, "/oncalls", 200, json!({"oncalls": [{"user": {"id": "P1"}}]})).await;
        mount(&server, "/incidents", 200, json!({"incidents": []})).await;

        let api = api_for(&server);
        api.poll(Instant::now()).unwrap().wait().await;

        let users = api.all_users().current_value();
        assert!(!users.is_present());
        assert!(matches!(
            users.error,
            Some(crate::cache::FetchError::Status { status: 500, .. })
        ));
        assert!(api.get_person("P1").is_none());
        assert_eq!(api.monitor_status(true), MonitorStatus::Good);
    }

    #[tokio::test]
    async fn test_second_poll_within_floor_is_throttled() {
        let server = MockServer::start().await;
        mount(&server, "/users/", 500, json!({})).await;
        mount(&server, "/oncalls", 200, json!({"oncalls": []})).await;
        mount(&server, "/incidents", 200, json!({"incidents": []})).await;

        let api = api_for(&server);
        let t0 = Instant::now();
        api.poll(t0).unwrap().wait().await;

        // Users failed and is still due, but the source floor holds it back.
        let report = api.poll(t0 + Duration::from_secs(60)).unwrap();
        assert!(report.throttled);
        assert!(report.is_idle());
    }
}
