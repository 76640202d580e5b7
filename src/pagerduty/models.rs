use crate::cache::MonitorStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagerDutyPerson {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Reference to another PagerDuty object (user, schedule, escalation policy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Triggered,
    Acknowledged,
    Resolved,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    #[serde(default)]
    pub incident_number: Option<u64>,
    #[serde(default)]
    pub title: String,
    pub status: IncidentStatus,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl Incident {
    pub fn monitor_status(&self) -> MonitorStatus {
        match self.status {
            IncidentStatus::Triggered => MonitorStatus::Critical,
            IncidentStatus::Acknowledged => MonitorStatus::Warning,
            IncidentStatus::Resolved => MonitorStatus::Good,
            IncidentStatus::Other => MonitorStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnCall {
    #[serde(default)]
    pub user: Option<Reference>,
    #[serde(default)]
    pub schedule: Option<Reference>,
    #[serde(default = "default_escalation_level")]
    pub escalation_level: u32,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

fn default_escalation_level() -> u32 {
    1
}

impl OnCall {
    /// An on-call slot nobody fills is worth a warning.
    pub fn monitor_status(&self) -> MonitorStatus {
        match self.user {
            Some(_) => MonitorStatus::Good,
            None => MonitorStatus::Warning,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub users: Vec<Reference>,
}

impl Schedule {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.summary.as_deref().unwrap_or(&self.id)
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UsersResponse {
    #[serde(default)]
    pub users: Vec<PagerDutyPerson>,
}

#[derive(Debug, Deserialize)]
pub struct IncidentsResponse {
    #[serde(default)]
    pub incidents: Vec<Incident>,
}

#[derive(Debug, Deserialize)]
pub struct OnCallsResponse {
    #[serde(default)]
    pub oncalls: Vec<OnCall>,
}

#[derive(Debug, Deserialize)]
pub struct SchedulesResponse {
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}
