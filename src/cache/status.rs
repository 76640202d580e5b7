use crate::cache::CacheEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Health signal, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    #[default]
    Good,
    Unknown,
    Warning,
    Critical,
}

impl MonitorStatus {
    /// Most severe status in `statuses`, or `None` if it is empty.
    pub fn worst<I>(statuses: I) -> Option<MonitorStatus>
    where
        I: IntoIterator<Item = MonitorStatus>,
    {
        statuses.into_iter().max()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorStatus::Good => "good",
            MonitorStatus::Unknown => "unknown",
            MonitorStatus::Warning => "warning",
            MonitorStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folds the current values of several entries into one status.
///
/// Entries without data are skipped. When nothing had data the result is
/// `Good`, or `Unknown` if [`StatusRollup::require_data`] was set.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatusRollup {
    worst: Option<MonitorStatus>,
    require_data: bool,
}

impl StatusRollup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_data(mut self, required: bool) -> Self {
        self.require_data = required;
        self
    }

    pub fn entry<T, F>(self, entry: &CacheEntry<T>, classify: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> MonitorStatus,
    {
        match entry.data() {
            Some(value) => self.observe(classify(&value)),
            None => self,
        }
    }

    pub fn observe(mut self, status: MonitorStatus) -> Self {
        self.worst = Some(self.worst.map_or(status, |worst| worst.max(status)));
        self
    }

    pub fn finish(self) -> MonitorStatus {
        match self.worst {
            Some(status) => status,
            None if self.require_data => MonitorStatus::Unknown,
            None => MonitorStatus::Good,
        }
    }
}

/// Rollup over entries sharing one value type.
pub fn overall_status<T, F>(
    entries: &[Arc<CacheEntry<T>>],
    classify: F,
    require_data: bool,
) -> MonitorStatus
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> MonitorStatus,
{
    entries
        .iter()
        .fold(
            StatusRollup::new().require_data(require_data),
            |rollup, entry| rollup.entry(entry, &classify),
        )
        .finish()
}
