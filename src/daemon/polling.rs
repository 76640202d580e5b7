use oncall_watch::cache::MonitorStatus;
use oncall_watch::pagerduty::PagerDutyApi;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Drives the PagerDuty source: asks the cache to poll on every tick and logs
/// overall status transitions. The cache decides whether a tick turns into
/// upstream calls.
pub struct PollingLoop {
    api: Arc<PagerDutyApi>,
    check_interval: Duration,
    last_status: Option<MonitorStatus>,
}

impl PollingLoop {
    pub fn new(api: Arc<PagerDutyApi>, check_interval: Duration) -> Self {
        Self {
            api,
            check_interval,
            last_status: None,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Polling loop started (interval: {:?})", self.check_interval);

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            self.tick(Instant::now());
        }
    }

    /// Runs one check. Returns the overall status when it differs from the last check.
    pub fn tick(&mut self, now: Instant) -> Option<MonitorStatus> {
        match self.api.poll(now) {
            Ok(report) if !report.is_idle() => {
                tracing::debug!(started = ?report.started, "Refreshes started");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Poll failed"),
        }

        let status = self.api.monitor_status(false);
        if self.last_status == Some(status) {
            return None;
        }

        tracing::info!(
            status = %status,
            previous = ?self.last_status,
            "PagerDuty status changed"
        );
        self.last_status = Some(status);
        Some(status)
    }
}
