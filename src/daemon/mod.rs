mod polling;

use anyhow::{Context, Result};
use oncall_watch::core::settings::Settings;
use oncall_watch::pagerduty::{PagerDutyApi, PagerDutyClient};
use std::sync::Arc;

pub use polling::PollingLoop;

pub async fn run(settings: Settings) -> Result<()> {
    tracing::info!(config = ?Settings::config_path(), "Starting oncall-watch daemon");

    let client = PagerDutyClient::new(&settings.pagerduty)?;
    let api = Arc::new(PagerDutyApi::new(client, &settings.polling)?);

    tracing::info!(
        entries = ?api.cache().entry_keys(),
        min_between_polls = ?settings.polling.min_between_polls(),
        "Registered PagerDuty caches"
    );

    let polling = PollingLoop::new(api, settings.polling.check_interval());

    tokio::select! {
        _ = polling.run() => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}
