use crate::pagerduty::MIN_SECONDS_BETWEEN_POLLS;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const API_KEY_ENV: &str = "PAGERDUTY_API_KEY";

/// Upper bound for every polling interval, one year.
const MAX_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pagerduty: PagerDutySettings,
    pub polling: PollingSettings,
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PagerDutySettings {
    pub api_key: String,
    pub api_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for PagerDutySettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base_url: "https://api.pagerduty.com/".to_string(),
            request_timeout_secs: 30,
        }
    }
}

impl PagerDutySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub min_seconds_between_polls: u64,
    pub check_interval_secs: u64,
    pub cache_minutes: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            min_seconds_between_polls: MIN_SECONDS_BETWEEN_POLLS,
            check_interval_secs: 1,
            cache_minutes: 60,
        }
    }
}

impl PollingSettings {
    pub fn min_between_polls(&self) -> Duration {
        Duration::from_secs(self.min_seconds_between_polls)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cache_duration(&self) -> Duration {
        Duration::from_secs(self.cache_minutes.saturating_mul(60))
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("oncall-watch").join("config.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path().context("Could not determine config directory")?;

        // Loaded before logging is set up, since `debug` picks the log level.
        let mut settings = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        settings.apply_env(std::env::var(API_KEY_ENV).ok());
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self, api_key: Option<String>) {
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            self.pagerduty.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pagerduty.api_key.trim().is_empty() {
            anyhow::bail!(
                "pagerduty.api_key is not set (set it in the config file or {})",
                API_KEY_ENV
            );
        }
        if !self.pagerduty.api_base_url.starts_with("http://")
            && !self.pagerduty.api_base_url.starts_with("https://")
        {
            anyhow::bail!(
                "pagerduty.api_base_url must be an http(s) URL, got {}",
                self.pagerduty.api_base_url
            );
        }
        if self.pagerduty.request_timeout_secs == 0 {
            anyhow::bail!("pagerduty.request_timeout_secs must be greater than 0");
        }
        if self.polling.check_interval_secs == 0 {
            anyhow::bail!("polling.check_interval_secs must be greater than 0");
        }
        if self.polling.cache_minutes == 0 {
            anyhow::bail!("polling.cache_minutes must be greater than 0");
        }
        for (name, secs) in [
            ("polling.min_seconds_between_polls", self.polling.min_seconds_between_polls),
            ("polling.check_interval_secs", self.polling.check_interval_secs),
            ("polling.cache_minutes", self.polling.cache_duration().as_secs()),
            ("pagerduty.request_timeout_secs", self.pagerduty.request_timeout_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                anyhow::bail!("{} is too large (at most one year)", name);
            }
        }
        Ok(())
    }
}
