use crate::cache::FetchError;
use crate::core::settings::PagerDutySettings;
use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

const ACCEPT_V2: &str = "application/vnd.pagerduty+json;version=2";

/// Authenticated PagerDuty REST client.
///
/// Every request is bounded by the configured timeout; a fetch that never
/// returns would otherwise hold its cache entry in flight forever.
#[derive(Clone)]
pub struct PagerDutyClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PagerDutyClient {
    pub fn new(settings: &PagerDutySettings) -> Result<Self> {
        Self::build(
            &settings.api_key,
            &settings.api_base_url,
            settings.request_timeout(),
        )
    }

    pub fn with_base_url(api_key: &str, base_url: impl Into<String>) -> Result<Self> {
        Self::build(api_key, &base_url.into(), Duration::from_secs(30))
    }

    fn build(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get<T>(&self, path: &str) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
    {
        self.request::<T, ()>(path, Method::GET, None).await
    }

    /// Sends one request and decodes the JSON response.
    ///
    /// `data` is only sent for POST and PUT. Failures come back as a
    /// [`FetchError`] after being logged with the request context.
    pub async fn request<T, B>(
        &self,
        path: &str,
        method: Method,
        data: Option<&B>,
    ) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path);

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header(AUTHORIZATION, format!("Token token={}", self.api_key))
            .header(ACCEPT, ACCEPT_V2);

        let sent = match data {
            Some(body) if method == Method::POST || method == Method::PUT => {
                request = request.json(body);
                serde_json::to_string(body).ok()
            }
            _ => None,
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = FetchError::Transport {
                    url,
                    message: e.to_string(),
                };
                log_failure(&method, &error, sent.as_deref(), None);
                return Err(error);
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let error = FetchError::Transport {
                    url,
                    message: format!("failed to read response body: {e}"),
                };
                log_failure(&method, &error, sent.as_deref(), None);
                return Err(error);
            }
        };

        if !status.is_success() {
            let error = FetchError::Status {
                url,
                status: status.as_u16(),
                body: body.clone(),
            };
            log_failure(&method, &error, sent.as_deref(), Some(body.as_str()));
            return Err(error);
        }

        serde_json::from_str(&body).map_err(|e| {
            let error = FetchError::Decode {
                url,
                message: e.to_string(),
            };
            log_failure(&method, &error, sent.as_deref(), Some(body.as_str()));
            error
        })
    }
}

fn log_failure(method: &Method, error: &FetchError, sent: Option<&str>, response: Option<&str>) {
    tracing::warn!(
        method = %method,
        error = %error,
        sent_data = sent.unwrap_or_default(),
        response = response.unwrap_or_default(),
        "PagerDuty request failed"
    );
}
