use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    agent::SensorSample,
    api::dto::{
        DeviceStatusResponse, LatestReadingResponse, SetpointResponse, SubmitReadingResponse,
    },
    config::AgentConfig,
};

/// Server operations the poll loop depends on.
pub trait ControlApi {
    fn submit_reading(
        &self,
        sample: &SensorSample,
    ) -> impl Future<Output = Result<SubmitReadingResponse>> + Send;

    fn fetch_setpoint(&self) -> impl Future<Output = Result<SetpointResponse>> + Send;

    fn fetch_device_status(&self) -> impl Future<Output = Result<DeviceStatusResponse>> + Send;
}

/// How often a call is repeated after a connection failure or timeout.
/// Other errors, including error statuses from the server, are returned at
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// Runs `attempt` until it succeeds, fails with a non-transient error or
    /// the retries are used up.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retried = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if retried < self.retries && is_transient(&e) => {
                    retried += 1;
                    debug!(operation, retry = retried, error = %e, "Transient failure; retrying");
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => {
                    if retried > 0 {
                        warn!(operation, retries = retried, "Giving up after retries");
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Connection failures and timeouts; anything the server answered is final.
fn is_transient(e: &anyhow::Error) -> bool {
    e.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|re| re.is_connect() || re.is_timeout())
    })
}

/// HTTP client for the device endpoints. Every attempt is bounded by the
/// configured timeout; transient failures are retried per [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    temperature: f64,
    humidity: f64,
    api_key: &'a str,
}

impl ApiClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: base_url.trim_end_matches('/').to_owned(),
                api_key: api_key.to_owned(),
                retry: RetryPolicy::default(),
            }),
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        Ok(Self::new(&config.server_url, &config.api_key, config.request_timeout)?
            .with_retry(RetryPolicy {
                retries: config.request_retries,
                delay: config.retry_delay,
            }))
    }

    /// Replaces the retry policy. Clones made before this call keep theirs.
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        let inner = Inner {
            http: self.inner.http.clone(),
            base_url: self.inner.base_url.clone(),
            api_key: self.inner.api_key.clone(),
            retry,
        };
        Self { inner: Arc::new(inner) }
    }

    fn url(&self, path: &str) -> Result<Url> {
        let raw = format!("{}{}", self.inner.base_url, path);
        Url::parse(&raw).with_context(|| format!("Invalid server URL: {raw:?}"))
    }

    /// URL for a GET endpoint with the shared secret as `api_key` query parameter.
    fn keyed_url(&self, path: &str) -> Result<Url> {
        let mut url = self.url(path)?;
        url.query_pairs_mut().append_pair("api_key", &self.inner.api_key);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.keyed_url(path)?;
        self.inner
            .retry
            .run(path, move || self.get_json_once(url.clone(), path))
            .await
    }

    async fn get_json_once<T: DeserializeOwned>(&self, url: Url, path: &str) -> Result<T> {
        debug!(path = %path, "GET");

        self.inner
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {path} returned error status"))?
            .json::<T>()
            .await
            .with_context(|| format!("Failed to deserialize response of GET {path}"))
    }

    /// Posts one reading. A retry after a timeout whose request did reach
    /// the server creates a second row there.
    pub async fn submit_reading(&self, sample: &SensorSample) -> Result<SubmitReadingResponse> {
        let path = "/api/sensor-data/";
        let url = self.url(path)?;
        self.inner
            .retry
            .run(path, move || self.submit_reading_once(url.clone(), sample))
            .await
    }

    async fn submit_reading_once(&self, url: Url, sample: &SensorSample) -> Result<SubmitReadingResponse> {
        debug!(
            temperature = sample.temperature,
            humidity = sample.humidity,
            "Submitting sensor reading"
        );

        let body = SubmitBody {
            temperature: sample.temperature,
            humidity: sample.humidity,
            api_key: &self.inner.api_key,
        };

        let resp = self
            .inner
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .context("Sensor data submission failed")?
            .error_for_status()
            .context("Sensor data endpoint returned error status")?
            .json::<SubmitReadingResponse>()
            .await
            .context("Failed to deserialize sensor data response")?;

        anyhow::ensure!(resp.success, "Server did not confirm the submission: {}", resp.message);
        Ok(resp)
    }

    pub async fn fetch_setpoint(&self) -> Result<SetpointResponse> {
        self.get_json("/api/get-setpoint/").await
    }

    pub async fn fetch_device_status(&self) -> Result<DeviceStatusResponse> {
        self.get_json("/api/get-device-status/").await
    }

    /// Latest stored reading, `None` when the server has no data yet.
    pub async fn latest_reading(&self) -> Result<Option<LatestReadingResponse>> {
        let path = "/api/latest-sensor/";
        let resp = self
            .inner
            .http
            .get(self.keyed_url(path)?)
            .send()
            .await
            .context("Latest reading request failed")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let reading = resp
            .error_for_status()
            .context("Latest reading endpoint returned error status")?
            .json::<LatestReadingResponse>()
            .await
            .context("Failed to deserialize latest reading response")?;
        Ok(Some(reading))
    }
}

impl ControlApi for ApiClient {
    async fn submit_reading(&self, sample: &SensorSample) -> Result<SubmitReadingResponse> {
        ApiClient::submit_reading(self, sample).await
    }

    async fn fetch_setpoint(&self) -> Result<SetpointResponse> {
        ApiClient::fetch_setpoint(self).await
    }

    async fn fetch_device_status(&self) -> Result<DeviceStatusResponse> {
        ApiClient::fetch_device_status(self).await
    }
}
