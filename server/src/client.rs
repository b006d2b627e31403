//! HTTP client helper for talking to devices.
//!
//! Every HTTP exchange with an ethoscope or sensor goes through
//! [`DeviceClient`]: JSON in, JSON out, transient network failures retried
//! with exponential backoff, and everything else classified into the closed
//! [`ScanError`] set so callers can decide what counts against a device.

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default timeout for informational GETs.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for command POSTs — commands either land quickly or not at all.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Errors arising from device HTTP exchanges.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The request never completed: connect failure, timeout, reset.
    #[error("network error contacting {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The device answered with a non-2xx status.
    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: StatusCode },

    /// The device answered 2xx with no body at all.
    #[error("empty response body from {url}")]
    EmptyBody { url: String },

    /// The device answered with a body that is not JSON.
    #[error("could not parse response from {url} as JSON: {source}")]
    InvalidJson {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// The device is reachable but what it said makes no sense.
    #[error("device error: {0}")]
    Device(String),

    /// The owning poller is shutting down; the request was abandoned.
    #[error("request to {url} cancelled")]
    Cancelled { url: String },
}

impl ScanError {
    /// Failures that count against a device's consecutive-error counter and
    /// are worth retrying.
    pub fn is_network(&self) -> bool {
        matches!(self, ScanError::Network { .. } | ScanError::HttpStatus { .. })
    }

    /// True when the underlying failure was ECONNREFUSED. The poller treats
    /// repeated refusals as "the device was shut down, stop asking".
    pub fn is_connection_refused(&self) -> bool {
        let ScanError::Network { source, .. } = self else {
            return false;
        };
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(source);
        while let Some(err) = cause {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                if io.kind() == std::io::ErrorKind::ConnectionRefused {
                    return true;
                }
            }
            cause = err.source();
        }
        false
    }
}

/// Exponential backoff parameters for retried requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub initial_delay: Duration,
    pub factor: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_tries: 4,
            initial_delay: Duration::from_secs(3),
            factor: 2,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.factor.saturating_pow(attempt);
        let delay = self.initial_delay.saturating_mul(factor);
        delay.min(self.cap)
    }
}

/// Run `op` under the retry policy, backing off between network failures.
///
/// Non-network errors (bad JSON, device nonsense) return immediately — the
/// device answered, it just answered badly. Cancellation interrupts a
/// pending backoff sleep but never an in-flight request, which is bounded by
/// its own timeout.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ScanError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ScanError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_network() && attempt + 1 < policy.max_tries => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying after network failure");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(ScanError::Cancelled { url: err.to_string() });
                    }
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A JSON-speaking HTTP client bound to one device.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    base: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl DeviceClient {
    pub fn new(ip: &str, port: u16, cancel: CancellationToken) -> Self {
        // Per-request timeouts are set on each call; the builder default only
        // guards against requests issued without one.
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        DeviceClient {
            http,
            base: format!("http://{ip}:{port}"),
            retry: RetryPolicy::default(),
            cancel,
        }
    }

    /// Replace the retry schedule (fast-failing probes, tests).
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// Absolute URL for a static asset path reported by the device.
    pub fn static_url(&self, path: &str) -> String {
        format!("{}/static/{}", self.base, path.trim_start_matches('/'))
    }

    /// GET `path` and decode the body as JSON, retrying network failures.
    pub async fn get_json(&self, path: &str) -> Result<Value, ScanError> {
        self.get_json_with(path, DEFAULT_TIMEOUT).await
    }

    /// GET with an explicit timeout for the slow endpoints (module probing).
    pub async fn get_json_with(&self, path: &str, timeout: Duration) -> Result<Value, ScanError> {
        let url = self.url(path);
        retry_with_backoff(self.retry, &self.cancel, || {
            request_json(&self.http, &url, timeout, None)
        })
        .await
    }

    /// POST a JSON body to `path` with the short command timeout.
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ScanError> {
        let url = self.url(path);
        retry_with_backoff(self.retry, &self.cancel, || {
            request_json(&self.http, &url, COMMAND_TIMEOUT, Some(body))
        })
        .await
    }

    /// POST without retry, for commands that must be at-most-once.
    pub async fn post_json_once(&self, path: &str, body: &Value) -> Result<Value, ScanError> {
        let url = self.url(path);
        request_json(&self.http, &url, COMMAND_TIMEOUT, Some(body)).await
    }

    fn url(&self, path: &str) -> String {
        if path.is_empty() {
            format!("{}/", self.base)
        } else {
            format!("{}/{}", self.base, path.trim_start_matches('/'))
        }
    }
}

/// One HTTP exchange, classified into [`ScanError`].
async fn request_json(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
    body: Option<&Value>,
) -> Result<Value, ScanError> {
    let request = match body {
        Some(json) => http.post(url).json(json),
        None => http.get(url),
    };

    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| ScanError::Network {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ScanError::HttpStatus {
            url: url.to_string(),
            status,
        });
    }

    let text = response.text().await.map_err(|source| ScanError::Network {
        url: url.to_string(),
        source,
    })?;

    if text.is_empty() {
        return Err(ScanError::EmptyBody {
            url: url.to_string(),
        });
    }

    serde_json::from_str(&text).map_err(|source| ScanError::InvalidJson {
        url: url.to_string(),
        source,
    })
}
