//! Shared HTTP client for fetchers: per-host concurrency limits and retries on transient failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

/// Statuses worth another attempt: upstream hiccups and rate limiting.
pub fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500..=599)
}

fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Doubling delay between attempts, clamped to `ceiling`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_delay: Duration,
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_delay: Duration::from_millis(250),
            ceiling: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(shift).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    /// Parallel requests allowed against one host.
    pub max_per_host: usize,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_in_flight: 12,
            max_per_host: 3,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("building http client: {0}")]
    Client(String),
    #[error("invalid header {name}: {reason}")]
    Header { name: String, reason: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("http client is shutting down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().map_err(|e| HttpError::Client(e.to_string()))?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            per_host_limit: config.max_per_host.max(1),
            per_host: Mutex::new(HashMap::new()),
            retry: config.retry,
        })
    }

    async fn host_semaphore(&self, url: &str) -> Arc<Semaphore> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default();
        let mut map = self.per_host.lock().await;
        map.entry(host)
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GET `url` with optional extra headers, retrying transient failures.
    pub async fn get(
        &self,
        source: &str,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<HttpResponse, HttpError> {
        let header_map = build_headers(headers)?;
        let span = info_span!("http_fetch", source, url);
        self.get_with_retries(url, header_map).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str, headers: HeaderMap) -> Result<HttpResponse, HttpError> {
        let _global = self.global_limit.acquire().await.map_err(|_| HttpError::Closed)?;
        let per_host = self.host_semaphore(url).await;
        let _host = per_host.acquire().await.map_err(|_| HttpError::Closed)?;

        let mut attempt = 0usize;
        loop {
            let result = self.client.get(url).headers(headers.clone()).send().await;
            let retry = match result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(|source| HttpError::Request {
                            url: final_url.clone(),
                            source,
                        })?;
                        return Ok(HttpResponse {
                            status,
                            final_url,
                            body: body.to_vec(),
                        });
                    }
                    if !is_transient_status(status) || attempt >= self.retry.retries {
                        return Err(HttpError::Status {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    status.to_string()
                }
                Err(err) => {
                    if !is_transient_error(&err) || attempt >= self.retry.retries {
                        return Err(HttpError::Request {
                            url: url.to_string(),
                            source: err,
                        });
                    }
                    err.to_string()
                }
            };

            let delay = self.retry.delay(attempt);
            debug!(attempt, ?delay, reason = %retry, "retrying request");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn build_headers(headers: &[(&str, String)]) -> Result<HeaderMap, HttpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| HttpError::Header {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| HttpError::Header {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}
