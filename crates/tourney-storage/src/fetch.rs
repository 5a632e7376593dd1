//! Shared HTTP client with bounded timeouts and per-host concurrency limits.
//!
//! A failed or timed-out request is reported, never retried: failed sources
//! are simply eligible again on the next scheduled run.

use std::collections::HashMap;
use std::error::Error as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tourney_core::{url::host_of, UrlError};
use tracing::{debug, Instrument};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    /// Requests per minute across every host; `None` leaves fetches unthrottled.
    pub requests_per_minute: Option<u32>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 2,
            requests_per_minute: None,
        }
    }
}

/// Per-minute request budget shared by every caller holding the limiter.
///
/// Each request reserves the next slot on an evenly spaced schedule; up to a
/// full minute's budget may be reserved ahead, so an idle limiter allows a
/// burst of `per_minute` requests before callers start waiting.
#[derive(Debug)]
pub struct RateLimiter {
    spacing: Duration,
    burst: u32,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// `None` for a zero budget, which means "no limit".
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then(|| Self {
            spacing: Duration::from_secs(60) / requests,
            burst: requests,
            next_slot: Mutex::new(Instant::now()),
        })
    }

    /// Reserve a slot and report how long the caller must wait for it.
    pub async fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut next = self.next_slot.lock().await;
        let slot = (*next).max(now);
        *next = slot + self.spacing;
        let allowed_at = slot
            .checked_sub(self.spacing * (self.burst - 1))
            .unwrap_or(now);
        allowed_at.saturating_duration_since(now)
    }

    pub async fn acquire(&self) {
        let wait = self.reserve().await;
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Outcome of a live validation request; the body is not read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.starts_with("text/html") || ct.starts_with("application/xhtml")
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),
    #[error("unreachable: {0}")]
    Unreachable(String),
}

impl FetchError {
    /// True when the failure came from name resolution rather than the server.
    pub fn is_dns_failure(&self) -> bool {
        match self {
            FetchError::Request(err) => {
                let mut source = err.source();
                while let Some(inner) = source {
                    let text = inner.to_string().to_ascii_lowercase();
                    if text.contains("dns error") || text.contains("failed to lookup address") {
                        return true;
                    }
                    source = inner.source();
                }
                false
            }
            FetchError::Unreachable(msg) => msg.to_ascii_lowercase().contains("dns"),
            _ => false,
        }
    }
}

/// Page retrieval capability used by sweeps and candidate validation.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// GET `url`, following redirects; non-2xx is an error.
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError>;

    /// GET `url`, following redirects, and report status and content type.
    async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    limiter: Option<RateLimiter>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            limiter: config.requests_per_minute.and_then(RateLimiter::per_minute),
        })
    }

    pub fn is_rate_limited(&self) -> bool {
        self.limiter.is_some()
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let host = host_of(url)?;
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host
            .acquire()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let started = Instant::now();
        let resp = self.client.get(url).send().await?;
        debug!(
            status = resp.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "response received"
        );
        Ok(resp)
    }
}

fn content_type_of(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", url);
        async move {
            let resp = self.send(url).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let content_type = content_type_of(&resp);
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }

    async fn probe(&self, url: &str) -> Result<ProbeResponse, FetchError> {
        let span = tracing::info_span!("http_probe", url);
        async move {
            let resp = self.send(url).await?;
            Ok(ProbeResponse {
                status: resp.status().as_u16(),
                final_url: resp.url().to_string(),
                content_type: content_type_of(&resp),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_detection_accepts_charset_suffix() {
        let probe = ProbeResponse {
            status: 200,
            final_url: "https://example.com/".into(),
            content_type: Some("Text/HTML; charset=utf-8".into()),
        };
        assert!(probe.is_success());
        assert!(probe.is_html());

        let pdf = ProbeResponse {
            content_type: Some("application/pdf".into()),
            ..probe.clone()
        };
        assert!(!pdf.is_html());
        let redirect_loop = ProbeResponse { status: 310, ..probe };
        assert!(!redirect_loop.is_success());
    }

    #[test]
    fn unreachable_dns_message_is_classified() {
        assert!(FetchError::Unreachable("dns lookup failed".into()).is_dns_failure());
        assert!(!FetchError::HttpStatus { status: 500, url: "x".into() }.is_dns_failure());
    }

    #[tokio::test]
    async fn limiter_allows_a_minute_of_burst_then_spaces_requests() {
        let limiter = RateLimiter::per_minute(3).unwrap();
        for _ in 0..3 {
            assert_eq!(limiter.reserve().await, Duration::ZERO);
        }
        let wait = limiter.reserve().await;
        assert!(wait > Duration::from_secs(15) && wait <= Duration::from_secs(20), "{wait:?}");
        assert!(RateLimiter::per_minute(0).is_none());
    }

    #[test]
    fn fetcher_applies_the_configured_rate() {
        let plain = HttpFetcher::new(HttpClientConfig {
            user_agent: Some("tourney-bot/0.1".into()),
            ..Default::default()
        })
        .unwrap();
        assert!(!plain.is_rate_limited());

        let limited = HttpFetcher::new(HttpClientConfig {
            requests_per_minute: Some(30),
            ..Default::default()
        })
        .unwrap();
        assert!(limited.is_rate_limited());
    }
}
