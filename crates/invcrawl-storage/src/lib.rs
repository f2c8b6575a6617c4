//! Fetch drivers and crawl-state persistence for the inventory crawl engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use invcrawl_core::FetchDriverKind;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

mod postgres;
mod store;

pub use postgres::PgCrawlStore;
pub use store::{CrawlStore, MemoryCrawlStore, UpsertSummary};

pub const CRATE_NAME: &str = "invcrawl-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub timeout: Duration,
    /// Bodies above this size are cut before parsing; 0 disables the cap.
    pub max_html_bytes: usize,
}

impl FetchOptions {
    pub fn new(timeout_ms: u64, max_html_bytes: usize) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            max_html_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTrace {
    pub html_truncated: bool,
    pub original_bytes: usize,
    pub truncated_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub status: u16,
    pub final_url: String,
    pub body: String,
    pub trace: FetchTrace,
}

impl FetchResult {
    /// HTTP 200 with something to parse.
    pub fn is_usable_page(&self) -> bool {
        self.status == 200 && !self.body.trim().is_empty()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("headless render failed for {url}: {message}")]
    Headless { url: String, message: String },
    #[error("{0} fetch driver is not configured")]
    DriverUnavailable(&'static str),
    #[error("fetch limiter closed")]
    LimiterClosed,
}

/// Capability to retrieve one page. Non-200 responses are returned, not raised.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn driver(&self) -> FetchDriverKind;

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, FetchError>;
}

/// Decodes a body and cuts it to `max_bytes` on a UTF-8 boundary.
pub fn truncate_html(raw: &[u8], max_bytes: usize) -> (String, FetchTrace) {
    let text = String::from_utf8_lossy(raw);
    let original_bytes = raw.len();
    if max_bytes == 0 || text.len() <= max_bytes {
        let kept = text.len();
        return (
            text.into_owned(),
            FetchTrace {
                html_truncated: false,
                original_bytes,
                truncated_bytes: kept,
            },
        );
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (
        text[..cut].to_string(),
        FetchTrace {
            html_truncated: true,
            original_bytes,
            truncated_bytes: cut,
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Host count above which idle per-host limiters are dropped.
const MAX_TRACKED_HOSTS: usize = 256;

/// Plain HTTP driver shared by every job in the process.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        if map.len() >= MAX_TRACKED_HOSTS && !map.contains_key(host) {
            // An idle host's semaphore is referenced only by the map.
            map.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        }
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchResult, FetchError> {
        let mut attempt = 0;
        loop {
            let resp_result = self
                .client
                .get(url)
                .timeout(options.timeout)
                .send()
                .await;
            let may_retry = attempt < self.backoff.max_retries;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable && may_retry {
                        debug!(%status, attempt, "retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let final_url = resp.url().to_string();
                    let bytes = resp.bytes().await?;
                    let (body, trace) = truncate_html(&bytes, options.max_html_bytes);
                    return Ok(FetchResult {
                        status: status.as_u16(),
                        final_url,
                        body,
                        trace,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && may_retry {
                        debug!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn driver(&self) -> FetchDriverKind {
        FetchDriverKind::Http
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default();
        let per_host = self.per_host_semaphore(&host).await;
        let _host = per_host
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        self.fetch_with_retries(url, options)
            .instrument(info_span!("http_fetch", url, host = %host))
            .await
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest<'a> {
    url: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderResponse {
    status: u16,
    html: String,
    #[serde(default)]
    final_url: Option<String>,
}

/// Headless driver backed by a remote rendering service that returns the
/// page's HTML after scripts have run.
#[derive(Debug, Clone)]
pub struct HeadlessFetcher {
    client: reqwest::Client,
    render_url: String,
}

impl HeadlessFetcher {
    pub fn new(render_url: impl Into<String>, user_agent: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent.to_string());
        }
        Ok(Self {
            client: builder.build().context("building headless render client")?,
            render_url: render_url.into(),
        })
    }
}

#[async_trait]
impl Fetcher for HeadlessFetcher {
    fn driver(&self) -> FetchDriverKind {
        FetchDriverKind::Headless
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchResult, FetchError> {
        let request = RenderRequest {
            url,
            timeout_ms: options.timeout.as_millis() as u64,
        };
        let resp = self
            .client
            .post(&self.render_url)
            .timeout(options.timeout + Duration::from_secs(5))
            .json(&request)
            .send()
            .instrument(info_span!("headless_fetch", url))
            .await?;

        if !resp.status().is_success() {
            return Err(FetchError::Headless {
                url: url.to_string(),
                message: format!("render service answered {}", resp.status()),
            });
        }

        let rendered: RenderResponse = resp.json().await?;
        let (body, trace) = truncate_html(rendered.html.as_bytes(), options.max_html_bytes);
        Ok(FetchResult {
            status: rendered.status,
            final_url: rendered.final_url.unwrap_or_else(|| url.to_string()),
            body,
            trace,
        })
    }
}

/// Drivers available to a job, selected by `profile.fetch.driver`.
#[derive(Clone)]
pub struct FetcherSet {
    http: Arc<dyn Fetcher>,
    headless: Option<Arc<dyn Fetcher>>,
}

impl FetcherSet {
    pub fn new(http: Arc<dyn Fetcher>) -> Self {
        Self {
            http,
            headless: None,
        }
    }

    pub fn with_headless(mut self, headless: Arc<dyn Fetcher>) -> Self {
        self.headless = Some(headless);
        self
    }

    pub fn has_headless(&self) -> bool {
        self.headless.is_some()
    }

    pub fn select(&self, kind: FetchDriverKind) -> Result<Arc<dyn Fetcher>, FetchError> {
        match kind {
            FetchDriverKind::Http => Ok(self.http.clone()),
            FetchDriverKind::Headless => self
                .headless
                .clone()
                .ok_or(FetchError::DriverUnavailable(kind.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticFetcher(FetchDriverKind);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        fn driver(&self) -> FetchDriverKind {
            self.0
        }

        async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResult, FetchError> {
            Ok(FetchResult {
                status: 200,
                final_url: url.to_string(),
                body: "<html></html>".to_string(),
                trace: FetchTrace::default(),
            })
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::OK), RetryDisposition::NonRetryable);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let body = "<p>hyvää päivää</p>".as_bytes();
        let (text, trace) = truncate_html(body, 8);
        assert!(trace.html_truncated);
        assert_eq!(trace.original_bytes, body.len());
        assert!(text.len() <= 8);
        assert_eq!(trace.truncated_bytes, text.len());
        assert!("<p>hyvää päivää</p>".starts_with(&text));

        let (full, trace) = truncate_html(body, 0);
        assert!(!trace.html_truncated);
        assert_eq!(full.len(), body.len());

        let (small, trace) = truncate_html(b"<p>ok</p>", 1024);
        assert_eq!(small, "<p>ok</p>");
        assert!(!trace.html_truncated);
        assert_eq!(trace.truncated_bytes, 9);
    }

    #[test]
    fn usable_page_requires_200_and_body() {
        let mut result = FetchResult {
            status: 200,
            final_url: "https://a.example/".to_string(),
            body: "  \n".to_string(),
            trace: FetchTrace::default(),
        };
        assert!(!result.is_usable_page());
        result.body = "<html>x</html>".to_string();
        assert!(result.is_usable_page());
        result.status = 404;
        assert!(!result.is_usable_page());
    }

    fn quick_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn request_errors_surface_after_retries() {
        let options = FetchOptions::new(1_000, 0);

        let err = quick_fetcher(0).fetch("not a url", &options).await.unwrap_err();
        assert!(matches!(err, FetchError::Request(ref e) if e.is_builder()));

        // Nothing listens on port 9 locally; the connect error is retried, then returned.
        let err = quick_fetcher(2)
            .fetch("http://127.0.0.1:9/", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request(_)));
    }

    #[tokio::test]
    async fn idle_host_limiters_are_pruned() {
        let fetcher = quick_fetcher(0);
        let held = fetcher.per_host_semaphore("busy.example").await;
        for n in 0..MAX_TRACKED_HOSTS + 10 {
            fetcher.per_host_semaphore(&format!("host-{n}.example")).await;
        }

        assert!(fetcher.per_host.lock().await.len() < MAX_TRACKED_HOSTS);
        let again = fetcher.per_host_semaphore("busy.example").await;
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[tokio::test]
    async fn fetcher_set_selects_by_driver() {
        let set = FetcherSet::new(Arc::new(StaticFetcher(FetchDriverKind::Http)));
        assert!(!set.has_headless());
        assert_eq!(
            set.select(FetchDriverKind::Http).unwrap().driver(),
            FetchDriverKind::Http
        );
        assert!(matches!(
            set.select(FetchDriverKind::Headless),
            Err(FetchError::DriverUnavailable("headless"))
        ));

        let set = set.with_headless(Arc::new(StaticFetcher(FetchDriverKind::Headless)));
        let headless = set.select(FetchDriverKind::Headless).unwrap();
        assert_eq!(headless.driver(), FetchDriverKind::Headless);
        let page = headless
            .fetch("https://a.example/x", &FetchOptions::new(1_000, 0))
            .await
            .unwrap();
        assert_eq!(page.final_url, "https://a.example/x");
    }
}
