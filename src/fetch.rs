//! HTTP retrieval of one item's bytes, with bounded retry and backoff.
//!
//! The transient/non-transient boundary lives in exactly one place
//! ([`classify_status`]) and the backoff schedule is a pure value
//! ([`RetryPolicy`]), so the whole policy is testable without a network or
//! real delays.

use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_DISPOSITION, CONTENT_TYPE, HeaderMap, HeaderValue, REFERER, USER_AGENT};

use crate::config::FetchConfig;
use crate::error::{Error, Result};

/// How far into a non-media body we look for an indirect media URL.
const INDIRECTION_SCAN_LIMIT: usize = 1024 * 1024;

static STORAGE_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https://[^\s'"]+amazonaws[^\s'"]+"#).expect("valid regex")
});
static MEDIA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https://[^\s'"]+\.(?:jpg|jpeg|png|heic|mp4|mov)(?:\?[^'"\s]*)?"#)
        .expect("valid regex")
});

/// Bounded retry-with-backoff policy for transient failures.
///
/// The schedule is `min(max_delay, base_delay * 2^(attempt-1))`, queried
/// without sleeping, so tests can walk the whole curve synchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the initial try.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling the exponential curve saturates at.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Returns the delay to wait after failed attempt number `attempt`
    /// (1-based), or `None` when the retry ceiling is exhausted.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        Some(
            self.base_delay
                .saturating_mul(factor)
                .min(self.max_delay),
        )
    }

    /// Total attempts this policy allows, including the initial try.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Verdict on one HTTP status, from the single policy choke point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Proceed with the body.
    Ok,
    /// Retry-worthy: rate limiting or server-side failure.
    Transient,
    /// Non-retryable client rejection, typically an expired signature.
    Forbidden,
}

/// Classifies an HTTP status for retry purposes.
///
/// `429` and all of `5xx` are transient; every other `4xx` is a terminal
/// rejection. Transport-level errors are classified transient by the
/// caller since they never carry a status.
#[must_use]
pub fn classify_status(status: StatusCode) -> StatusClass {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StatusClass::Transient
    } else if status.is_client_error() {
        StatusClass::Forbidden
    } else {
        StatusClass::Ok
    }
}

/// A successfully retrieved payload with the HTTP metadata classification
/// and naming need downstream.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    /// The downloaded bytes.
    pub bytes: Bytes,
    /// Final HTTP status.
    pub status: u16,
    /// `Content-Type` header, if present.
    pub content_type: Option<String>,
    /// `Content-Disposition` header, if present.
    pub content_disposition: Option<String>,
    /// URL the bytes were actually served from (after redirects and
    /// indirection resolution).
    pub final_url: String,
    /// Total fetch attempts spent, including the initial try and any
    /// attempts on an intermediate-page URL.
    pub attempts: u32,
}

impl FetchedPayload {
    /// Whether the reported content type already looks like media.
    #[must_use]
    pub fn looks_like_media(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(is_media_content_type)
    }
}

fn is_media_content_type(ct: &str) -> bool {
    let ct = ct.to_ascii_lowercase();
    ct.starts_with("image/") || ct.starts_with("video/") || ct.contains("octet-stream")
}

enum AttemptOutcome {
    Success(reqwest::Response),
    Transient(String),
    Forbidden(u16),
}

/// Performs the HTTP retrieval of one work item.
pub struct Fetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Fetcher {
    /// Builds a fetcher with a tuned connection pool and the browser-like
    /// request headers the upstream expects.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&config.user_agent) {
            headers.insert(USER_AGENT, v);
        }
        if let Ok(v) = HeaderValue::from_str(&config.accept) {
            headers.insert(ACCEPT, v);
        }
        if let Some(referer) = &config.referer
            && let Ok(v) = HeaderValue::from_str(referer)
        {
            headers.insert(REFERER, v);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .tcp_keepalive(Duration::from_secs(30))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            policy: config.retry.clone(),
        })
    }

    /// Returns the retry policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retrieves a work item's bytes, following at most one level of
    /// intermediate-page indirection.
    ///
    /// Some signed URLs answer with a small HTML or JSON page that embeds
    /// the real storage URL; when the first response is not media-typed,
    /// the body is scanned for such a URL and, if found, fetched with the
    /// same retry policy. Classification downstream still has the final
    /// word on whether the bytes are media.
    ///
    /// # Errors
    ///
    /// [`Error::LinkExpiredOrForbidden`] for non-retryable rejections and
    /// [`Error::TransientHttp`] when the retry ceiling is exhausted.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPayload> {
        let mut target = url.to_string();
        let mut hops = 0u8;
        let mut prior_attempts = 0u32;
        loop {
            let mut payload = match self.fetch_with_retry(&target).await {
                Ok(p) => p,
                Err(e) => return Err(add_attempts(e, prior_attempts)),
            };
            // Attempts accumulate across the hop so records report the
            // whole cost of the item.
            payload.attempts += prior_attempts;
            if hops > 0 || payload.looks_like_media() {
                return Ok(payload);
            }
            match extract_indirect_url(&payload.bytes) {
                Some(next) => {
                    log::info!("following intermediate page to {next}");
                    prior_attempts = payload.attempts;
                    target = next;
                    hops += 1;
                }
                None => return Ok(payload),
            }
        }
    }

    /// One URL through the full retry loop.
    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedPayload> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(url).await {
                AttemptOutcome::Success(resp) => {
                    return self.read_payload(resp, attempt).await;
                }
                AttemptOutcome::Transient(detail) => {
                    let Some(delay) = self.policy.delay_for(attempt) else {
                        return Err(Error::TransientHttp {
                            detail,
                            attempts: attempt,
                        });
                    };
                    log::warn!(
                        "transient failure for {url} (attempt {attempt}/{}): {detail}; retrying in {delay:?}",
                        self.policy.max_attempts(),
                    );
                    tokio::time::sleep(delay).await;
                }
                AttemptOutcome::Forbidden(status) => {
                    return Err(Error::LinkExpiredOrForbidden {
                        status,
                        attempts: attempt,
                    });
                }
            }
        }
    }

    /// One attempt: GET, with a single POST fallback on 403/405 before the
    /// failure is classified. The fallback stays within the same attempt.
    async fn attempt(&self, url: &str) -> AttemptOutcome {
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return AttemptOutcome::Transient(e.to_string()),
        };

        let response = if matches!(
            response.status(),
            StatusCode::FORBIDDEN | StatusCode::METHOD_NOT_ALLOWED
        ) {
            match self.client.post(url).send().await {
                Ok(r) => r,
                Err(e) => return AttemptOutcome::Transient(e.to_string()),
            }
        } else {
            response
        };

        let status = response.status();
        match classify_status(status) {
            StatusClass::Ok => AttemptOutcome::Success(response),
            StatusClass::Transient => AttemptOutcome::Transient(format!("HTTP {status}")),
            StatusClass::Forbidden => AttemptOutcome::Forbidden(status.as_u16()),
        }
    }

    /// Drains the body and snapshots the headers downstream needs.
    async fn read_payload(&self, response: reqwest::Response, attempts: u32) -> Result<FetchedPayload> {
        let status = response.status().as_u16();
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let content_disposition = header(CONTENT_DISPOSITION);
        let final_url = response.url().to_string();
        let bytes = response.bytes().await?;

        Ok(FetchedPayload {
            bytes,
            status,
            content_type,
            content_disposition,
            final_url,
            attempts,
        })
    }
}

/// Folds attempts already spent on an earlier URL into an error from a
/// later hop.
fn add_attempts(e: Error, prior: u32) -> Error {
    match e {
        Error::TransientHttp { detail, attempts } => Error::TransientHttp {
            detail,
            attempts: attempts + prior,
        },
        Error::LinkExpiredOrForbidden { status, attempts } => Error::LinkExpiredOrForbidden {
            status,
            attempts: attempts + prior,
        },
        other => other,
    }
}

/// Scans a non-media body for the real storage URL: first JSON fields, then
/// embedded storage or media-extension URLs.
fn extract_indirect_url(bytes: &Bytes) -> Option<String> {
    let head = &bytes[..bytes.len().min(INDIRECTION_SCAN_LIMIT)];
    let text = String::from_utf8_lossy(head);

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
        for key in ["url", "signedUrl", "download_url", "mediaUrl"] {
            if let Some(url) = value.get(key).and_then(serde_json::Value::as_str) {
                return Some(url.to_string());
            }
        }
    }
    if let Some(m) = STORAGE_URL_RE.find(&text) {
        return Some(m.as_str().to_string());
    }
    MEDIA_URL_RE.find(&text).map(|m| m.as_str().to_string())
}
