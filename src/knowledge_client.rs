//! Knowledge-base lookup: subject name to article extract and thumbnail URL.
//!
//! One lookup issues exactly one search/extract request per attempt. Attempts
//! beyond the first happen only for timeout-class transport failures and only
//! when `max_attempts` allows it.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info};
use serde_json::Value;

use crate::classifier_adapter::Subject;
use crate::config::KnowledgeConfig;
use crate::http_transport::{build_query_url, HttpFailureKind, JsonTransport, TransportError};

/// Page id the endpoint reports for titles with no article.
const MISSING_PAGE_ID: &str = "-1";
const RATE_LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const RETRY_BASE_DELAY: Duration = Duration::from_millis(320);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

/// Extracted article data for one subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleSummary {
    pub page_id: String,
    /// Plain-text intro; may be empty.
    pub extract: String,
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("No matching article found.")]
    NoArticle,
}

/// Subject to article lookup. Implementations may block.
pub trait KnowledgeSource: Send + Sync {
    fn lookup(&self, subject: &Subject) -> Result<ArticleSummary, KnowledgeError>;
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Search/extract client for a MediaWiki-style `api.php` endpoint.
pub struct KnowledgeClient {
    transport: Box<dyn JsonTransport>,
    endpoint: String,
    thumbnail_size_px: u32,
    max_attempts: u32,
    limiter: Option<DirectLimiter>,
}

impl KnowledgeClient {
    pub fn new(transport: Box<dyn JsonTransport>, config: &KnowledgeConfig) -> Self {
        let limiter = Quota::with_period(Duration::from_millis(config.min_request_interval_ms))
            .map(|quota| RateLimiter::direct(quota.allow_burst(NonZeroU32::MIN)));
        Self {
            transport,
            endpoint: config.endpoint.clone(),
            thumbnail_size_px: config.thumbnail_size_px,
            max_attempts: config.max_attempts.max(1),
            limiter,
        }
    }

    /// Builds the GET URL for `subject` with the fixed parameter set.
    pub fn request_url(&self, subject: &Subject) -> String {
        let thumbnail_size = self.thumbnail_size_px.to_string();
        build_query_url(
            &self.endpoint,
            &[
                ("format", "json"),
                ("action", "query"),
                ("prop", "extracts|pageimages"),
                ("exintro", ""),
                ("explaintext", ""),
                ("indexpageids", ""),
                ("redirects", "1"),
                ("pithumbsize", thumbnail_size.as_str()),
                ("titles", subject.as_str()),
            ],
        )
    }

    fn wait_for_rate_limit_slot(&self) {
        let Some(limiter) = self.limiter.as_ref() else {
            return;
        };
        while limiter.check().is_err() {
            std::thread::sleep(RATE_LIMIT_POLL_INTERVAL);
        }
    }

    fn get_json_with_retry(&self, url: &str) -> Result<Value, TransportError> {
        let mut attempt = 1u32;
        loop {
            self.wait_for_rate_limit_slot();
            match self.transport.get_json(url) {
                Ok(value) => return Ok(value),
                Err(error) if error.is_timeout() && attempt < self.max_attempts => {
                    let backoff = retry_backoff_delay(attempt);
                    info!(
                        "Knowledge lookup attempt {} timed out, retrying in {:?}",
                        attempt, backoff
                    );
                    std::thread::sleep(backoff);
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl KnowledgeSource for KnowledgeClient {
    fn lookup(&self, subject: &Subject) -> Result<ArticleSummary, KnowledgeError> {
        let url = self.request_url(subject);
        debug!("Knowledge lookup for '{}': {}", subject, url);
        let value = self
            .get_json_with_retry(&url)
            .map_err(|error| match error.kind {
                HttpFailureKind::InvalidJson => KnowledgeError::MalformedResponse(error.message),
                _ => KnowledgeError::NetworkError(error.message),
            })?;
        parse_article_summary(&value)
    }
}

fn retry_backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    RETRY_BASE_DELAY
        .checked_mul(1u32 << exponent)
        .unwrap_or(RETRY_MAX_DELAY)
        .min(RETRY_MAX_DELAY)
}

/// Reads `query.pageids[0]` and the matching `query.pages` entry.
pub fn parse_article_summary(value: &Value) -> Result<ArticleSummary, KnowledgeError> {
    let page_ids = value["query"]["pageids"].as_array().ok_or_else(|| {
        KnowledgeError::MalformedResponse("response is missing query.pageids".to_string())
    })?;
    let Some(first) = page_ids.first() else {
        return Err(KnowledgeError::NoArticle);
    };
    let page_id = match first {
        Value::String(id) => id.trim().to_string(),
        Value::Number(id) => id.to_string(),
        other => {
            return Err(KnowledgeError::MalformedResponse(format!(
                "unexpected page id {other}"
            )))
        }
    };
    if page_id.is_empty() {
        return Err(KnowledgeError::MalformedResponse(
            "empty page id".to_string(),
        ));
    }
    if page_id == MISSING_PAGE_ID {
        return Err(KnowledgeError::NoArticle);
    }

    let page = &value["query"]["pages"][page_id.as_str()];
    let extract = page["extract"].as_str().unwrap_or_default().to_string();
    let thumbnail_url = page["thumbnail"]["source"]
        .as_str()
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .map(str::to_string);
    Ok(ArticleSummary {
        page_id,
        extract,
        thumbnail_url,
    })
}
