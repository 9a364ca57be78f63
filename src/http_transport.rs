//! Blocking HTTP transport shared by the knowledge client and thumbnail fetcher.

use std::io::Read;
use std::time::Duration;

use serde_json::Value;

/// Coarse failure class used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailureKind {
    Timeout,
    RateLimited,
    Hard,
    InvalidJson,
}

/// Transport-level failure with a human-readable message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: HttpFailureKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: HttpFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == HttpFailureKind::Timeout
    }
}

/// "Fetch JSON for a URL" capability.
pub trait JsonTransport: Send + Sync {
    fn get_json(&self, url: &str) -> Result<Value, TransportError>;
}

/// "Fetch raw bytes for a URL" capability.
pub trait BytesTransport: Send + Sync {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError>;
}

/// `ureq`-backed transport with fixed timeouts and headers.
pub struct UreqTransport {
    agent: ureq::Agent,
    user_agent: String,
    request_timeout: Duration,
}

impl UreqTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration, request_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(request_timeout)
            .timeout_write(request_timeout)
            .build();
        Self {
            agent,
            user_agent: user_agent.to_string(),
            request_timeout,
        }
    }

    fn call(&self, url: &str, accept: &str) -> Result<ureq::Response, TransportError> {
        self.agent
            .get(url)
            .set("User-Agent", &self.user_agent)
            .set("Accept", accept)
            .timeout(self.request_timeout)
            .call()
            .map_err(|error| {
                TransportError::new(
                    classify_ureq_failure(&error),
                    format!("Request failed: {error}"),
                )
            })
    }
}

impl JsonTransport for UreqTransport {
    fn get_json(&self, url: &str) -> Result<Value, TransportError> {
        let response = self.call(url, "application/json")?;
        let mut body = String::new();
        response
            .into_reader()
            .read_to_string(&mut body)
            .map_err(|error| read_failure("Failed to read response", &error))?;
        serde_json::from_str(&body).map_err(|error| {
            TransportError::new(
                HttpFailureKind::InvalidJson,
                format!("Invalid JSON response: {error}"),
            )
        })
    }
}

impl BytesTransport for UreqTransport {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self.call(url, "image/*")?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|error| read_failure("Image read failed", &error))?;
        Ok(bytes)
    }
}

fn read_failure(label: &str, error: &std::io::Error) -> TransportError {
    let kind = if classify_io_timeout(error) {
        HttpFailureKind::Timeout
    } else {
        HttpFailureKind::Hard
    };
    TransportError::new(kind, format!("{label}: {error}"))
}

pub fn classify_ureq_failure(error: &ureq::Error) -> HttpFailureKind {
    match error {
        ureq::Error::Status(code, _) => classify_status(*code),
        ureq::Error::Transport(transport) => {
            let lowered = transport.to_string().to_ascii_lowercase();
            if lowered.contains("timed out") || lowered.contains("timeout") {
                HttpFailureKind::Timeout
            } else {
                HttpFailureKind::Hard
            }
        }
    }
}

fn classify_status(code: u16) -> HttpFailureKind {
    match code {
        429 => HttpFailureKind::RateLimited,
        408 | 500 | 502 | 503 | 504 => HttpFailureKind::Timeout,
        _ => HttpFailureKind::Hard,
    }
}

fn classify_io_timeout(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    ) || error.to_string().to_ascii_lowercase().contains("timed out")
}

/// Joins `base` and percent-encoded `params` in the given order.
pub fn build_query_url(base: &str, params: &[(&str, &str)]) -> String {
    let mut url = base.to_string();
    if params.is_empty() {
        return url;
    }

    url.push('?');
    for (index, (key, value)) in params.iter().enumerate() {
        if index > 0 {
            url.push('&');
        }
        url.push_str(key);
        url.push('=');
        url.push_str(urlencoding::encode(value).as_ref());
    }
    url
}
