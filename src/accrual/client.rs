//! HTTP client for the accrual service.
//!
//! One GET per lookup: `<base>/api/orders/<number>`.
//!
//! | Response | Outcome |
//! |---|---|
//! | 200 | `Ready` with the decoded body |
//! | 204, 404 | `NotRegistered` |
//! | 429 | `RateLimited`, interval from `Retry-After` |
//! | 5xx | `AccrualError::Server` |
//! | other | `AccrualError::Rejected` |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AccrualError, AccrualReply, AccrualSource, FetchOutcome};
use crate::config::AccrualConfig;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const DEFAULT_ORDERS_PATH: &str = "/api/orders/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Backoff applied when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

/// Structured error body: `{ "code", "message", "timestamp" }`.
#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// reqwest-backed accrual client.
#[derive(Debug, Clone)]
pub struct AccrualClient {
    http: Client,
    base_url: String,
    orders_path: String,
    default_retry_after: Duration,
}

impl AccrualClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, AccrualError> {
        Self::build(base_url, DEFAULT_TIMEOUT, DEFAULT_RETRY_AFTER)
    }

    /// Create a client from the `[accrual]` config section.
    pub fn from_config(cfg: &AccrualConfig) -> Result<Self, AccrualError> {
        Self::build(
            &cfg.base_url,
            Duration::from_secs(cfg.request_timeout_secs),
            Duration::from_secs(cfg.default_retry_after_secs),
        )
    }

    fn build(base_url: &str, timeout: Duration, default_retry_after: Duration) -> Result<Self, AccrualError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent("gophermart/0.1.0 (accrual-reconciler)")
            .build()?;

        Ok(Self {
            http,
            base_url: normalise_base(base_url),
            orders_path: DEFAULT_ORDERS_PATH.to_string(),
            default_retry_after,
        })
    }

    /// Replace the path prefix placed between the base URL and the order
    /// number (default `/api/orders/`).
    pub fn with_orders_path(mut self, path: &str) -> Self {
        let mut path = path.to_string();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }
        self.orders_path = path;
        self
    }

    /// Full lookup URL for an order.
    pub fn order_url(&self, order_number: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url,
            self.orders_path,
            urlencoding::encode(order_number)
        )
    }
}

/// Accept addresses with or without a scheme (`localhost:8081` is common
/// in deployment env vars) and drop trailing slashes.
fn normalise_base(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Parse `Retry-After` as delta-seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Best-effort extraction of the service's error message.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ApiError>(body) {
        Ok(err) if !err.message.is_empty() => {
            if let Some(code) = err.code {
                debug!(code, timestamp = ?err.timestamp, "Accrual service error body");
            }
            err.message
        }
        _ => body.trim().to_string(),
    }
}

#[async_trait]
impl AccrualSource for AccrualClient {
    async fn fetch(&self, order_number: &str) -> Result<FetchOutcome, AccrualError> {
        let url = self.order_url(order_number);
        debug!(url = %url, "Querying accrual service");

        let resp = self
            .http
            .get(&url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = resp.status();
        match status {
            StatusCode::OK => {
                let body = resp.text().await?;
                let reply: AccrualReply = serde_json::from_str(&body)
                    .map_err(|e| AccrualError::Decode(format!("{e}: {body}")))?;
                Ok(FetchOutcome::Ready(reply))
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(FetchOutcome::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = retry_after(resp.headers()).unwrap_or(self.default_retry_after);
                warn!(order = order_number, wait_secs = wait.as_secs(), "Accrual service rate limit");
                Ok(FetchOutcome::RateLimited(wait))
            }
            s if s.is_server_error() => {
                let body = resp.text().await.unwrap_or_default();
                Err(AccrualError::Server {
                    status: s.as_u16(),
                    message: error_message(&body),
                })
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(AccrualError::Rejected {
                    status: s.as_u16(),
                    message: error_message(&body),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
