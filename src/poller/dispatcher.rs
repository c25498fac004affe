//! Webhook dispatcher.
//!
//! POSTs one envelope to a connection's webhook with the signing headers.
//! Each connection task owns its own dispatcher (and HTTP client), so a slow
//! downstream only ties up its own task.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Per-request webhook timeout.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Error bodies are truncated to this many characters before being stored.
pub const ERROR_BODY_LIMIT: usize = 200;

/// Retry delays in seconds, indexed by delivery attempt. The last entry
/// repeats for every further attempt.
pub const BACKOFF_SCHEDULE: [i64; 5] = [30, 60, 120, 240, 600];

/// Webhook delivery errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("webhook transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Sends envelopes to one connection's webhook endpoint.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    pub fn with_http_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// POSTs `payload` to `webhook_url`. Success is any 2xx status; anything
    /// else surfaces the status and a bounded slice of the body.
    pub async fn send(
        &self,
        webhook_url: &str,
        payload: &Value,
        webhook_secret: &str,
        connection_id: Uuid,
    ) -> Result<(), DispatchError> {
        let mut request = self
            .http
            .post(webhook_url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-Upstream-Connection-Id", connection_id.to_string());

        if !webhook_secret.is_empty() {
            request = request.header("X-Webhook-Secret", webhook_secret);
        }

        let response = request.json(payload).send().await?;
        let status = response.status();

        if status.is_success() {
            debug!(%connection_id, status = status.as_u16(), "webhook delivered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Status {
            status: status.as_u16(),
            body: truncate_body(&body),
        })
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds until the next retry for a given attempt count (1-based).
pub fn backoff_seconds(attempts: i32) -> i64 {
    let idx = attempts
        .saturating_sub(1)
        .clamp(0, BACKOFF_SCHEDULE.len() as i32 - 1) as usize;
    BACKOFF_SCHEDULE[idx]
}

pub(crate) fn truncate_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_LIMIT).collect()
}
