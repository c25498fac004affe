//! Authenticated JSON-RPC client for one upstream instance.
//!
//! Holds the cached session id and its own HTTP client (the bulkhead: a hung
//! upstream only stalls the owning connection's task). Transport and
//! authentication failures invalidate the session; an authentication loss
//! mid-call gets exactly one transparent re-authenticate + retry.

use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use super::record::Record;

/// Per-call timeout for upstream RPCs.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream client errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("upstream rate limit hit (HTTP 429)")]
    RateLimited,

    #[error("upstream rpc fault: {0}")]
    Rpc(String),

    #[error("malformed upstream reply: {0}")]
    Malformed(String),

    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

impl UpstreamError {
    /// Whether the worker should treat this as a hard breaker fault.
    /// Rate limiting aborts the cycle without counting against the breaker.
    pub fn is_breaker_fault(&self) -> bool {
        !matches!(self, UpstreamError::RateLimited)
    }
}

/// JSON-RPC client bound to one connection's upstream.
pub struct UpstreamClient {
    base_url: String,
    db: String,
    username: String,
    api_key: String,
    http: reqwest::Client,
    session_id: Option<i64>,
}

impl UpstreamClient {
    pub fn new(base_url: &str, db: &str, username: &str, api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::with_http_client(base_url, db, username, api_key, http)
    }

    /// Construct with an externally built HTTP client.
    pub fn with_http_client(
        base_url: &str,
        db: &str,
        username: &str,
        api_key: &str,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            db: db.to_string(),
            username: username.to_string(),
            api_key: api_key.to_string(),
            http,
            session_id: None,
        }
    }

    /// The cached session id, if authenticated.
    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    /// Seed the cached session, e.g. from the connection row.
    pub fn load_session(&mut self, session_id: Option<i64>) {
        self.session_id = session_id;
    }

    /// Drops the cached session; the next call re-authenticates.
    pub fn invalidate_session(&mut self) {
        self.session_id = None;
    }

    /// Whether this client still matches the given credentials.
    pub fn matches(&self, base_url: &str, db: &str, username: &str, api_key: &str) -> bool {
        self.base_url == base_url.trim_end_matches('/')
            && self.db == db
            && self.username == username
            && self.api_key == api_key
    }

    /// Exchanges `(db, user, api_key)` for a numeric session id.
    pub async fn authenticate(&mut self) -> Result<i64, UpstreamError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": "common",
                "method": "authenticate",
                "args": [self.db, self.username, self.api_key, {}],
            },
        });

        let result = self.rpc_call(payload).await?;
        let session = match result.as_i64() {
            Some(id) if id > 0 => id,
            _ => {
                return Err(UpstreamError::Auth(format!(
                    "authentication rejected for {}@{}",
                    self.username, self.db
                )))
            }
        };

        self.session_id = Some(session);
        info!(db = %self.db, session_id = session, "authenticated against upstream");
        Ok(session)
    }

    /// Ensures a session is cached, authenticating when necessary.
    pub async fn ensure_session(&mut self) -> Result<i64, UpstreamError> {
        match self.session_id {
            Some(session) => Ok(session),
            None => self.authenticate().await,
        }
    }

    /// Filtered batch read. `order` and `limit` are forwarded only when
    /// truthy, matching the upstream's optional-argument convention.
    pub async fn search_read(
        &mut self,
        model: &str,
        domain: Value,
        fields: &[&str],
        order: Option<&str>,
        limit: Option<u32>,
    ) -> Result<Vec<Record>, UpstreamError> {
        let mut kwargs = Map::new();
        kwargs.insert("fields".to_string(), json!(fields));
        if let Some(order) = order.filter(|o| !o.is_empty()) {
            kwargs.insert("order".to_string(), json!(order));
        }
        if let Some(limit) = limit.filter(|l| *l > 0) {
            kwargs.insert("limit".to_string(), json!(limit));
        }

        let result = self
            .object_call(model, "search_read", vec![domain], kwargs)
            .await?;
        parse_records(result)
    }

    /// Batch read by id list. Result order is not guaranteed; callers index
    /// by id.
    pub async fn read(
        &mut self,
        model: &str,
        ids: &[i64],
        fields: &[&str],
    ) -> Result<Vec<Record>, UpstreamError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut kwargs = Map::new();
        kwargs.insert("fields".to_string(), json!(fields));

        let result = self
            .object_call(model, "read", vec![json!(ids)], kwargs)
            .await?;
        parse_records(result)
    }

    async fn object_call(
        &mut self,
        model: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, UpstreamError> {
        self.ensure_session().await?;

        match self.execute(model, method, &args, &kwargs).await {
            Err(UpstreamError::Auth(message)) => {
                warn!(db = %self.db, %message, "session lost, re-authenticating");
                self.authenticate().await?;
                self.execute(model, method, &args, &kwargs).await
            }
            other => other,
        }
    }

    async fn execute(
        &mut self,
        model: &str,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Value, UpstreamError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": "call",
            "params": {
                "service": "object",
                "method": "execute_kw",
                "args": [self.db, self.session_id, self.api_key, model, method, args, kwargs],
            },
        });

        self.rpc_call(payload).await
    }

    async fn rpc_call(&mut self, payload: Value) -> Result<Value, UpstreamError> {
        let url = format!("{}/jsonrpc", self.base_url);

        let response = match self.http.post(&url).json(&payload).send().await {
            Ok(response) => response,
            Err(err) => {
                self.session_id = None;
                return Err(UpstreamError::Transport(err));
            }
        };

        if response.status().as_u16() == 429 {
            return Err(UpstreamError::RateLimited);
        }

        if let Err(err) = response.error_for_status_ref() {
            self.session_id = None;
            return Err(UpstreamError::Transport(err));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::Malformed(format!("invalid JSON-RPC reply: {e}")))?;

        if let Some(error) = data.get("error") {
            let message = error
                .get("data")
                .and_then(|d| d.get("message"))
                .or_else(|| error.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error")
                .to_string();

            if is_auth_fault(&message) {
                self.session_id = None;
                return Err(UpstreamError::Auth(message));
            }
            return Err(UpstreamError::Rpc(message));
        }

        Ok(data.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn is_auth_fault(message: &str) -> bool {
    message.contains("Session")
        || message.contains("Access Denied")
        || message.to_lowercase().contains("authenticate")
}

fn parse_records(result: Value) -> Result<Vec<Record>, UpstreamError> {
    let items = match result {
        Value::Array(items) => items,
        other => {
            return Err(UpstreamError::Malformed(format!(
                "expected a record list, got {other}"
            )))
        }
    };

    items
        .into_iter()
        .map(|item| {
            Record::from_value(item)
                .ok_or_else(|| UpstreamError::Malformed("record is not an object".to_string()))
        })
        .collect()
}
