//! Test utilities shared by the integration suites.
//!
//! Provides an in-memory SQLite store with migrations applied, connection
//! fixtures, and helpers for mocking the upstream JSON-RPC endpoint.

use std::sync::Arc;

use anyhow::Result;
use orderbridge::crypto::CryptoKey;
use orderbridge::db::apply_pragmas;
use orderbridge::migration::{Migrator, MigratorTrait};
use orderbridge::models::connection::Model as ConnectionModel;
use orderbridge::poller::scheduler::EngineHandles;
use orderbridge::repositories::connection::NewConnection;
use sea_orm::{Database, DatabaseConnection};
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Deterministic 32-byte test key.
#[allow(dead_code)]
pub fn test_crypto_key() -> CryptoKey {
    CryptoKey::new(vec![7u8; 32]).expect("valid test key")
}

/// Sets up an in-memory SQLite database with all migrations applied.
#[allow(dead_code)]
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    apply_pragmas(&db).await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

/// Repository bundle over a fresh in-memory store.
#[allow(dead_code)]
pub async fn setup_handles() -> Result<EngineHandles> {
    let db = Arc::new(setup_test_db().await?);
    Ok(EngineHandles::new(db, test_crypto_key()))
}

/// Creates a connection pointing at the given mock upstream and webhook.
#[allow(dead_code)]
pub async fn insert_connection(
    handles: &EngineHandles,
    upstream_url: &str,
    webhook_url: &str,
) -> Result<ConnectionModel> {
    handles
        .connections
        .create(NewConnection {
            name: "acme".to_string(),
            upstream_url: upstream_url.to_string(),
            upstream_db: "acme-prod".to_string(),
            upstream_username: "svc@acme.example".to_string(),
            api_key: "api-key-123".to_string(),
            webhook_url: webhook_url.to_string(),
            webhook_secret: Some("hook-secret".to_string()),
            store_id: "store-9".to_string(),
            client_id: "client-4".to_string(),
            poll_interval_seconds: 60,
            active: true,
        })
        .await
}

/// Wraps a result value in a JSON-RPC success reply.
#[allow(dead_code)]
pub fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": null,
        "result": result,
    }))
}

/// A JSON-RPC fault reply with the given nested message.
#[allow(dead_code)]
pub fn rpc_error(message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {
            "code": 200,
            "message": "Server Error",
            "data": {"message": message},
        },
    }))
}

/// Mounts a successful authentication reply.
#[allow(dead_code)]
pub async fn mount_auth_ok(server: &MockServer, session: i64) {
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_string_contains("\"service\":\"common\""))
        .respond_with(rpc_result(json!(session)))
        .mount(server)
        .await;
}

/// Mounts a `search_read` reply for the given model.
#[allow(dead_code)]
pub async fn mount_search_read(server: &MockServer, model: &str, records: Value) {
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_string_contains(format!("\"{model}\"")))
        .and(body_string_contains("search_read"))
        .respond_with(rpc_result(records))
        .mount(server)
        .await;
}

/// Mounts a `read` reply for the given model.
#[allow(dead_code)]
pub async fn mount_read(server: &MockServer, model: &str, records: Value) {
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_string_contains(format!("\"{model}\"")))
        .and(body_string_contains("\"read\""))
        .respond_with(rpc_result(records))
        .mount(server)
        .await;
}
