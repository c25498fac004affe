//! Connection repository for database operations
//!
//! Encapsulates SeaORM operations for the connections table, including the
//! credential encryption adapter: secrets enter as cleartext, are stored as
//! AES-256-GCM ciphertext bound to the owning row, and come back out as
//! cleartext through [`ConnectionRepository::credentials`].

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::{decrypt_secret, encrypt_secret, CryptoKey};
use crate::models::connection::{self, Entity as Connection};

const API_KEY_FIELD: &str = "api_key";
const WEBHOOK_SECRET_FIELD: &str = "webhook_secret";

/// Cleartext credentials for one connection.
#[derive(Debug, Clone)]
pub struct ConnectionSecrets {
    pub api_key: String,
    pub webhook_secret: String,
}

/// Parameters for creating a connection.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub name: String,
    pub upstream_url: String,
    pub upstream_db: String,
    pub upstream_username: String,
    pub api_key: String,
    pub webhook_url: String,
    pub webhook_secret: Option<String>,
    pub store_id: String,
    pub client_id: String,
    pub poll_interval_seconds: i32,
    pub active: bool,
}

/// Partial update for operator edits; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct ConnectionUpdate {
    pub name: Option<String>,
    pub upstream_url: Option<String>,
    pub upstream_db: Option<String>,
    pub upstream_username: Option<String>,
    pub api_key: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub store_id: Option<String>,
    pub client_id: Option<String>,
    pub poll_interval_seconds: Option<i32>,
    pub active: Option<bool>,
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    pub db: Arc<DatabaseConnection>,
    crypto_key: CryptoKey,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    /// Lists every connection ordered by name.
    pub async fn list_all(&self) -> Result<Vec<connection::Model>> {
        Ok(Connection::find()
            .order_by_asc(connection::Column::Name)
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Lists the connections the scheduler should run tasks for.
    pub async fn list_active(&self) -> Result<Vec<connection::Model>> {
        Ok(Connection::find()
            .filter(connection::Column::Active.eq(true))
            .order_by_asc(connection::Column::Name)
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(id).one(&*self.db).await?)
    }

    /// Creates a connection, encrypting the supplied secrets.
    pub async fn create(&self, params: NewConnection) -> Result<connection::Model> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let api_key_ciphertext = encrypt_secret(&self.crypto_key, id, API_KEY_FIELD, &params.api_key)
            .map_err(|e| anyhow!("api key encryption failed: {e}"))?;

        let webhook_secret_ciphertext = params
            .webhook_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|secret| encrypt_secret(&self.crypto_key, id, WEBHOOK_SECRET_FIELD, secret))
            .transpose()
            .map_err(|e| anyhow!("webhook secret encryption failed: {e}"))?;

        let active = connection::ActiveModel {
            id: Set(id),
            name: Set(params.name),
            upstream_url: Set(params.upstream_url),
            upstream_db: Set(params.upstream_db),
            upstream_username: Set(params.upstream_username),
            api_key_ciphertext: Set(api_key_ciphertext),
            session_id: Set(None),
            webhook_url: Set(params.webhook_url),
            webhook_secret_ciphertext: Set(webhook_secret_ciphertext),
            store_id: Set(params.store_id),
            client_id: Set(params.client_id),
            poll_interval_seconds: Set(params.poll_interval_seconds),
            active: Set(params.active),
            last_sync_at: Set(None),
            breaker_state: Set("closed".to_string()),
            breaker_failure_count: Set(0),
            breaker_half_open_successes: Set(0),
            breaker_retry_at: Set(None),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        active.insert(&*self.db).await?;

        let fetched = Connection::find_by_id(id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("connection not persisted"))
    }

    /// Applies an operator edit; only supplied fields change.
    pub async fn update(&self, id: Uuid, update: ConnectionUpdate) -> Result<connection::Model> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("connection '{id}' not found"))?;

        let mut model: connection::ActiveModel = existing.into();

        if let Some(name) = update.name {
            model.name = Set(name);
        }
        if let Some(url) = update.upstream_url {
            model.upstream_url = Set(url);
        }
        if let Some(db_name) = update.upstream_db {
            model.upstream_db = Set(db_name);
        }
        if let Some(username) = update.upstream_username {
            model.upstream_username = Set(username);
        }
        if let Some(api_key) = update.api_key.filter(|k| !k.is_empty()) {
            let ciphertext = encrypt_secret(&self.crypto_key, id, API_KEY_FIELD, &api_key)
                .map_err(|e| anyhow!("api key encryption failed: {e}"))?;
            model.api_key_ciphertext = Set(ciphertext);
            // Credentials changed; the cached session is no longer valid.
            model.session_id = Set(None);
        }
        if let Some(url) = update.webhook_url {
            model.webhook_url = Set(url);
        }
        if let Some(secret) = update.webhook_secret {
            let ciphertext = if secret.is_empty() {
                None
            } else {
                Some(
                    encrypt_secret(&self.crypto_key, id, WEBHOOK_SECRET_FIELD, &secret)
                        .map_err(|e| anyhow!("webhook secret encryption failed: {e}"))?,
                )
            };
            model.webhook_secret_ciphertext = Set(ciphertext);
        }
        if let Some(store_id) = update.store_id {
            model.store_id = Set(store_id);
        }
        if let Some(client_id) = update.client_id {
            model.client_id = Set(client_id);
        }
        if let Some(interval) = update.poll_interval_seconds {
            model.poll_interval_seconds = Set(interval.max(1));
        }
        if let Some(active) = update.active {
            model.active = Set(active);
        }
        model.updated_at = Set(Utc::now().into());

        Ok(model.update(&*self.db).await?)
    }

    /// Deletes a connection; dependent rows cascade.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = Connection::delete_by_id(id).exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return Err(anyhow!("connection '{id}' not found"));
        }
        Ok(())
    }

    /// Decrypts the secrets of a connection row.
    pub fn credentials(&self, connection: &connection::Model) -> Result<ConnectionSecrets> {
        let api_key = decrypt_secret(
            &self.crypto_key,
            connection.id,
            API_KEY_FIELD,
            &connection.api_key_ciphertext,
        )
        .map_err(|e| anyhow!("api key decryption failed for '{}': {e}", connection.id))?;

        let webhook_secret = match connection.webhook_secret_ciphertext.as_deref() {
            Some(ciphertext) => decrypt_secret(
                &self.crypto_key,
                connection.id,
                WEBHOOK_SECRET_FIELD,
                ciphertext,
            )
            .map_err(|e| {
                anyhow!(
                    "webhook secret decryption failed for '{}': {e}",
                    connection.id
                )
            })?,
            None => String::new(),
        };

        Ok(ConnectionSecrets {
            api_key,
            webhook_secret,
        })
    }

    /// Persists the breaker fields after a cycle.
    pub async fn update_breaker(
        &self,
        id: Uuid,
        state: &str,
        failure_count: i32,
        half_open_successes: i32,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let existing = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow!("connection '{id}' not found"))?;

        let mut model: connection::ActiveModel = existing.into();
        model.breaker_state = Set(state.to_string());
        model.breaker_failure_count = Set(failure_count);
        model.breaker_half_open_successes = Set(half_open_successes);
        model.breaker_retry_at = Set(retry_at.map(Into::into));
        model.updated_at = Set(Utc::now().into());
        model.update(&*self.db).await?;

        Ok(())
    }

    /// Advances the high-water mark. The guard keeps the cursor monotonic:
    /// a stale writer can never move it backwards. Returns whether a row
    /// was updated.
    pub async fn update_last_sync_at(&self, id: Uuid, watermark: &str) -> Result<bool> {
        let result = Connection::update_many()
            .col_expr(connection::Column::LastSyncAt, Expr::value(watermark))
            .col_expr(
                connection::Column::UpdatedAt,
                Expr::value(sea_orm::prelude::DateTimeWithTimeZone::from(Utc::now())),
            )
            .filter(connection::Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(connection::Column::LastSyncAt.is_null())
                    .add(connection::Column::LastSyncAt.lt(watermark)),
            )
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected > 0)
    }

    /// Caches the upstream session id on the row.
    pub async fn update_session_id(&self, id: Uuid, session_id: Option<i64>) -> Result<()> {
        Connection::update_many()
            .col_expr(connection::Column::SessionId, Expr::value(session_id))
            .filter(connection::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }
}
