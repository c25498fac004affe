//! One poll cycle for one connection.
//!
//! The cycle is: gate on the breaker, ensure an upstream session, seed the
//! ledger on first run, fetch candidates past the cursor, dedupe against the
//! ledger, prefetch dependencies, dispatch in write-date order, advance the
//! cursor over durably handled orders, trim the ledger, sweep due retries,
//! then finalize the breaker and append the cycle log.
//!
//! Per-order webhook failures are normal: they land in the retry queue and
//! never abort the cycle or count against the breaker. Only hard upstream
//! faults do.

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::mapper::{map_order, MapContext};
use crate::models::connection::Model as ConnectionModel;
use crate::models::retry_item::Model as RetryItemModel;
use crate::models::sync_log::Model as SyncLogModel;
use crate::poller::batch::{fetch_order_batch, ORDER_FIELDS, ORDER_MODEL};
use crate::poller::breaker::{Breaker, BreakerState};
use crate::poller::dispatcher::{backoff_seconds, truncate_body, Dispatcher};
use crate::poller::scheduler::EngineHandles;
use crate::repositories::connection::ConnectionSecrets;
use crate::repositories::retry_queue::{EnqueueOutcome, NewRetryItem};
use crate::repositories::sent_order::LEDGER_LIMIT;
use crate::repositories::sync_log::NewSyncLog;
use crate::upstream::{format_write_date, Record, UpstreamClient, UpstreamError};

/// Candidate fetch ceiling per cycle; anything beyond is picked up next
/// cycle because the cursor only advances over handled orders.
pub const FETCH_LIMIT: u32 = 100;

/// Orders registered during the seed cycle, matching the ledger cap.
pub const SEED_LIMIT: u32 = LEDGER_LIMIT as u32;

#[derive(Debug, Default)]
struct CycleCounters {
    found: i32,
    sent: i32,
    failed: i32,
    skipped: i32,
}

/// Cycle-aborting failures, split by how the breaker must react.
#[derive(Debug)]
enum CycleError {
    /// Upstream asked us to back off; the breaker is left untouched.
    RateLimited,
    /// Hard upstream fault (transport, auth, malformed reply).
    Upstream(UpstreamError),
    /// The durable store misbehaved.
    Store(anyhow::Error),
}

impl From<UpstreamError> for CycleError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited => CycleError::RateLimited,
            other => CycleError::Upstream(other),
        }
    }
}

impl From<anyhow::Error> for CycleError {
    fn from(err: anyhow::Error) -> Self {
        CycleError::Store(err)
    }
}

/// Executes poll cycles for one connection.
pub struct PollWorker<'a> {
    connection: &'a ConnectionModel,
    secrets: &'a ConnectionSecrets,
    client: &'a mut UpstreamClient,
    dispatcher: &'a Dispatcher,
    breaker: &'a mut Breaker,
    store: &'a EngineHandles,
}

impl<'a> PollWorker<'a> {
    pub fn new(
        connection: &'a ConnectionModel,
        secrets: &'a ConnectionSecrets,
        client: &'a mut UpstreamClient,
        dispatcher: &'a Dispatcher,
        breaker: &'a mut Breaker,
        store: &'a EngineHandles,
    ) -> Self {
        Self {
            connection,
            secrets,
            client,
            dispatcher,
            breaker,
            store,
        }
    }

    /// Runs one cycle and appends its log entry.
    #[instrument(skip_all, fields(connection_id = %self.connection.id, connection = %self.connection.name))]
    pub async fn execute(&mut self) -> anyhow::Result<SyncLogModel> {
        let started_at = Utc::now();
        let timer = std::time::Instant::now();
        let entry_state = self.breaker.state();
        let mut counters = CycleCounters::default();

        if !self.breaker.allow(started_at) {
            info!(retry_at = ?self.breaker.retry_at(), "breaker open, skipping cycle");
            return self
                .append_log(
                    started_at,
                    timer,
                    entry_state,
                    &counters,
                    Some("breaker open; cycle skipped".to_string()),
                )
                .await;
        }

        let error_message = match self.run_cycle(&mut counters).await {
            Ok(()) => {
                self.breaker.record_success();
                None
            }
            Err(CycleError::RateLimited) => {
                warn!("upstream rate limited, aborting cycle");
                Some("upstream rate limited; cycle aborted".to_string())
            }
            Err(CycleError::Upstream(err)) => {
                error!(error = %err, "cycle failed against upstream");
                self.breaker.record_failure(Utc::now());
                Some(err.to_string())
            }
            Err(CycleError::Store(err)) => {
                error!(error = %err, "cycle failed against the store");
                self.breaker.record_failure(Utc::now());
                Some(err.to_string())
            }
        };

        self.store
            .connections
            .update_breaker(
                self.connection.id,
                self.breaker.state().as_str(),
                self.breaker.failure_count(),
                self.breaker.half_open_successes(),
                self.breaker.retry_at(),
            )
            .await?;

        let labels = vec![("connection", self.connection.name.clone())];
        counter!("poller_cycles_total", &labels).increment(1);
        counter!("poller_orders_sent_total", &labels).increment(counters.sent.max(0) as u64);
        counter!("poller_orders_failed_total", &labels).increment(counters.failed.max(0) as u64);
        histogram!("poller_cycle_duration_ms", &labels)
            .record(timer.elapsed().as_secs_f64() * 1_000.0);

        self.append_log(started_at, timer, entry_state, &counters, error_message)
            .await
    }

    async fn run_cycle(&mut self, counters: &mut CycleCounters) -> Result<(), CycleError> {
        let session = self.client.ensure_session().await?;
        if self.connection.session_id != Some(session) {
            self.store
                .connections
                .update_session_id(self.connection.id, Some(session))
                .await?;
        }

        let Some(last_sync_at) = self.connection.last_sync_at.clone() else {
            return self.run_seed(counters).await;
        };

        let domain = json!([
            ["state", "in", ["sale", "done"]],
            ["write_date", ">", last_sync_at],
        ]);
        let orders = self
            .client
            .search_read(
                ORDER_MODEL,
                domain,
                &ORDER_FIELDS,
                Some("write_date asc"),
                Some(FETCH_LIMIT),
            )
            .await?;
        counters.found = orders.len() as i32;

        let sent_keys = self.store.ledger.sent_keys(self.connection.id).await?;
        let candidates: Vec<&Record> = orders
            .iter()
            .filter(|order| match order.id() {
                Some(id) => !sent_keys.contains(&(id, order.text_or_empty("write_date"))),
                None => true,
            })
            .collect();
        counters.skipped = counters.found - candidates.len() as i32;

        if !candidates.is_empty() {
            let batch = fetch_order_batch(self.client, &candidates).await?;
            let ctx = MapContext {
                connection_id: self.connection.id,
                upstream_db: &self.connection.upstream_db,
                store_id: &self.connection.store_id,
                client_id: &self.connection.client_id,
            };

            // Highest write_date among orders that are durably accounted
            // for, either ledgered or parked in the retry queue. Orders that
            // failed before reaching durability hold the cursor back so the
            // next cycle re-fetches them.
            let mut watermark: Option<String> = None;

            for order in &candidates {
                let write_date = order.text_or_empty("write_date");

                let envelope = match map_order(order, &batch, &ctx) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        counters.failed += 1;
                        warn!(error = %err, "order rejected by mapper, skipping");
                        continue;
                    }
                };

                let payload = serde_json::to_value(&envelope)
                    .map_err(|e| CycleError::Store(anyhow!("envelope serialization: {e}")))?;

                match self
                    .dispatcher
                    .send(
                        &self.connection.webhook_url,
                        &payload,
                        &self.secrets.webhook_secret,
                        self.connection.id,
                    )
                    .await
                {
                    Ok(()) => {
                        self.store
                            .ledger
                            .mark_sent(
                                self.connection.id,
                                order.id().unwrap_or_default(),
                                &envelope.order.platform_order_number,
                                &write_date,
                            )
                            .await?;
                        counters.sent += 1;
                        raise_watermark(&mut watermark, &write_date);
                    }
                    Err(err) => {
                        counters.failed += 1;
                        warn!(
                            order = %envelope.order.platform_order_number,
                            error = %err,
                            "webhook dispatch failed, queueing retry"
                        );

                        let outcome = self
                            .store
                            .retry_queue
                            .enqueue(NewRetryItem {
                                connection_id: self.connection.id,
                                order_id: order.id().unwrap_or_default(),
                                external_id: envelope.external_id.clone(),
                                write_date: write_date.clone(),
                                payload: payload.to_string(),
                                next_retry_at: Utc::now() + Duration::seconds(backoff_seconds(1)),
                                last_error: Some(err.to_string()),
                            })
                            .await?;

                        if matches!(outcome, EnqueueOutcome::DuplicatePending) {
                            debug!(
                                order = %envelope.order.platform_order_number,
                                "retry already pending for order"
                            );
                        }
                        // Queued or already queued: either way the order is
                        // durable, so it no longer holds the cursor back.
                        raise_watermark(&mut watermark, &write_date);
                    }
                }
            }

            if let Some(watermark) = watermark {
                self.store
                    .connections
                    .update_last_sync_at(self.connection.id, &watermark)
                    .await?;
            }
        }

        self.store
            .ledger
            .trim_to_limit(self.connection.id, LEDGER_LIMIT)
            .await?;

        self.process_retries().await?;

        Ok(())
    }

    /// First cycle of an uninitialized connection: register the most recent
    /// orders in the ledger without dispatching anything, and set the cursor
    /// so polling starts from here.
    async fn run_seed(&mut self, counters: &mut CycleCounters) -> Result<(), CycleError> {
        info!(limit = SEED_LIMIT, "seeding ledger for first sync");

        let domain = json!([["state", "in", ["sale", "done"]]]);
        let orders = self
            .client
            .search_read(
                ORDER_MODEL,
                domain,
                &ORDER_FIELDS,
                Some("write_date desc"),
                Some(SEED_LIMIT),
            )
            .await?;

        counters.found = orders.len() as i32;
        counters.skipped = counters.found;

        let mut watermark: Option<String> = None;
        for order in &orders {
            let Some(order_id) = order.id() else { continue };
            let write_date = order.text_or_empty("write_date");
            self.store
                .ledger
                .mark_sent(
                    self.connection.id,
                    order_id,
                    order.text("name").unwrap_or_default(),
                    &write_date,
                )
                .await?;
            raise_watermark(&mut watermark, &write_date);
        }

        let watermark = watermark.unwrap_or_else(|| format_write_date(Utc::now()));
        self.store
            .connections
            .update_last_sync_at(self.connection.id, &watermark)
            .await?;

        info!(
            orders = counters.found,
            cursor = %watermark,
            "seed complete, no webhooks dispatched"
        );
        Ok(())
    }

    /// Re-attempts due retry items, oldest due first.
    async fn process_retries(&mut self) -> Result<(), CycleError> {
        let now = Utc::now();
        let due = self
            .store
            .retry_queue
            .due_items(self.connection.id, now)
            .await?;

        for item in due {
            let payload: Value = match serde_json::from_str(&item.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(item_id = item.id, error = %err, "retry payload unreadable, failing item");
                    self.store
                        .retry_queue
                        .mark_failed(item.id, Some(format!("unreadable payload: {err}")))
                        .await?;
                    continue;
                }
            };

            match self
                .dispatcher
                .send(
                    &self.connection.webhook_url,
                    &payload,
                    &self.secrets.webhook_secret,
                    self.connection.id,
                )
                .await
            {
                Ok(()) => {
                    self.store
                        .ledger
                        .mark_sent(
                            self.connection.id,
                            item.order_id,
                            order_number_from_payload(&payload),
                            &item.write_date,
                        )
                        .await?;
                    self.store.retry_queue.mark_success(item.id).await?;
                    info!(
                        item_id = item.id,
                        external_id = %item.external_id,
                        attempts = item.attempts,
                        "retry delivered"
                    );
                }
                Err(err) => {
                    self.record_retry_failure(&item, now, &err.to_string())
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn record_retry_failure(
        &mut self,
        item: &RetryItemModel,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<(), CycleError> {
        let attempts = item.attempts + 1;
        let error = truncate_body(error);

        if attempts >= item.max_attempts {
            error!(
                item_id = item.id,
                external_id = %item.external_id,
                attempts,
                %error,
                "retries exhausted, operator action required"
            );
            self.store
                .retry_queue
                .mark_failed(item.id, Some(error))
                .await?;
        } else {
            let next_retry_at = now + Duration::seconds(backoff_seconds(attempts));
            warn!(
                item_id = item.id,
                external_id = %item.external_id,
                attempts,
                next_retry_at = %next_retry_at,
                %error,
                "retry failed, rescheduled"
            );
            self.store
                .retry_queue
                .reschedule(item.id, attempts, next_retry_at, Some(error))
                .await?;
        }

        Ok(())
    }

    async fn append_log(
        &self,
        started_at: DateTime<Utc>,
        timer: std::time::Instant,
        entry_state: BreakerState,
        counters: &CycleCounters,
        error_message: Option<String>,
    ) -> anyhow::Result<SyncLogModel> {
        self.store
            .sync_logs
            .append(NewSyncLog {
                connection_id: self.connection.id,
                started_at,
                orders_found: counters.found,
                orders_sent: counters.sent,
                orders_failed: counters.failed,
                orders_skipped: counters.skipped,
                duration_ms: timer.elapsed().as_millis() as i64,
                error_message,
                breaker_state_entry: entry_state.as_str().to_string(),
                breaker_state_exit: self.breaker.state().as_str().to_string(),
            })
            .await
    }
}

fn raise_watermark(watermark: &mut Option<String>, write_date: &str) {
    if write_date.is_empty() {
        return;
    }
    match watermark {
        Some(current) if current.as_str() >= write_date => {}
        _ => *watermark = Some(write_date.to_string()),
    }
}

fn order_number_from_payload(payload: &Value) -> &str {
    payload
        .get("order")
        .and_then(|order| order.get("platform_order_number"))
        .and_then(Value::as_str)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_tracks_the_maximum() {
        let mut watermark = None;
        raise_watermark(&mut watermark, "2025-01-15 10:00:00");
        raise_watermark(&mut watermark, "2025-01-15 09:00:00");
        raise_watermark(&mut watermark, "");
        assert_eq!(watermark.as_deref(), Some("2025-01-15 10:00:00"));

        raise_watermark(&mut watermark, "2025-01-15 11:00:00");
        assert_eq!(watermark.as_deref(), Some("2025-01-15 11:00:00"));
    }

    #[test]
    fn order_number_is_read_from_the_envelope() {
        let payload = json!({"order": {"platform_order_number": "S00042"}});
        assert_eq!(order_number_from_payload(&payload), "S00042");
        assert_eq!(order_number_from_payload(&json!({})), "");
    }
}
