//! Poll scheduler.
//!
//! Spawns one supervised, long-lived task per active connection. Each task
//! owns its own upstream client and webhook dispatcher so a hung peer only
//! consumes its own task's resources. A panicking task is restarted with
//! exponential backoff; cancellation is observed at every suspension point,
//! so shutdown never leaves a partially logged cycle behind.

use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use sea_orm::DatabaseConnection;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::crypto::CryptoKey;
use crate::poller::breaker::Breaker;
use crate::poller::dispatcher::Dispatcher;
use crate::poller::worker::PollWorker;
use crate::repositories::{
    ConnectionRepository, RetryQueueRepository, SentOrderRepository, SyncLogRepository,
};
use crate::upstream::UpstreamClient;

/// First restart delay after a panicked task.
pub const RESTART_BACKOFF_BASE: Duration = Duration::from_secs(30);

/// Restart delay ceiling.
pub const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Delay before re-reading the connection after a transient store error.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Shared repository bundle handed to every connection task.
#[derive(Debug, Clone)]
pub struct EngineHandles {
    pub connections: ConnectionRepository,
    pub ledger: SentOrderRepository,
    pub retry_queue: RetryQueueRepository,
    pub sync_logs: SyncLogRepository,
}

impl EngineHandles {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self {
            connections: ConnectionRepository::new(db.clone(), crypto_key),
            ledger: SentOrderRepository::new(db.clone()),
            retry_queue: RetryQueueRepository::new(db.clone()),
            sync_logs: SyncLogRepository::new(db),
        }
    }
}

/// Supervises the per-connection poll tasks.
pub struct PollScheduler {
    handles: EngineHandles,
}

impl PollScheduler {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self::with_handles(EngineHandles::new(db, crypto_key))
    }

    pub fn with_handles(handles: EngineHandles) -> Self {
        Self { handles }
    }

    pub fn handles(&self) -> &EngineHandles {
        &self.handles
    }

    /// Runs until every task has exited, which happens after `shutdown`
    /// fires or once all connections are deactivated.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let connections = self.handles.connections.list_active().await?;
        info!(count = connections.len(), "starting poll scheduler");
        gauge!("poller_active_connections").set(connections.len() as f64);

        let mut tasks = Vec::with_capacity(connections.len());
        for connection in connections {
            let handles = self.handles.clone();
            let token = shutdown.clone();
            let connection_id = connection.id;
            let name = connection.name.clone();
            tasks.push(tokio::spawn(supervise_connection(
                handles,
                connection_id,
                name,
                token,
            )));
        }

        for task in tasks {
            let _ = task.await;
        }

        info!("poll scheduler stopped");
        Ok(())
    }
}

/// Keeps one connection's poll loop alive, restarting it with backoff when
/// it panics.
async fn supervise_connection(
    handles: EngineHandles,
    connection_id: Uuid,
    name: String,
    shutdown: CancellationToken,
) {
    let mut restart_delay = RESTART_BACKOFF_BASE;

    loop {
        let task = tokio::spawn(poll_loop(
            handles.clone(),
            connection_id,
            name.clone(),
            shutdown.clone(),
        ));

        match task.await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                let labels = vec![("connection", name.clone())];
                counter!("poller_task_restarts_total", &labels).increment(1);
                let delay = with_jitter(restart_delay);
                error!(
                    %connection_id,
                    connection = %name,
                    delay_secs = delay.as_secs(),
                    "poll task panicked, restarting"
                );

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(delay) => {}
                }
                restart_delay = (restart_delay * 2).min(RESTART_BACKOFF_MAX);
            }
            Err(_) => break,
        }

        if shutdown.is_cancelled() {
            break;
        }
    }
}

/// Small random spread so restarted tasks do not stampede together.
fn with_jitter(delay: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis().min(5_000) as u64);
    delay + Duration::from_millis(jitter_ms)
}

/// One connection's infinite poll loop: refresh the row, run a cycle, sleep
/// the cadence.
async fn poll_loop(
    handles: EngineHandles,
    connection_id: Uuid,
    name: String,
    shutdown: CancellationToken,
) {
    // Bulkhead: this task's HTTP clients are its own.
    let dispatcher = Dispatcher::new();
    let mut client: Option<UpstreamClient> = None;

    loop {
        if shutdown.is_cancelled() {
            debug!(%connection_id, "shutdown requested, stopping poll loop");
            break;
        }

        let connection = match handles.connections.get(connection_id).await {
            Ok(Some(connection)) if connection.active => connection,
            Ok(_) => {
                info!(%connection_id, connection = %name, "connection removed or deactivated, stopping");
                break;
            }
            Err(err) => {
                error!(%connection_id, error = %err, "failed to refresh connection");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(STORE_RETRY_DELAY) => continue,
                }
            }
        };

        let secrets = match handles.connections.credentials(&connection) {
            Ok(secrets) => secrets,
            Err(err) => {
                // Undecryptable credentials cannot heal on their own; an
                // operator has to re-enter them.
                error!(%connection_id, error = %err, "credential decryption failed, stopping poll loop");
                break;
            }
        };

        let needs_rebuild = client.as_ref().map_or(true, |existing| {
            !existing.matches(
                &connection.upstream_url,
                &connection.upstream_db,
                &connection.upstream_username,
                &secrets.api_key,
            )
        });
        if needs_rebuild {
            let mut fresh = UpstreamClient::new(
                &connection.upstream_url,
                &connection.upstream_db,
                &connection.upstream_username,
                &secrets.api_key,
            );
            fresh.load_session(connection.session_id);
            client = Some(fresh);
        }
        let Some(upstream) = client.as_mut() else {
            break;
        };

        let interval = Duration::from_secs(connection.poll_interval_seconds.max(1) as u64);
        let mut breaker = Breaker::from_connection(&connection);
        let mut worker = PollWorker::new(
            &connection,
            &secrets,
            upstream,
            &dispatcher,
            &mut breaker,
            &handles,
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(%connection_id, "cancelled mid-cycle");
                break;
            }
            result = worker.execute() => match result {
                Ok(log) => debug!(
                    %connection_id,
                    found = log.orders_found,
                    sent = log.orders_sent,
                    failed = log.orders_failed,
                    skipped = log.orders_skipped,
                    "cycle complete"
                ),
                Err(err) => error!(%connection_id, error = %err, "cycle bookkeeping failed"),
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }
}
