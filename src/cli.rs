//! Operator command surface.
//!
//! Everything routine is observable and fixable from here: connection CRUD,
//! probing a connection, tailing sync logs, inspecting and nudging the retry
//! queue, resetting a breaker and manually re-sending ledgered orders.

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use clap::Args;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::mapper::{map_order, MapContext, PLATFORM};
use crate::poller::batch::{fetch_order_batch, ORDER_FIELDS, ORDER_MODEL};
use crate::poller::dispatcher::Dispatcher;
use crate::poller::scheduler::{EngineHandles, PollScheduler};
use crate::repositories::connection::{ConnectionUpdate, NewConnection};
use crate::upstream::UpstreamClient;

/// Arguments for `add`.
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Display name for the connection
    #[arg(long)]
    pub name: String,
    /// Base URL of the upstream instance
    #[arg(long)]
    pub upstream_url: String,
    /// Upstream database identifier
    #[arg(long)]
    pub upstream_db: String,
    /// Upstream login user
    #[arg(long)]
    pub username: String,
    /// Upstream API key (stored encrypted)
    #[arg(long)]
    pub api_key: String,
    /// Webhook endpoint; falls back to POLLER_DEFAULT_WEBHOOK_URL
    #[arg(long)]
    pub webhook_url: Option<String>,
    /// Webhook shared secret (stored encrypted)
    #[arg(long)]
    pub webhook_secret: Option<String>,
    /// Downstream store correlation key
    #[arg(long, default_value = "")]
    pub store_id: String,
    /// Downstream client correlation key
    #[arg(long, default_value = "")]
    pub client_id: String,
    /// Poll interval in seconds
    #[arg(long, default_value_t = 60)]
    pub interval: i32,
    /// Create the connection deactivated
    #[arg(long)]
    pub disabled: bool,
}

/// Arguments for `edit`; omitted flags keep the current value.
#[derive(Args, Debug)]
pub struct EditArgs {
    /// Connection id
    pub id: Uuid,
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub upstream_url: Option<String>,
    #[arg(long)]
    pub upstream_db: Option<String>,
    #[arg(long)]
    pub username: Option<String>,
    #[arg(long)]
    pub api_key: Option<String>,
    #[arg(long)]
    pub webhook_url: Option<String>,
    #[arg(long)]
    pub webhook_secret: Option<String>,
    #[arg(long)]
    pub store_id: Option<String>,
    #[arg(long)]
    pub client_id: Option<String>,
    #[arg(long)]
    pub interval: Option<i32>,
    #[arg(long)]
    pub active: Option<bool>,
}

/// Runs the polling engine until SIGINT/SIGTERM.
pub async fn cmd_run(handles: EngineHandles) -> Result<()> {
    let active = handles.connections.list_active().await?;
    if active.is_empty() {
        println!("No active connections. Use `orderbridge add` to create one.");
        return Ok(());
    }

    println!(
        "Polling {} connection(s). Ctrl+C to stop.",
        active.len()
    );

    let shutdown = CancellationToken::new();
    let scheduler = PollScheduler::with_handles(handles);
    let mut engine = tokio::spawn(scheduler.run(shutdown.clone()));

    tokio::select! {
        _ = shutdown_signal() => {
            println!("\nStopping...");
            shutdown.cancel();
        }
        result = &mut engine => {
            result??;
            return Ok(());
        }
    }

    engine.await??;
    println!("Stopped.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub async fn cmd_add(handles: &EngineHandles, config: &AppConfig, args: AddArgs) -> Result<()> {
    let webhook_url = args
        .webhook_url
        .or_else(|| {
            (!config.default_webhook_url.is_empty()).then(|| config.default_webhook_url.clone())
        })
        .ok_or_else(|| {
            anyhow!("--webhook-url is required (or set POLLER_DEFAULT_WEBHOOK_URL)")
        })?;

    if args.interval < 1 {
        bail!("--interval must be a positive number of seconds");
    }

    url::Url::parse(&args.upstream_url)
        .map_err(|e| anyhow!("invalid --upstream-url '{}': {e}", args.upstream_url))?;
    url::Url::parse(&webhook_url)
        .map_err(|e| anyhow!("invalid webhook url '{webhook_url}': {e}"))?;

    let created = handles
        .connections
        .create(NewConnection {
            name: args.name,
            upstream_url: args.upstream_url,
            upstream_db: args.upstream_db,
            upstream_username: args.username,
            api_key: args.api_key,
            webhook_url,
            webhook_secret: args.webhook_secret,
            store_id: args.store_id,
            client_id: args.client_id,
            poll_interval_seconds: args.interval,
            active: !args.disabled,
        })
        .await?;

    println!("Connection created: {}", created.id);
    Ok(())
}

pub async fn cmd_list(handles: &EngineHandles) -> Result<()> {
    let connections = handles.connections.list_all().await?;
    if connections.is_empty() {
        println!("No connections configured. Use `orderbridge add` to create one.");
        return Ok(());
    }

    let rows = connections
        .iter()
        .map(|c| {
            vec![
                c.id.to_string(),
                c.name.clone(),
                c.upstream_url.clone(),
                c.upstream_db.clone(),
                format!("{}s", c.poll_interval_seconds),
                if c.active { "ON" } else { "OFF" }.to_string(),
                c.breaker_state.clone(),
                c.last_sync_at.clone().unwrap_or_else(|| "never".to_string()),
            ]
        })
        .collect();

    print_table(
        &["ID", "Name", "URL", "DB", "Interval", "Active", "Breaker", "Last Sync"],
        rows,
    );
    Ok(())
}

pub async fn cmd_edit(handles: &EngineHandles, args: EditArgs) -> Result<()> {
    let updated = handles
        .connections
        .update(
            args.id,
            ConnectionUpdate {
                name: args.name,
                upstream_url: args.upstream_url,
                upstream_db: args.upstream_db,
                upstream_username: args.username,
                api_key: args.api_key,
                webhook_url: args.webhook_url,
                webhook_secret: args.webhook_secret,
                store_id: args.store_id,
                client_id: args.client_id,
                poll_interval_seconds: args.interval,
                active: args.active,
            },
        )
        .await?;

    println!("Connection '{}' updated.", updated.id);
    Ok(())
}

pub async fn cmd_delete(handles: &EngineHandles, id: Uuid, yes: bool) -> Result<()> {
    let connection = handles
        .connections
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("connection '{id}' not found"))?;

    if !yes {
        bail!(
            "refusing to delete '{}' ({}) without --yes; dependent ledger, retry and log rows cascade",
            connection.name,
            id
        );
    }

    handles.connections.delete(id).await?;
    println!("Connection '{}' deleted.", connection.name);
    Ok(())
}

/// Probes both sides of a connection: upstream authentication and a test
/// POST against the webhook.
pub async fn cmd_test(handles: &EngineHandles, id: Uuid) -> Result<()> {
    let connection = handles
        .connections
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("connection '{id}' not found"))?;
    let secrets = handles.connections.credentials(&connection)?;

    println!("Testing upstream for '{}'...", connection.name);
    let mut client = UpstreamClient::new(
        &connection.upstream_url,
        &connection.upstream_db,
        &connection.upstream_username,
        &secrets.api_key,
    );
    let mut failed = false;
    match client.authenticate().await {
        Ok(session) => println!("  Upstream OK - session: {session}"),
        Err(err) => {
            println!("  Upstream ERROR: {err}");
            failed = true;
        }
    }

    if !connection.webhook_url.is_empty() {
        println!("Testing webhook...");
        let dispatcher = Dispatcher::new();
        let payload = json!({
            "event": "connection.test",
            "source": {
                "platform": PLATFORM,
                "connection_id": connection.id.to_string(),
                "store_id": connection.store_id,
                "client_id": connection.client_id,
            },
            "connection_name": connection.name,
        });

        match dispatcher
            .send(
                &connection.webhook_url,
                &payload,
                &secrets.webhook_secret,
                connection.id,
            )
            .await
        {
            Ok(()) => println!("  Webhook OK"),
            Err(err) => {
                println!("  Webhook ERROR: {err}");
                failed = true;
            }
        }
    }

    if failed {
        bail!("connection test failed");
    }
    Ok(())
}

pub async fn cmd_logs(
    handles: &EngineHandles,
    connection: Option<Uuid>,
    limit: u64,
) -> Result<()> {
    let logs = match connection {
        Some(id) => handles.sync_logs.list_by_connection(id, limit).await?,
        None => handles.sync_logs.list_recent(limit).await?,
    };

    let rows = logs
        .iter()
        .map(|log| {
            vec![
                log.id.to_string(),
                log.connection_id.to_string(),
                log.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                log.orders_found.to_string(),
                log.orders_sent.to_string(),
                log.orders_failed.to_string(),
                log.orders_skipped.to_string(),
                format!("{}ms", log.duration_ms),
                format!("{}>{}", log.breaker_state_entry, log.breaker_state_exit),
                log.error_message.clone().unwrap_or_default(),
            ]
        })
        .collect();

    print_table(
        &["ID", "Conn", "Started", "Found", "Sent", "Failed", "Skip", "Took", "Breaker", "Error"],
        rows,
    );
    Ok(())
}

pub async fn cmd_retries(handles: &EngineHandles, connection: Option<Uuid>) -> Result<()> {
    let items = match connection {
        Some(id) => handles.retry_queue.list_by_connection(id, 100).await?,
        None => handles.retry_queue.list_recent(100).await?,
    };

    let rows = items
        .iter()
        .map(|item| {
            vec![
                item.id.to_string(),
                item.connection_id.to_string(),
                item.external_id.clone(),
                item.status.clone(),
                format!("{}/{}", item.attempts, item.max_attempts),
                item.next_retry_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                item.last_error.clone().unwrap_or_default(),
            ]
        })
        .collect();

    print_table(
        &["ID", "Conn", "Order", "Status", "Attempts", "Next Retry", "Error"],
        rows,
    );
    Ok(())
}

pub async fn cmd_retry_now(handles: &EngineHandles, id: i64) -> Result<()> {
    handles.retry_queue.force_due(id, Utc::now()).await?;
    println!("Retry #{id} marked for immediate re-attempt.");
    Ok(())
}

pub async fn cmd_discard(handles: &EngineHandles, id: i64) -> Result<()> {
    handles.retry_queue.discard(id).await?;
    println!("Retry #{id} discarded.");
    Ok(())
}

pub async fn cmd_reset_breaker(handles: &EngineHandles, id: Uuid) -> Result<()> {
    let connection = handles
        .connections
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("connection '{id}' not found"))?;

    handles
        .connections
        .update_breaker(id, "closed", 0, 0, None)
        .await?;
    println!("Breaker for '{}' reset to closed.", connection.name);
    Ok(())
}

/// Manual re-send of the last `last` ledgered orders. Operator action
/// overrides dedupe: the ledger is not consulted before sending.
pub async fn cmd_send(handles: &EngineHandles, id: Uuid, last: u64) -> Result<()> {
    let connection = handles
        .connections
        .get(id)
        .await?
        .ok_or_else(|| anyhow!("connection '{id}' not found"))?;
    let secrets = handles.connections.credentials(&connection)?;

    let ledgered = handles.ledger.list_by_connection(id, last.max(1)).await?;
    if ledgered.is_empty() {
        println!("No ledgered orders for '{}'.", connection.name);
        return Ok(());
    }

    println!(
        "Re-sending {} order(s) for '{}'...",
        ledgered.len(),
        connection.name
    );

    let mut client = UpstreamClient::new(
        &connection.upstream_url,
        &connection.upstream_db,
        &connection.upstream_username,
        &secrets.api_key,
    );
    client.authenticate().await?;
    let dispatcher = Dispatcher::new();

    let ctx = MapContext {
        connection_id: connection.id,
        upstream_db: &connection.upstream_db,
        store_id: &connection.store_id,
        client_id: &connection.client_id,
    };

    let mut ok = 0usize;
    let mut failed = 0usize;
    for entry in &ledgered {
        let label = if entry.order_number.is_empty() {
            entry.order_id.to_string()
        } else {
            entry.order_number.clone()
        };

        let orders = client
            .search_read(
                ORDER_MODEL,
                json!([["id", "=", entry.order_id]]),
                &ORDER_FIELDS,
                None,
                None,
            )
            .await?;
        let Some(order) = orders.first() else {
            println!("  {label}: no longer present upstream, skipping.");
            failed += 1;
            continue;
        };

        let batch = fetch_order_batch(&mut client, &[order]).await?;
        let envelope = match map_order(order, &batch, &ctx) {
            Ok(envelope) => envelope,
            Err(err) => {
                println!("  {label}: ERROR - {err}");
                failed += 1;
                continue;
            }
        };
        let payload = serde_json::to_value(&envelope)?;

        match dispatcher
            .send(
                &connection.webhook_url,
                &payload,
                &secrets.webhook_secret,
                connection.id,
            )
            .await
        {
            Ok(()) => {
                println!("  {label}: OK");
                ok += 1;
            }
            Err(err) => {
                println!("  {label}: ERROR - {err}");
                failed += 1;
            }
        }
    }

    println!("\nSummary: {ok} sent, {failed} failed.");
    Ok(())
}

fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    if rows.is_empty() {
        println!("  (no results)");
        return;
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let format_row = |cells: Vec<String>| {
        cells
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:<width$}", cell, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
    };

    println!(
        "{}",
        format_row(headers.iter().map(|h| h.to_string()).collect())
    );
    println!(
        "{}",
        format_row(widths.iter().map(|w| "-".repeat(*w)).collect())
    );
    for row in rows {
        println!("{}", format_row(row));
    }
}
