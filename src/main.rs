//! # Order Bridge Main Entry Point
//!
//! Operator CLI and the `run` command that starts the polling engine.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use orderbridge::cli::{self, AddArgs, EditArgs};
use orderbridge::config::ConfigLoader;
use orderbridge::crypto::CryptoKey;
use orderbridge::db;
use orderbridge::poller::scheduler::EngineHandles;
use orderbridge::telemetry;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "orderbridge")]
#[command(about = "Multi-tenant bridge polling upstream sales orders into downstream webhooks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start polling all active connections
    Run,
    /// Add a new connection
    Add(AddArgs),
    /// List all connections
    List,
    /// Edit an existing connection
    Edit(EditArgs),
    /// Delete a connection and its dependent rows
    Delete {
        id: Uuid,
        /// Confirm the cascade delete
        #[arg(long)]
        yes: bool,
    },
    /// Probe a connection's upstream credentials and webhook
    Test { id: Uuid },
    /// Show sync logs
    Logs {
        #[arg(short, long)]
        connection: Option<Uuid>,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: u64,
    },
    /// Show the retry queue
    Retries {
        #[arg(short, long)]
        connection: Option<Uuid>,
    },
    /// Make a retry item due immediately
    Retry { id: i64 },
    /// Discard a retry item
    Discard { id: i64 },
    /// Reset a connection's circuit breaker to closed
    ResetBreaker { id: Uuid },
    /// Manually re-send the last N ledgered orders
    Send {
        #[arg(short, long)]
        connection: Uuid,
        #[arg(long, default_value_t = 1)]
        last: u64,
    },
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Cli::parse();

    let config = ConfigLoader::new().load()?;
    telemetry::init_tracing(&config)?;

    let crypto_key = CryptoKey::from_base64(&config.encryption_key)?;
    let store = Arc::new(db::init_store(&config.db_path).await?);
    let handles = EngineHandles::new(store.clone(), crypto_key);

    let result = match args.command {
        Commands::Run => cli::cmd_run(handles.clone()).await,
        Commands::Add(add) => cli::cmd_add(&handles, &config, add).await,
        Commands::List => cli::cmd_list(&handles).await,
        Commands::Edit(edit) => cli::cmd_edit(&handles, edit).await,
        Commands::Delete { id, yes } => cli::cmd_delete(&handles, id, yes).await,
        Commands::Test { id } => cli::cmd_test(&handles, id).await,
        Commands::Logs { connection, limit } => cli::cmd_logs(&handles, connection, limit).await,
        Commands::Retries { connection } => cli::cmd_retries(&handles, connection).await,
        Commands::Retry { id } => cli::cmd_retry_now(&handles, id).await,
        Commands::Discard { id } => cli::cmd_discard(&handles, id).await,
        Commands::ResetBreaker { id } => cli::cmd_reset_breaker(&handles, id).await,
        Commands::Send { connection, last } => cli::cmd_send(&handles, connection, last).await,
    };

    drop(handles);
    if let Ok(store) = Arc::try_unwrap(store) {
        let _ = store.close().await;
    }

    result
}
