//! TradeSync CLI - Command line interface for integration syncs.
//!
//! This tool wires an orchestrator against an external-system endpoint,
//! triggers a sync and streams lifecycle events until the run finishes.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use tradesync_client::{Connection, ErpClient, HttpErpClient, MockErpClient};
use tradesync_common::IntegrationId;
use tradesync_orchestrator::{Orchestrator, OrchestratorConfig};
use tradesync_store::{
    Integration, MemoryQueue, MemoryRegistry, MemoryStateStore, SqliteStateStore, StateStore,
};

#[derive(Parser)]
#[command(name = "tradesync")]
#[command(about = "TradeSync - Integration sync job orchestration")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a sync against an external endpoint and wait for the outcome.
    Sync {
        /// Base URL of the external system's API publication.
        #[arg(short, long)]
        url: String,

        /// API key for the endpoint.
        #[arg(short = 'k', long)]
        api_key: Option<String>,

        /// Trigger token; duplicate tokens join the in-flight run.
        #[arg(short, long)]
        token: Option<String>,

        /// Path to the run database; in-memory when omitted.
        #[arg(long)]
        state_db: Option<PathBuf>,

        /// Maximum sync attempts.
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,

        /// Deadline for one external call, in seconds.
        #[arg(long, default_value_t = 30)]
        deadline: u64,

        /// Use the built-in mock endpoint instead of HTTP.
        #[arg(long)]
        mock: bool,
    },

    /// Probe an external endpoint for liveness.
    Health {
        /// Base URL of the external system's API publication.
        #[arg(short, long)]
        url: String,

        /// API key for the endpoint.
        #[arg(short = 'k', long)]
        api_key: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    match cli.command {
        Commands::Sync {
            url,
            api_key,
            token,
            state_db,
            max_attempts,
            deadline,
            mock,
        } => run_sync(url, api_key, token, state_db, max_attempts, deadline, mock).await,
        Commands::Health { url, api_key } => {
            let client = HttpErpClient::new();
            let conn = Connection::new(url, api_key);
            let healthy = client.health_check(&conn).await?;
            if healthy {
                println!("ok");
                Ok(())
            } else {
                bail!("endpoint reported an unhealthy status");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_sync(
    url: String,
    api_key: Option<String>,
    token: Option<String>,
    state_db: Option<PathBuf>,
    max_attempts: u32,
    deadline: u64,
    mock: bool,
) -> Result<()> {
    let integration_id = IntegrationId::new("cli")?;

    let registry = Arc::new(MemoryRegistry::new());
    registry.insert(Integration::new(
        integration_id.clone(),
        "CLI sync",
        Connection::new(url, api_key),
    ));

    let store: Arc<dyn StateStore> = match state_db {
        Some(path) => Arc::new(SqliteStateStore::open(path)?),
        None => Arc::new(MemoryStateStore::new()),
    };

    let client: Arc<dyn ErpClient> = if mock {
        Arc::new(MockErpClient::new())
    } else {
        Arc::new(HttpErpClient::new())
    };

    let config = OrchestratorConfig {
        max_attempts,
        external_deadline: Duration::from_secs(deadline),
        ..OrchestratorConfig::default()
    };

    let orchestrator = Orchestrator::new(
        registry,
        store,
        Arc::new(MemoryQueue::new()),
        client,
        config,
    );

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.records_processed {
                Some(records) => println!(
                    "[{}] {:?} attempt={} records={}",
                    event.run_id, event.kind, event.attempt, records
                ),
                None => println!(
                    "[{}] {:?} attempt={}",
                    event.run_id, event.kind, event.attempt
                ),
            }
        }
    });

    orchestrator.start().await?;

    let token =
        token.unwrap_or_else(|| format!("manual-{}", chrono::Utc::now().timestamp_millis()));
    let handle = orchestrator.request_sync(&integration_id, &token).await?;
    println!(
        "run {} ({})",
        handle.run_id,
        if handle.joined { "joined" } else { "created" }
    );

    let run = loop {
        let run = orchestrator.status(&handle.run_id).await?;
        if run.is_terminal() {
            break run;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    orchestrator.shutdown().await;
    printer.abort();

    println!(
        "{}: attempts={} records={}",
        run.state,
        run.attempt,
        run.records_processed.unwrap_or(0)
    );
    if let Some(reason) = &run.failure_reason {
        println!("reason: {}", reason);
    }

    match run.state {
        tradesync_store::RunState::Succeeded => Ok(()),
        state => bail!("sync finished in state {}", state),
    }
}
