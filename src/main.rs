use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loanflow::config::AppConfig;
use loanflow::engine::{Engine, RunResult};
use loanflow::server::{create_router, AppState};
use loanflow::shutdown::{graceful_shutdown, wait_for_shutdown};

#[derive(Parser)]
#[command(
    name = "loanflow",
    about = "Drives loan applications through review stages and reconciles them across stores"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control API and the run queue
    Serve,
    /// Advance one application through the review stages
    Advance {
        #[arg(long)]
        entity: String,
        /// Current stage. Read from the status store when omitted.
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        target: Option<String>,
    },
    /// Run a reconciliation chain for one application
    Reconcile {
        #[arg(long)]
        chain: String,
        #[arg(long)]
        entity: String,
    },
    /// Check store and service availability
    Check,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = AppConfig::load(cli.config.as_deref())?;
    let engine = Engine::from_config(&config)?;

    match cli.command {
        Command::Serve => serve(config, engine).await,
        Command::Advance {
            entity,
            start,
            target,
        } => {
            let cancel = cancel_on_signal();
            let result = engine
                .advance(&entity, start.as_deref(), target.as_deref(), &cancel)
                .await
                .map(RunResult::Workflow);
            finish(&engine, result).await
        }
        Command::Reconcile { chain, entity } => {
            let cancel = cancel_on_signal();
            let result = engine
                .reconcile(&chain, &entity, &cancel)
                .await
                .map(RunResult::Chain);
            finish(&engine, result).await
        }
        Command::Check => {
            let report = engine.check().await;
            engine.close().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.all_up() {
                anyhow::bail!("Some stores or services are unavailable");
            }
            Ok(())
        }
    }
}

async fn serve(config: AppConfig, engine: Engine) -> anyhow::Result<()> {
    tracing::info!(
        host = %config.server.host,
        port = %config.server.port,
        "Starting loanflow server"
    );

    if config.api_secret().is_empty() {
        tracing::warn!("api.secret is empty, every run submission will be rejected");
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, engine));

    // Start the task queue processor
    let queue_state = Arc::clone(&state);
    tokio::spawn(async move {
        loanflow::queue::run_queue_processor(queue_state).await;
    });

    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", listener.local_addr()?);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await?;

    // Perform graceful shutdown cleanup
    graceful_shutdown(&state).await;

    Ok(())
}

/// Token for a one-shot command, cancelled on Ctrl-C or SIGTERM.
fn cancel_on_signal() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        signal_cancel.cancel();
    });
    cancel
}

async fn finish(
    engine: &Engine,
    result: loanflow::error::Result<RunResult>,
) -> anyhow::Result<()> {
    engine.close().await;

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            if e.is_business_outcome() {
                tracing::warn!(kind = e.kind(), error = %e, "Run ended in a terminal state");
            } else {
                tracing::error!(kind = e.kind(), error = %e, "Run failed");
            }
            Err(e.into())
        }
    }
}
