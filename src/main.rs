//! Eventhub server and maintenance CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use eventhub::api::{self, AppState};
use eventhub::config::{generate_default_config, Config};
use eventhub::pipeline::{DefaultProcessor, EventPipeline};
use eventhub::store::SqliteEventStore;
use eventhub::websocket::ConnectionHub;

#[derive(Parser)]
#[command(name = "eventhub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time event hub with a retrying processing pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Config file (default: standard locations, then env)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the bind host
        #[arg(long)]
        host: Option<String>,
        /// Override the bind port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a default config file
    Config,

    /// Process pending events once and exit
    ProcessPending {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Maximum number of events to process
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            print!("{}", generate_default_config());
            Ok(())
        }
        Commands::Serve { config, host, port } => {
            let mut config = load_config(config)?;
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            serve(config).await
        }
        Commands::ProcessPending { config, limit } => {
            let config = load_config(config)?;
            process_pending(config, limit).await
        }
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = Config::resolve(path.as_deref()).context("Failed to load configuration")?;
    eventhub::logging::init(&config.logging).context("Failed to initialize logging")?;
    Ok(config)
}

fn build_pipeline(config: &Config) -> anyhow::Result<Arc<EventPipeline>> {
    let db_path = config.store.path();
    let store = SqliteEventStore::open(&db_path)
        .with_context(|| format!("Failed to open event store at {}", db_path.display()))?;

    let hub = Arc::new(ConnectionHub::new(config.hub_config()));
    let processor = Arc::new(DefaultProcessor::new(config.processing_delay()));

    Ok(Arc::new(EventPipeline::new(
        Arc::new(store),
        hub,
        processor,
        config.pipeline_config(),
    )))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting eventhub");

    let pipeline = build_pipeline(&config)?;
    let api_config = config.api_config();
    let state = AppState::new(pipeline, api_config.clone());

    api::serve(state, &api_config)
        .await
        .context("API server failed")?;
    Ok(())
}

async fn process_pending(config: Config, limit: usize) -> anyhow::Result<()> {
    let pipeline = build_pipeline(&config)?;

    let outcome = pipeline.process_pending_events(limit).await;
    pipeline.shutdown().await;
    let events = outcome.context("Processing pending events failed")?;

    for event in &events {
        println!(
            "{}\t{}\t{}\t{}",
            event.id,
            event.event_type,
            event.status,
            event.error_message.as_deref().unwrap_or("-")
        );
    }
    println!("Processed {} event(s)", events.len());
    Ok(())
}
