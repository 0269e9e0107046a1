//! folio - resumable streaming conversation server

mod config;
mod echo;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use folio_session::{
    FileStore, HistoryManager, HistoryStore, MemoryStore, Producer, ProducerSummarizer,
    RetryingProducer, RunConfig, StreamSessionManager, TurnRunner, spawn_orphan_sweeper,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, StoreKind};
use crate::echo::EchoProducer;
use crate::ws::AppState;

/// folio - resumable streaming conversation server
#[derive(Parser, Debug)]
#[command(name = "folio")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Root directory of the file store
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory
    #[arg(long)]
    memory_store: bool,

    /// Config file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.server.data_dir = Some(dir.clone());
        }
        if self.memory_store {
            config.server.store = StoreKind::Memory;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("folio=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);

    // Initialize config and exit
    if args.init_config {
        Config::init(&config_path)?;
        println!("Config file created at: {}", config_path.display());
        println!("\nExample config:\n{}", config::example_config());
        return Ok(());
    }

    let mut config = Config::load_from(&config_path);
    args.apply(&mut config);

    let store: Arc<dyn HistoryStore> = match config.server.store {
        StoreKind::File => {
            let dir = config.server.data_dir();
            info!(data_dir = %dir.display(), "Using file store");
            Arc::new(FileStore::open(dir).await?)
        }
        StoreKind::Memory => {
            info!("Using memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let producer: Arc<dyn Producer> =
        Arc::new(RetryingProducer::new(Arc::new(EchoProducer::default())));
    let summarizer = Arc::new(ProducerSummarizer::new(producer.clone()));
    let history = Arc::new(HistoryManager::new(
        store,
        summarizer,
        config.session.history.clone(),
    ));
    let manager = StreamSessionManager::new(history, config.session.stream.clone());

    // Turns abandoned by a previous process are discarded up front
    let discarded = manager.cleanup_orphaned().await?;
    if discarded > 0 {
        info!(discarded, "Discarded orphaned streams at startup");
    }
    let sweeper = spawn_orphan_sweeper(
        manager.clone(),
        Duration::from_secs(config.server.cleanup_interval_secs.max(1)),
    );

    let run_config = RunConfig {
        system_prompt: config.server.system_prompt.clone(),
        ..Default::default()
    };
    let state = AppState {
        runner: TurnRunner::new(manager, producer, run_config),
    };

    let app = Router::new()
        .route("/health", get(ws::health))
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    sweeper.abort();
    info!("Shut down");
    Ok(())
}
