use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use offsync::cache::{CacheRegistry, CacheStore, SqliteStore};
use offsync::config;
use offsync::engine::{Engine, EngineOptions, Trigger};
use offsync::net::HttpTransport;
use offsync::notify::Broadcaster;
use offsync::queue::{QueueLimits, RetryQueue};

#[derive(Parser, Debug)]
#[command(name = "offsync")]
#[command(about = "An offline-first request caching and background sync engine")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Seconds between background sync ticks
  #[arg(long, default_value_t = 300)]
  tick_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .init();

  let args = Args::parse();
  let config = config::Config::load(args.config.as_deref())?;

  let base_url = Url::parse(&config.base_url)
    .map_err(|e| eyre!("Invalid base_url {}: {}", config.base_url, e))?;
  let db_path = config.database_path()?;
  let network_timeout = Duration::from_secs(config.network_timeout_secs);

  let store: Arc<dyn CacheStore> = Arc::new(SqliteStore::open(&db_path)?);
  let registry = CacheRegistry::new(store, config.cache_version.clone());
  let queue = RetryQueue::open(
    &db_path,
    QueueLimits {
      max_attempts: config.retry.max_attempts,
      max_tasks: config.retry.max_tasks,
    },
  )?;
  let transport = Arc::new(HttpTransport::new(network_timeout)?);
  let broadcaster = Arc::new(Broadcaster::new());

  let options = EngineOptions {
    rules: config.route_rules(),
    base_url,
    precache: config.precache.clone(),
    fallback_document: config.fallback.document.clone(),
    fallback_overrides: config
      .fallback
      .overrides
      .iter()
      .map(|o| (o.prefix.clone(), o.document.clone()))
      .collect(),
    network_timeout,
  };

  let engine = Arc::new(Engine::new(
    registry,
    queue,
    transport,
    Arc::clone(&broadcaster),
    options,
  ));

  let (triggers, rx) = mpsc::unbounded_channel();

  // Boot: provision namespaces, then promote this generation
  triggers.send(Trigger::Install).ok();
  triggers.send(Trigger::Activate).ok();

  // Periodic background sync
  let tick_triggers = triggers.clone();
  let tick_period = Duration::from_secs(args.tick_secs);
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(tick_period);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
      interval.tick().await;
      if tick_triggers.send(Trigger::SyncTick).is_err() {
        break;
      }
    }
  });

  // Log broadcast events for attached clients
  let mut events = broadcaster.subscribe();
  tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      info!(?event, "client event");
    }
  });

  info!(db = %db_path.display(), "offsync engine starting");
  engine.run(rx).await;

  Ok(())
}
