mod allocator;
mod analytics;
mod api;
mod cache;
mod clicks;
mod codec;
mod config;
mod error;
mod ingest;
mod models;
mod queue;
mod service;
mod storage;
mod warmer;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use allocator::{spawn_sync_worker, CodeBlocks, IdAllocator};
use api::AppState;
use cache::{CacheBackend, CachePair, RedisBackend};
use config::{Config, DatabaseBackend};
use ingest::IngestionConsumer;
use queue::{ClickPublisher, ClickSource, DisabledPublisher, KafkaClickPublisher, KafkaClickSource};
use service::ShortenerService;
use storage::{PostgresStore, SqliteStore, UrlStore};

#[derive(Parser)]
#[command(name = "zipline")]
#[command(about = "Zipline URL shortener", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API and redirect server (default)
    Serve,
    /// Run the click ingestion consumer
    Ingest,
    /// Run the cache warmer
    Warm,
    /// Run the ID allocator as a standalone HTTP service
    Allocator,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);
    info!("loaded configuration");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::Ingest => run_ingest(config).await,
        Commands::Warm => run_warmer(config).await,
        Commands::Allocator => run_allocator(config).await,
    }
}

async fn build_store(config: &Config) -> Result<Arc<dyn UrlStore>> {
    let store: Arc<dyn UrlStore> = match config.database.backend {
        DatabaseBackend::Sqlite => {
            info!("using SQLite store: {}", config.database.url);
            Arc::new(
                SqliteStore::connect_with_sequence(
                    &config.database.url,
                    config.database.max_connections,
                    config.allocator.base,
                    config.allocator.block_size,
                )
                .await?,
            )
        }
        DatabaseBackend::Postgres => {
            info!("using PostgreSQL store: {}", config.database.url);
            Arc::new(
                PostgresStore::connect(
                    &config.database.url,
                    config.database.max_connections,
                    config.allocator.base,
                    config.allocator.block_size,
                )
                .await?,
            )
        }
    };

    info!("initializing database schema");
    store.init().await?;
    Ok(store)
}

/// Counter backends for the allocator: a dedicated primary when configured,
/// else the cache writer; plus the optional secondary.
async fn build_allocator(
    config: &Config,
    cache_writer: &Arc<dyn CacheBackend>,
    store: &Arc<dyn UrlStore>,
) -> Result<Arc<IdAllocator>> {
    let primary: Arc<dyn CacheBackend> = match &config.allocator.primary_redis_url {
        Some(url) => Arc::new(RedisBackend::connect(url).await?),
        None => Arc::clone(cache_writer),
    };

    let secondary: Option<Arc<dyn CacheBackend>> = match &config.allocator.secondary_redis_url {
        Some(url) => match RedisBackend::connect(url).await {
            Ok(backend) => Some(Arc::new(backend) as Arc<dyn CacheBackend>),
            Err(err) => {
                warn!(error = %err, "secondary allocator backend unreachable at startup");
                None
            }
        },
        None => None,
    };

    Ok(IdAllocator::new(
        primary,
        secondary,
        Arc::clone(store),
        config.allocator.clone(),
    ))
}

/// Flip the shutdown flag on SIGINT/SIGTERM.
fn spawn_signal_handler() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "failed to install SIGINT handler");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to install CTRL+C handler");
                return;
            }
            info!("received CTRL+C, shutting down");
        }

        let _ = tx.send(true);
    });

    rx
}

async fn run_server(config: Arc<Config>) -> Result<()> {
    let store = build_store(&config).await?;
    let cache = CachePair::from_config(&config.cache).await?;

    let allocator = build_allocator(&config, &cache.writer, &store).await?;
    let shutdown = spawn_signal_handler();
    let sync_worker = spawn_sync_worker(Arc::clone(&allocator), shutdown.clone());

    let publisher: Arc<dyn ClickPublisher> = match KafkaClickPublisher::new(&config.queue) {
        Ok(publisher) => {
            info!(servers = %config.queue.bootstrap_servers, "click queue producer ready");
            Arc::new(publisher)
        }
        Err(err) => {
            warn!(error = %err, "click queue unavailable, all clicks take the fallback stream");
            Arc::new(DisabledPublisher)
        }
    };

    let blocks = CodeBlocks::new(Arc::clone(&allocator), config.allocator.block_size);
    let service = Arc::new(ShortenerService::new(
        store,
        cache,
        blocks,
        publisher,
        &config,
    ));

    let state = Arc::new(AppState {
        service,
        base_url: config.base_url.clone(),
    });
    let router = api::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server listening on http://{addr}");

    let mut server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await?;

    // Drain pending allocation audit records before exit.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), sync_worker).await;
    info!("shutdown complete");
    Ok(())
}

async fn run_ingest(config: Arc<Config>) -> Result<()> {
    let store = build_store(&config).await?;
    let cache = CachePair::from_config(&config.cache).await?;

    let source: Arc<dyn ClickSource> = Arc::new(KafkaClickSource::new(
        &config.queue,
        &config.ingestion.consumer_group,
        config
            .ingestion
            .consumer_name
            .as_deref()
            .unwrap_or("zipline-ingest"),
    )?);
    let columnar = Arc::new(analytics::ClickHouseStore::new(&config.analytics));

    let consumer = IngestionConsumer::new(
        source,
        Arc::clone(&cache.writer),
        store,
        columnar,
        &config.clicks.stream_key,
        config.ingestion.clone(),
    );

    let shutdown = spawn_signal_handler();
    consumer.run(shutdown).await;
    Ok(())
}

async fn run_warmer(config: Arc<Config>) -> Result<()> {
    let store = build_store(&config).await?;
    let cache = CachePair::from_config(&config.cache).await?;
    let allocator = build_allocator(&config, &cache.writer, &store).await?;

    let warmer = warmer::CacheWarmer::new(
        store,
        cache,
        Some(allocator),
        config.warmer.clone(),
        config.cache.url_ttl_secs,
    );

    let shutdown = spawn_signal_handler();
    warmer.run(shutdown).await;
    Ok(())
}

async fn run_allocator(config: Arc<Config>) -> Result<()> {
    let store = build_store(&config).await?;
    let cache = CachePair::from_config(&config.cache).await?;
    let allocator = build_allocator(&config, &cache.writer, &store).await?;

    let shutdown = spawn_signal_handler();
    let sync_worker = spawn_sync_worker(Arc::clone(&allocator), shutdown.clone());

    let router = allocator::http::create_allocator_router(allocator);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("allocator listening on http://{addr}");

    let mut server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await?;

    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), sync_worker).await;
    info!("shutdown complete");
    Ok(())
}
