use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edr_core::assets::changelog::PgChangeLog;
use edr_core::assets::groups::{GroupService, PgGroupRepository};
use edr_core::assets::repository::{AssetRepository, PgAssetRepository};
use edr_core::assets::service::AssetService;
use edr_core::assets::software::PgSoftwareRepository;
use edr_core::bus::consumer::KafkaEventSource;
use edr_core::bus::dlq::DeadLetterRouter;
use edr_core::bus::producer::KafkaEventProducer;
use edr_core::bus::topics::{default_topics, ensure_topics};
use edr_core::config::CoreConfig;
use edr_core::pipeline::enrich::agent::AgentEnricher;
use edr_core::pipeline::enrich::asset::AssetEnricher;
use edr_core::pipeline::sink::bulk::BulkIndexer;
use edr_core::pipeline::sink::stream::StreamSink;
use edr_core::pipeline::{
    Enricher, EnricherChain, Normalizer, PipelineCoordinator, PipelineOptions, SinkSet,
};
use edr_core::router::build_router;
use edr_core::state::AppState;
use edr_core::tracker::reconciler::StatusReconciler;
use edr_core::tracker::RedisTracker;

#[derive(Parser)]
#[command(name = "edr-core")]
#[command(about = "Event ingestion and asset-state core for the EDR backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline, the reconciler and the admin API
    Server {
        /// Configuration file path (TOML); environment overrides apply
        #[arg(short, long)]
        config: Option<String>,
        /// Override the admin API port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Create missing broker topics and exit
    EnsureTopics {
        #[arg(short, long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edr_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server { config, port } => run_server(config.as_deref(), port).await,
        Commands::EnsureTopics { config } => {
            let cfg = CoreConfig::load(config.as_deref())?;
            ensure_topics(&cfg.kafka, &default_topics(&cfg.kafka)).await?;
            Ok(())
        }
    }
}

async fn run_server(config_path: Option<&str>, port: Option<u16>) -> anyhow::Result<()> {
    let mut cfg = CoreConfig::load(config_path)?;
    if let Some(port) = port {
        cfg.server.bind_address.set_port(port);
    }
    let cancel = CancellationToken::new();

    // Durable store
    let pg_pool = PgPoolOptions::new()
        .max_connections(cfg.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(cfg.postgres.connect_timeout_secs))
        .connect(&cfg.postgres.url)
        .await
        .context("failed to connect to postgres")?;
    edr_core::schema::migrate(&pg_pool).await?;

    // KV store
    let tracker = Arc::new(RedisTracker::connect(&cfg.redis.url, &cfg.tracker).await?);

    // Broker
    ensure_topics(&cfg.kafka, &default_topics(&cfg.kafka)).await?;
    let producer = Arc::new(KafkaEventProducer::new(&cfg.kafka, cancel.clone())?);
    let source = Arc::new(KafkaEventSource::new(&cfg.kafka)?);
    let dlq = DeadLetterRouter::new(
        producer.clone(),
        cfg.kafka.dlq_topic.clone(),
        cfg.kafka.dlq_enabled,
        cancel.clone(),
    );

    // Asset state
    let repository: Arc<dyn AssetRepository> = Arc::new(PgAssetRepository::new(pg_pool.clone()));
    let changelog = Arc::new(PgChangeLog::new(pg_pool.clone()));
    let group_repository = Arc::new(PgGroupRepository::new(pg_pool.clone()));
    let software = Arc::new(PgSoftwareRepository::new(pg_pool.clone()));
    let asset_service = Arc::new(AssetService::new(
        repository.clone(),
        changelog,
        tracker.clone(),
        group_repository.clone(),
    ));
    let group_service = Arc::new(GroupService::new(group_repository, repository.clone()));

    // Enrichment chain, in a fixed order
    let cache_ttl = Duration::from_secs(cfg.enrichment.cache_ttl_secs);
    let lookup_timeout = Duration::from_millis(cfg.enrichment.lookup_timeout_ms);
    let mut enrichers: Vec<Box<dyn Enricher>> = Vec::new();
    #[cfg(feature = "geoip")]
    enrichers.push(Box::new(edr_core::pipeline::enrich::geoip::GeoIpEnricher::new(
        cfg.enrichment.geoip_db_path.as_deref(),
    )?));
    enrichers.push(Box::new(AssetEnricher::new(
        repository.clone(),
        cfg.enrichment.cache_capacity,
        cache_ttl,
        lookup_timeout,
    )));
    enrichers.push(Box::new(AgentEnricher::new(
        repository.clone(),
        cfg.enrichment.cache_capacity,
        cache_ttl,
        lookup_timeout,
    )));

    // Sinks
    let bulk = Arc::new(BulkIndexer::new(&cfg.bulk, None)?);
    bulk.create_time_based_index(chrono::Utc::now()).await.ok();
    let bulk_ticker = bulk.spawn_ticker(cancel.clone());
    let stream_sink = Arc::new(StreamSink::new(
        producer.clone(),
        cfg.kafka.normalized_topic.clone(),
    ));
    let sinks = SinkSet::new(vec![stream_sink, bulk.clone()]);

    // Pipeline
    let pipeline = Arc::new(PipelineCoordinator::new(
        source,
        EnricherChain::new(enrichers),
        Normalizer::new(),
        sinks,
        dlq,
        PipelineOptions::from_config(&cfg.pipeline, &cfg.kafka),
        cancel.clone(),
    ));
    pipeline.start();

    // Reconciler
    let reconciler = Arc::new(StatusReconciler::new(
        repository,
        tracker.clone(),
        &cfg.reconciler,
        cancel.clone(),
    ));
    reconciler.start();

    // Admin API
    let state = AppState {
        assets: asset_service,
        groups: group_service,
        software,
        tracker,
        pipeline: Some(pipeline.clone()),
        publisher: Some(producer.clone()),
        raw_topic: cfg.kafka.raw_topic.clone(),
        pg_pool,
    };
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(cfg.server.bind_address)
        .await
        .context("failed to bind admin listener")?;
    tracing::info!(address = %cfg.server.bind_address, "admin API listening");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown signal received");
                }
                _ = shutdown_cancel.cancelled() => {}
            }
        })
        .await
        .context("admin server failed")?;

    // Orderly teardown: stop ingest first, then the reconciler.
    cancel.cancel();
    pipeline.stop().await;
    reconciler.stop().await;
    let _ = bulk_ticker.await;
    tracing::info!("shutdown complete");
    Ok(())
}
