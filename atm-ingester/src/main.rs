//! Pulls file-written notifications, deduplicates them, and reconciles the
//! referenced ATM records into PostgreSQL.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use chrono::Duration as ChronoDuration;
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use atm_common::health::HealthRegistry;
use atm_common::metrics::{serve, setup_metrics_router};
use atm_ingester::config::Config;
use atm_ingester::dedup::{purge_loop, DedupCache};
use atm_ingester::listener::IngestionLoop;
use atm_ingester::reconcile::PgRecordStore;
use atm_ingester::source::PubSubSource;
use atm_ingester::storage::GcsObjectStore;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn index() -> &'static str {
    "atm-ingester"
}

fn start_health_metrics_server(bind: String, registry: HealthRegistry) {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(registry.get_status())),
        )
        .merge(setup_metrics_router());
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving liveness and metrics");
    });
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("starting up");

    let config = Config::init_from_env().expect("invalid configuration");

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to PostgreSQL");

    let registry = HealthRegistry::new("liveness");
    let shutdown = CancellationToken::new();

    let cache = Arc::new(DedupCache::new(config.dedup_expiration()));
    let purge_deadline =
        ChronoDuration::seconds(config.dedup_expiration().as_secs() as i64 + 60);
    tokio::spawn(purge_loop(
        cache.clone(),
        registry.register("dedup-purge", purge_deadline),
        shutdown.clone(),
    ));

    let source = PubSubSource::new(
        &config.pubsub_endpoint,
        &config.project_id,
        &config.subscription_id,
        &config.access_token,
        config.pull_timeout.0,
    )
    .expect("failed to initialize the message source");
    let objects = GcsObjectStore::new(
        &config.storage_endpoint,
        &config.bucket_name,
        &config.access_token,
        config.pull_timeout.0,
    )
    .expect("failed to initialize the object store");

    let listener = IngestionLoop::new(
        Arc::new(source),
        Arc::new(objects),
        Arc::new(PgRecordStore::new(pool)),
        cache,
        config.max_messages,
        config.poll_interval.0,
        registry.register(
            "ingester",
            ChronoDuration::seconds(config.pull_timeout.0.as_secs() as i64 + 60),
        ),
        shutdown.clone(),
    );

    start_health_metrics_server(config.bind(), registry);

    let ingestion = tokio::spawn(async move { listener.run().await });

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for the shutdown signal");
    info!("shutdown signal received");
    shutdown.cancel();

    if let Err(e) = ingestion.await {
        error!("ingestion task failed: {}", e);
    }
    info!("shut down cleanly");
}
