//! Crawl matches and players, starting from a seed account.
use std::future::ready;
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::signal;
use tokio::sync::watch;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crawl_common::channel::TopicPublisher;
use crawl_common::fetcher::RiotFetcher;
use crawl_common::health::HealthRegistry;
use crawl_common::kafka::{create_kafka_producer, KafkaTopicPublisher, KafkaTopicSubscriber};
use crawl_common::metrics::{serve, setup_metrics_routes};
use crawl_common::pgstore::PgDedupStore;
use crawl_worker::config::{Config, NonEmptyString};
use crawl_worker::crawler::{CrawlTopics, Crawler, PipelineSettings};
use crawl_worker::error::CrawlError;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().expect("invalid rdkafka directive")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

pub async fn index() -> &'static str {
    "match crawler"
}

#[tokio::main]
async fn main() -> Result<(), CrawlError> {
    setup_tracing();
    info!("Starting match crawler...");

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let status = liveness.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(status.get_status())));
    let router = setup_metrics_routes(router)?;

    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            error!("failed to start serving metrics: {}", error);
        }
    });

    let store = PgDedupStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.claim_timeout.0,
    )
    .await?;
    store.run_migrations().await?;

    let fetcher = RiotFetcher::new(
        config.riot_api_key.as_str(),
        &config.platform_riot_url,
        &config.regional_riot_url,
        config.request_timeout.0,
        config.match_history_count,
    )
    .map_err(CrawlError::Fetcher)?;

    let producer = create_kafka_producer(
        &config.kafka,
        liveness.register("rdkafka", time::Duration::seconds(30)),
    )
    .await?;
    let publisher = |topic: &NonEmptyString| -> Arc<dyn TopicPublisher> {
        Arc::new(KafkaTopicPublisher::new(producer.clone(), topic.as_str()))
    };

    let topics = CrawlTopics {
        matches_in: Arc::new(KafkaTopicSubscriber::new(
            &config.kafka,
            config.matches_topic.as_str(),
        )?),
        matches_out: publisher(&config.matches_topic),
        matches_dead_letter: config.matches_dead_letter_topic.as_ref().map(publisher),
        players_in: Arc::new(KafkaTopicSubscriber::new(
            &config.kafka,
            config.players_topic.as_str(),
        )?),
        players_out: publisher(&config.players_topic),
        players_dead_letter: config.players_dead_letter_topic.as_ref().map(publisher),
    };
    let settings = PipelineSettings {
        poll_timeout: config.poll_timeout.0,
        max_concurrent_jobs: config.max_concurrent_jobs,
        retry_policy: config.retry_policy.retry_policy(),
    };

    info!(
        matches_topic = config.matches_topic.as_str(),
        players_topic = config.players_topic.as_str(),
        max_concurrent_jobs = config.max_concurrent_jobs,
        "Configuration loaded"
    );

    let crawler = Crawler::wire(
        Arc::new(fetcher),
        Arc::new(store),
        topics,
        settings,
        &liveness,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown().await;
        let _ = shutdown_tx.send(true);
    });

    let seed = config
        .seed_account_name
        .as_ref()
        .map(NonEmptyString::as_str);
    crawler.run(seed, shutdown_rx).await?;

    info!("Match crawler stopped");
    Ok(())
}
