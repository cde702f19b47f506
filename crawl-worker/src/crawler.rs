use std::sync::Arc;
use std::time;

use crawl_common::channel::{TopicPublisher, TopicSubscriber};
use crawl_common::dedup::DedupStore;
use crawl_common::fetcher::EntityFetcher;
use crawl_common::health::HealthRegistry;
use crawl_common::keys::PlayerKey;
use crawl_common::retry::RetryPolicy;
use tokio::sync::watch;
use tracing::info;

use crate::error::CrawlError;
use crate::handler::KeyHandler;
use crate::matches::MatchHandler;
use crate::pipeline::{FailurePolicy, Pipeline, PipelineExit};
use crate::players::PlayerHandler;

/// Both ends of both topics. Every side is injected so that the crawl can run on Kafka as well
/// as on in-memory topics.
pub struct CrawlTopics {
    pub matches_in: Arc<dyn TopicSubscriber>,
    pub matches_out: Arc<dyn TopicPublisher>,
    pub matches_dead_letter: Option<Arc<dyn TopicPublisher>>,
    pub players_in: Arc<dyn TopicSubscriber>,
    pub players_out: Arc<dyn TopicPublisher>,
    pub players_dead_letter: Option<Arc<dyn TopicPublisher>>,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub poll_timeout: time::Duration,
    pub max_concurrent_jobs: usize,
    pub retry_policy: RetryPolicy,
}

/// How long a pipeline may go without polling before the liveness probe fails.
const PIPELINE_DEADLINE_SECS: i64 = 60;

pub struct Crawler {
    fetcher: Arc<dyn EntityFetcher>,
    players: Arc<dyn TopicPublisher>,
    match_pipeline: Pipeline,
    player_pipeline: Pipeline,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn EntityFetcher>,
        players: Arc<dyn TopicPublisher>,
        match_pipeline: Pipeline,
        player_pipeline: Pipeline,
    ) -> Self {
        Self {
            fetcher,
            players,
            match_pipeline,
            player_pipeline,
        }
    }

    /// Build both pipelines around the same fetcher and store. Matches fan out to the players
    /// topic and players fan out to the matches topic; each pipeline retries on its own topic.
    pub fn wire(
        fetcher: Arc<dyn EntityFetcher>,
        store: Arc<dyn DedupStore>,
        topics: CrawlTopics,
        settings: PipelineSettings,
        liveness: &HealthRegistry,
    ) -> Self {
        let deadline = ::time::Duration::seconds(PIPELINE_DEADLINE_SECS);

        let match_handler: Arc<dyn KeyHandler> = Arc::new(MatchHandler::new(
            fetcher.clone(),
            store.clone(),
            topics.players_out.clone(),
        ));
        let match_pipeline = Pipeline::new(
            topics.matches_in,
            match_handler,
            FailurePolicy::new(
                settings.retry_policy,
                topics.matches_out.clone(),
                topics.matches_dead_letter,
            ),
            settings.poll_timeout,
            settings.max_concurrent_jobs,
            liveness.register("matches_pipeline", deadline),
        );

        let player_handler: Arc<dyn KeyHandler> = Arc::new(PlayerHandler::new(
            fetcher.clone(),
            store,
            topics.matches_out,
        ));
        let player_pipeline = Pipeline::new(
            topics.players_in,
            player_handler,
            FailurePolicy::new(
                settings.retry_policy,
                topics.players_out.clone(),
                topics.players_dead_letter,
            ),
            settings.poll_timeout,
            settings.max_concurrent_jobs,
            liveness.register("players_pipeline", deadline),
        );

        Self::new(fetcher, topics.players_out, match_pipeline, player_pipeline)
    }

    /// Resolve an account name and publish its player key, starting the crawl from there.
    pub async fn seed(&self, account_name: &str) -> Result<PlayerKey, CrawlError> {
        let player = self
            .fetcher
            .resolve_account(account_name)
            .await
            .map_err(|error| CrawlError::Seed {
                name: account_name.to_owned(),
                error,
            })?;

        self.players
            .send_message(player.as_str())
            .await
            .map_err(|error| CrawlError::SeedPublish {
                key: player.to_string(),
                error,
            })?;

        info!(account_name, player = %player, "seeded crawl");
        Ok(player)
    }

    /// Seed the crawl if asked to, then run both pipelines until they stop. A pipeline that
    /// loses its brokers stops alone; the other one keeps going until shutdown.
    pub async fn run(
        &self,
        seed: Option<&str>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(PipelineExit, PipelineExit), CrawlError> {
        if let Some(account_name) = seed {
            self.seed(account_name).await?;
        }

        let exits = tokio::join!(
            self.match_pipeline.run(shutdown.clone()),
            self.player_pipeline.run(shutdown)
        );
        info!(matches = ?exits.0, players = ?exits.1, "crawl stopped");

        Ok(exits)
    }
}
