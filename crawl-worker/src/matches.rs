use std::sync::Arc;

use async_trait::async_trait;
use crawl_common::channel::{KeyMessage, TopicPublisher};
use crawl_common::dedup::DedupStore;
use crawl_common::fetcher::EntityFetcher;
use crawl_common::keys::{EntityKind, MatchKey};
use tracing::debug;

use crate::error::HandleError;
use crate::handler::{claim_key, distinct_keys, fan_out, release_claim, KeyHandler, Outcome};

/// Handles keys from the matches topic: archives each new match and offers its participants to
/// the players topic.
pub struct MatchHandler {
    fetcher: Arc<dyn EntityFetcher>,
    store: Arc<dyn DedupStore>,
    players: Arc<dyn TopicPublisher>,
}

impl MatchHandler {
    pub fn new(
        fetcher: Arc<dyn EntityFetcher>,
        store: Arc<dyn DedupStore>,
        players: Arc<dyn TopicPublisher>,
    ) -> Self {
        Self {
            fetcher,
            store,
            players,
        }
    }
}

#[async_trait]
impl KeyHandler for MatchHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Match
    }

    async fn handle(&self, message: &KeyMessage) -> Result<Outcome, HandleError> {
        let key = message.key.as_str();

        if !claim_key(self.store.as_ref(), EntityKind::Match, key).await? {
            return Ok(Outcome::AlreadySeen);
        }

        let record = match self.fetcher.resolve_match_details(&MatchKey::from(key)).await {
            Ok(record) => record,
            Err(error) => {
                release_claim(self.store.as_ref(), EntityKind::Match, key).await;
                return Err(HandleError::Fetch {
                    kind: EntityKind::Match,
                    key: key.to_owned(),
                    error,
                });
            }
        };

        if let Err(error) = self
            .store
            .archive_match(&MatchKey::from(key), &record.payload)
            .await
        {
            release_claim(self.store.as_ref(), EntityKind::Match, key).await;
            return Err(HandleError::Store {
                kind: EntityKind::Match,
                key: key.to_owned(),
                error,
            });
        }

        // The player whose history led here is being crawled already.
        let participants = distinct_keys(
            record.participants.iter().map(|player| player.as_str()),
            message.origin.as_deref(),
        );
        let (published, failed) = fan_out(
            self.players.as_ref(),
            participants.into_iter().map(KeyMessage::new).collect(),
        )
        .await;

        debug!(key, published, failed, "match archived");
        Ok(Outcome::Processed { published, failed })
    }
}
