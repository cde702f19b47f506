use std::sync::Arc;

use async_trait::async_trait;
use crawl_common::channel::{KeyMessage, TopicPublisher};
use crawl_common::dedup::DedupStore;
use crawl_common::fetcher::EntityFetcher;
use crawl_common::keys::{EntityKind, PlayerKey};
use tracing::{debug, warn};

use crate::error::HandleError;
use crate::handler::{claim_key, distinct_keys, fan_out, release_claim, KeyHandler, Outcome};

/// Handles keys from the players topic: offers each new player's match history to the matches
/// topic, tagging every match with the player it came from.
pub struct PlayerHandler {
    fetcher: Arc<dyn EntityFetcher>,
    store: Arc<dyn DedupStore>,
    matches: Arc<dyn TopicPublisher>,
}

impl PlayerHandler {
    pub fn new(
        fetcher: Arc<dyn EntityFetcher>,
        store: Arc<dyn DedupStore>,
        matches: Arc<dyn TopicPublisher>,
    ) -> Self {
        Self {
            fetcher,
            store,
            matches,
        }
    }
}

#[async_trait]
impl KeyHandler for PlayerHandler {
    fn kind(&self) -> EntityKind {
        EntityKind::Player
    }

    async fn handle(&self, message: &KeyMessage) -> Result<Outcome, HandleError> {
        let key = message.key.as_str();

        if !claim_key(self.store.as_ref(), EntityKind::Player, key).await? {
            return Ok(Outcome::AlreadySeen);
        }

        let history = match self
            .fetcher
            .resolve_matches_for_player(&PlayerKey::from(key))
            .await
        {
            Ok(history) => history,
            Err(error) => {
                release_claim(self.store.as_ref(), EntityKind::Player, key).await;
                return Err(HandleError::Fetch {
                    kind: EntityKind::Player,
                    key: key.to_owned(),
                    error,
                });
            }
        };

        let matches = distinct_keys(history.iter().map(|match_key| match_key.as_str()), None);
        let (published, failed) = fan_out(
            self.matches.as_ref(),
            matches
                .into_iter()
                .map(|match_key| KeyMessage::new(match_key).with_origin(key))
                .collect(),
        )
        .await;

        // The history was offered already. Without a completion the player is crawled again,
        // and its matches are published twice.
        if let Err(error) = self.store.complete(EntityKind::Player, key).await {
            warn!(key, published, "failed to complete player: {}", error);
            release_claim(self.store.as_ref(), EntityKind::Player, key).await;
            return Err(HandleError::Store {
                kind: EntityKind::Player,
                key: key.to_owned(),
                error,
            });
        }

        debug!(key, published, failed, "player crawled");
        Ok(Outcome::Processed { published, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawl_common::memory::{MemoryDedupStore, MemoryFetcher, MemoryTopic};
    use http::StatusCode;

    struct Fixture {
        fetcher: Arc<MemoryFetcher>,
        store: Arc<MemoryDedupStore>,
        matches: MemoryTopic,
        handler: PlayerHandler,
    }

    fn fixture(fetcher: MemoryFetcher) -> Fixture {
        let fetcher = Arc::new(fetcher);
        let store = Arc::new(MemoryDedupStore::default());
        let matches = MemoryTopic::new("matches");
        let handler = PlayerHandler::new(fetcher.clone(), store.clone(), Arc::new(matches.clone()));

        Fixture {
            fetcher,
            store,
            matches,
            handler,
        }
    }

    #[tokio::test]
    async fn test_history_is_published_with_origin() {
        let f = fixture(MemoryFetcher::default().with_player("P1", &["M1", "M2", "M1"]));

        let outcome = f.handler.handle(&KeyMessage::new("P1")).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Processed {
                published: 2,
                failed: 0
            }
        );
        let published = f.matches.published();
        assert_eq!(
            published,
            vec![
                KeyMessage::new("M1").with_origin("P1"),
                KeyMessage::new("M2").with_origin("P1"),
            ]
        );
        assert!(f.store.is_completed(EntityKind::Player, "P1"));
    }

    #[tokio::test]
    async fn test_seen_player_is_skipped_without_fetching() {
        let f = fixture(MemoryFetcher::default().with_player("P1", &["M1"]));
        f.store.complete(EntityKind::Player, "P1").await.unwrap();

        let outcome = f.handler.handle(&KeyMessage::new("P1")).await.unwrap();

        assert_eq!(outcome, Outcome::AlreadySeen);
        assert_eq!(f.fetcher.calls("P1"), 0);
        assert!(f.matches.published().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_player_is_released() {
        let f = fixture(MemoryFetcher::default().with_player("P1", &["M1"]));
        f.fetcher.fail_with("P1", StatusCode::TOO_MANY_REQUESTS);

        let error = f.handler.handle(&KeyMessage::new("P1")).await.unwrap_err();

        assert!(error.is_retryable());
        assert!(!f.store.exists(EntityKind::Player, "P1").await.unwrap());

        f.fetcher.recover("P1");
        let outcome = f.handler.handle(&KeyMessage::new("P1")).await.unwrap();
        assert!(matches!(outcome, Outcome::Processed { published: 1, .. }));
    }

    #[tokio::test]
    async fn test_unknown_player_is_not_retryable() {
        let f = fixture(MemoryFetcher::default());

        let error = f.handler.handle(&KeyMessage::new("P9")).await.unwrap_err();

        assert!(!error.is_retryable());
        assert!(f.matches.published().is_empty());
    }

    #[tokio::test]
    async fn test_empty_history_completes_the_player() {
        let f = fixture(MemoryFetcher::default().with_player("P1", &[]));

        let outcome = f.handler.handle(&KeyMessage::new("P1")).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Processed {
                published: 0,
                failed: 0
            }
        );
        assert!(f.store.is_completed(EntityKind::Player, "P1"));
    }

    #[tokio::test]
    async fn test_failed_completion_is_retryable_and_releases_the_claim() {
        let f = fixture(MemoryFetcher::default().with_player("P1", &["M1"]));
        f.store.fail_completions(true);

        let error = f.handler.handle(&KeyMessage::new("P1")).await.unwrap_err();

        assert!(matches!(error, HandleError::Store { .. }));
        assert!(error.is_retryable());
        assert!(!f.store.exists(EntityKind::Player, "P1").await.unwrap());
        assert_eq!(f.matches.published_keys(), vec!["M1"]);

        f.store.fail_completions(false);
        f.handler.handle(&KeyMessage::new("P1")).await.unwrap();
        assert!(f.store.is_completed(EntityKind::Player, "P1"));
    }
}
