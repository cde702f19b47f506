use std::collections::HashSet;

use async_trait::async_trait;
use crawl_common::channel::{KeyMessage, TopicPublisher};
use crawl_common::dedup::{Claim, DedupStore};
use crawl_common::keys::EntityKind;
use tracing::{debug, error, warn};

use crate::error::HandleError;

/// What handling a single key amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The key was completed before. Nothing was fetched or published.
    AlreadySeen,
    /// The key was fetched and its neighbours were offered to the other topic. `failed` counts
    /// neighbours that could not be published.
    Processed { published: usize, failed: usize },
}

/// Per-key work of one pipeline: claim, fetch, persist, fan out.
#[async_trait]
pub trait KeyHandler: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn handle(&self, message: &KeyMessage) -> Result<Outcome, HandleError>;
}

/// Publish each message on its own. A failed publish is logged and counted, and never stops the
/// remaining ones from being attempted.
pub async fn fan_out(
    publisher: &dyn TopicPublisher,
    messages: Vec<KeyMessage>,
) -> (usize, usize) {
    let labels = [("topic", publisher.topic().to_owned())];
    let mut published = 0;
    let mut failed = 0;

    for message in messages {
        match publisher.publish(&message).await {
            Ok(()) => published += 1,
            Err(error) => {
                error!(key = message.key, "failed to publish key: {}", error);
                failed += 1;
            }
        }
    }

    metrics::counter!("crawl_fanout_published_total", &labels).increment(published as u64);
    metrics::counter!("crawl_fanout_failed_total", &labels).increment(failed as u64);

    (published, failed)
}

/// Keep the first occurrence of every key, in order, leaving out `excluded`.
pub fn distinct_keys<'a, I>(keys: I, excluded: Option<&str>) -> Vec<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    keys.into_iter()
        .filter(|key| Some(*key) != excluded)
        .filter(|key| seen.insert(*key))
        .collect()
}

/// Claim the key for this consumer. Returns false for a completed key, and fails with
/// `HandleError::InFlight` while another consumer holds it, so that the key is tried again later
/// instead of being dropped.
pub async fn claim_key(
    store: &dyn DedupStore,
    kind: EntityKind,
    key: &str,
) -> Result<bool, HandleError> {
    let claim = store
        .mark_seen(kind, key)
        .await
        .map_err(|error| HandleError::Store {
            kind,
            key: key.to_owned(),
            error,
        })?;

    match claim {
        Claim::Claimed => Ok(true),
        Claim::Completed => {
            debug!(%kind, key, "key already seen");
            Ok(false)
        }
        Claim::InFlight { expires_in } => Err(HandleError::InFlight {
            kind,
            key: key.to_owned(),
            expires_in,
        }),
    }
}

/// Let go of a claim after a failure so the key can be picked up again. If this fails too the
/// claim is left to expire.
pub async fn release_claim(store: &dyn DedupStore, kind: EntityKind, key: &str) {
    if let Err(error) = store.release(kind, key).await {
        warn!(%kind, key, "failed to release claim: {}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawl_common::memory::{MemoryDedupStore, MemoryTopic};
    use std::time::Duration;

    #[test]
    fn test_distinct_keys_keeps_order_and_drops_excluded() {
        let keys = ["P1", "P2", "P1", "P3", "P2", "P4"];

        assert_eq!(
            distinct_keys(keys, Some("P3")),
            vec!["P1", "P2", "P4"]
        );
        assert_eq!(distinct_keys(keys, None), vec!["P1", "P2", "P3", "P4"]);
        assert!(distinct_keys([], Some("P1")).is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_continues_past_failures() {
        let topic = MemoryTopic::new("players");
        topic.reject_key("P2");

        let messages = ["P1", "P2", "P3"].into_iter().map(KeyMessage::new).collect();
        let (published, failed) = fan_out(&topic, messages).await;

        assert_eq!((published, failed), (2, 1));
        assert_eq!(topic.published_keys(), vec!["P1", "P3"]);
    }

    #[tokio::test]
    async fn test_claim_key_tells_in_flight_from_completed() {
        let store = MemoryDedupStore::new(Duration::from_secs(60));

        assert!(claim_key(&store, EntityKind::Match, "M1").await.unwrap());

        let error = claim_key(&store, EntityKind::Match, "M1")
            .await
            .unwrap_err();
        assert!(error.is_retryable());
        assert!(!error.consumes_attempt());
        match error {
            HandleError::InFlight { expires_in, .. } => {
                assert!(expires_in <= Duration::from_secs(60))
            }
            other => panic!("expected a key in flight, got {:?}", other),
        }

        store.complete(EntityKind::Match, "M1").await.unwrap();
        assert!(!claim_key(&store, EntityKind::Match, "M1").await.unwrap());
    }
}
