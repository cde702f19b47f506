//! In-process topic, dedup store and fetcher, for running pipelines without Kafka, PostgreSQL or
//! the upstream API. Each of them can be told to fail, so this module is only built for tests
//! and with the `test-util` feature.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::StatusCode;
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::channel::{
    ChannelError, Delivery, KeyMessage, Polled, PublishError, TopicPublisher, TopicSubscriber,
};
use crate::dedup::{Claim, DedupStore, StoreError};
use crate::fetcher::{EntityFetcher, FetchError, MatchRecord};
use crate::keys::{EntityKind, MatchKey, PlayerKey};

#[derive(Default)]
struct TopicState {
    queue: VecDeque<KeyMessage>,
    published: Vec<KeyMessage>,
    rejected: HashSet<String>,
    brokers_down: bool,
    closed: bool,
}

/// A topic living in memory. Clones share the same queue, so one clone can be handed to the
/// producing side and another to the consuming side.
#[derive(Clone)]
pub struct MemoryTopic {
    topic: String,
    state: Arc<Mutex<TopicState>>,
    notify: Arc<Notify>,
}

impl MemoryTopic {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            state: Default::default(),
            notify: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every message accepted so far, in publication order.
    pub fn published(&self) -> Vec<KeyMessage> {
        self.lock().published.clone()
    }

    pub fn published_keys(&self) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .map(|message| message.key.clone())
            .collect()
    }

    /// Messages published but not polled yet.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Make every future publish of `key` fail.
    pub fn reject_key(&self, key: &str) {
        self.lock().rejected.insert(key.to_owned());
    }

    /// Make every future poll report that all brokers are down.
    pub fn fail_brokers(&self) {
        self.lock().brokers_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl TopicPublisher for MemoryTopic {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn publish(&self, message: &KeyMessage) -> Result<(), PublishError> {
        {
            let mut state = self.lock();
            if state.rejected.contains(&message.key) {
                return Err(PublishError::Rejected {
                    topic: self.topic.clone(),
                    key: message.key.clone(),
                });
            }
            state.published.push(message.clone());
            state.queue.push_back(message.clone());
        }
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl TopicSubscriber for MemoryTopic {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn poll(&self, timeout: Duration) -> Polled {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                if state.brokers_down {
                    return Polled::Fatal(ChannelError::AllBrokersDown);
                }
                if let Some(message) = state.queue.pop_front() {
                    return Polled::Message(Delivery::new(message));
                }
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Polled::Empty;
            }
        }
    }

    async fn close(&self) {
        self.lock().closed = true;
    }
}

enum SeenState {
    Claimed(Instant),
    Completed,
}

#[derive(Default)]
struct StoreState {
    seen: HashMap<(EntityKind, String), SeenState>,
    archive: HashMap<String, Value>,
    mark_seen_calls: HashMap<(EntityKind, String), usize>,
    unavailable: bool,
    failing_completions: bool,
}

/// A `DedupStore` kept in a map, with the same claim semantics as the PostgreSQL one.
pub struct MemoryDedupStore {
    claim_timeout: Duration,
    state: Mutex<StoreState>,
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryDedupStore {
    pub fn new(claim_timeout: Duration) -> Self {
        Self {
            claim_timeout,
            state: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn available(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        let state = self.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable("memory store is down".to_owned()));
        }
        Ok(state)
    }

    pub fn archived(&self, key: &str) -> Option<Value> {
        self.lock().archive.get(key).cloned()
    }

    pub fn is_completed(&self, kind: EntityKind, key: &str) -> bool {
        matches!(
            self.lock().seen.get(&(kind, key.to_owned())),
            Some(SeenState::Completed)
        )
    }

    /// How many times `mark_seen` was called for the key, successful or not.
    pub fn mark_seen_calls(&self, kind: EntityKind, key: &str) -> usize {
        self.lock()
            .mark_seen_calls
            .get(&(kind, key.to_owned()))
            .copied()
            .unwrap_or_default()
    }

    /// Make every operation fail until set back to false.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make archive writes and completions fail until set back to false.
    pub fn fail_completions(&self, failing: bool) {
        self.lock().failing_completions = failing;
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn exists(&self, kind: EntityKind, key: &str) -> Result<bool, StoreError> {
        let state = self.available()?;
        Ok(state.seen.contains_key(&(kind, key.to_owned())))
    }

    async fn mark_seen(&self, kind: EntityKind, key: &str) -> Result<Claim, StoreError> {
        let mut state = self.available()?;
        let record = (kind, key.to_owned());
        *state.mark_seen_calls.entry(record.clone()).or_default() += 1;

        match state.seen.get(&record) {
            Some(SeenState::Completed) => return Ok(Claim::Completed),
            Some(SeenState::Claimed(at)) if at.elapsed() < self.claim_timeout => {
                return Ok(Claim::InFlight {
                    expires_in: self.claim_timeout.saturating_sub(at.elapsed()),
                });
            }
            _ => {}
        }

        state.seen.insert(record, SeenState::Claimed(Instant::now()));
        Ok(Claim::Claimed)
    }

    async fn archive_match(&self, key: &MatchKey, payload: &Value) -> Result<(), StoreError> {
        let mut state = self.available()?;
        if state.failing_completions {
            return Err(StoreError::Unavailable("archive writes are failing".to_owned()));
        }
        state
            .archive
            .entry(key.as_str().to_owned())
            .or_insert_with(|| payload.clone());
        state
            .seen
            .insert((EntityKind::Match, key.as_str().to_owned()), SeenState::Completed);
        Ok(())
    }

    async fn complete(&self, kind: EntityKind, key: &str) -> Result<(), StoreError> {
        let mut state = self.available()?;
        if state.failing_completions {
            return Err(StoreError::Unavailable("completions are failing".to_owned()));
        }
        state.seen.insert((kind, key.to_owned()), SeenState::Completed);
        Ok(())
    }

    async fn release(&self, kind: EntityKind, key: &str) -> Result<(), StoreError> {
        let mut state = self.available()?;
        let record = (kind, key.to_owned());
        if matches!(state.seen.get(&record), Some(SeenState::Claimed(_))) {
            state.seen.remove(&record);
        }
        Ok(())
    }
}

#[derive(Default)]
struct FetcherState {
    histories: HashMap<String, Vec<MatchKey>>,
    matches: HashMap<String, Value>,
    accounts: HashMap<String, PlayerKey>,
    failing: HashMap<String, StatusCode>,
    calls: HashMap<String, usize>,
}

/// An `EntityFetcher` answering from fixed data. Unknown keys resolve to a 404.
#[derive(Default)]
pub struct MemoryFetcher {
    state: Mutex<FetcherState>,
}

impl MemoryFetcher {
    fn lock(&self) -> MutexGuard<'_, FetcherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_player(self, player: &str, matches: &[&str]) -> Self {
        self.lock().histories.insert(
            player.to_owned(),
            matches.iter().map(|key| MatchKey::from(*key)).collect(),
        );
        self
    }

    /// Register a match whose payload lists `participants`, in order.
    pub fn with_match(self, key: &str, participants: &[&str]) -> Self {
        let payload = json!({
            "metadata": {"matchId": key, "participants": participants},
            "info": {"gameMode": "CLASSIC"},
        });
        self.lock().matches.insert(key.to_owned(), payload);
        self
    }

    pub fn with_account(self, name: &str, player: &str) -> Self {
        self.lock()
            .accounts
            .insert(name.to_owned(), PlayerKey::from(player));
        self
    }

    /// Make every lookup of `key` answer with `status` until `recover` is called.
    pub fn fail_with(&self, key: &str, status: StatusCode) {
        self.lock().failing.insert(key.to_owned(), status);
    }

    pub fn recover(&self, key: &str) {
        self.lock().failing.remove(key);
    }

    /// How many lookups were made for the key, failed ones included.
    pub fn calls(&self, key: &str) -> usize {
        self.lock().calls.get(key).copied().unwrap_or_default()
    }

    fn lookup<T, F>(&self, key: &str, find: F) -> Result<T, FetchError>
    where
        F: FnOnce(&FetcherState) -> Option<T>,
    {
        let mut state = self.lock();
        *state.calls.entry(key.to_owned()).or_default() += 1;

        let status = match state.failing.get(key) {
            Some(status) => *status,
            None => match find(&state) {
                Some(found) => return Ok(found),
                None => StatusCode::NOT_FOUND,
            },
        };

        Err(FetchError::Status {
            url: format!("memory://{}", key),
            status,
            retry_after: None,
        })
    }
}

#[async_trait]
impl EntityFetcher for MemoryFetcher {
    async fn resolve_matches_for_player(
        &self,
        player: &PlayerKey,
    ) -> Result<Vec<MatchKey>, FetchError> {
        self.lookup(player.as_str(), |state| {
            state.histories.get(player.as_str()).cloned()
        })
    }

    async fn resolve_match_details(
        &self,
        match_key: &MatchKey,
    ) -> Result<MatchRecord, FetchError> {
        let payload = self.lookup(match_key.as_str(), |state| {
            state.matches.get(match_key.as_str()).cloned()
        })?;

        MatchRecord::from_payload(payload).ok_or_else(|| FetchError::Parse {
            url: format!("memory://{}", match_key),
            reason: "match has no metadata.participants list".to_owned(),
        })
    }

    async fn resolve_account(&self, name: &str) -> Result<PlayerKey, FetchError> {
        self.lookup(name, |state| state.accounts.get(name).cloned())
    }
}
