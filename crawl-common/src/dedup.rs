//! The "already seen" ledger and the match archive.
//!
//! Every key goes through two states: `claimed` while a consumer works on it, and `completed`
//! once its work is done. Claiming is a single insert-if-absent, so two consumers racing on the
//! same key never both win. A consumer that fails releases its claim so the key can be picked
//! up again; a consumer that dies leaves a claim that expires after the store's claim timeout.
//! A key found claimed by someone else is in flight, not seen: it has to come back once the
//! claim has either completed or expired.
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::keys::{EntityKind, MatchKey};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// The result of trying to claim a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller holds the key now, and must complete or release it.
    Claimed,
    /// Someone else holds a live claim, which expires in `expires_in` at the latest.
    InFlight { expires_in: Duration },
    /// The key's work is done.
    Completed,
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether a record exists for the key, claimed or completed.
    async fn exists(&self, kind: EntityKind, key: &str) -> Result<bool, StoreError>;

    /// Atomically claim the key. Only the caller that created the record, or took over an
    /// expired claim, gets `Claim::Claimed`.
    async fn mark_seen(&self, kind: EntityKind, key: &str) -> Result<Claim, StoreError>;

    /// Persist the raw match payload and complete the match's record in one step.
    async fn archive_match(&self, key: &MatchKey, payload: &Value) -> Result<(), StoreError>;

    async fn complete(&self, kind: EntityKind, key: &str) -> Result<(), StoreError>;

    /// Drop a claim that was not completed.
    async fn release(&self, kind: EntityKind, key: &str) -> Result<(), StoreError>;
}
