use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The two kinds of entities discovered by the crawl. Each kind owns its own topic and its own
/// keyspace in the dedup store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Match,
    Player,
}

impl EntityKind {
    /// Name of the keyspace in the dedup store.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Match => "match",
            EntityKind::Player => "player",
        }
    }

    /// Default topic name carrying keys of this kind.
    pub fn default_topic(&self) -> &'static str {
        match self {
            EntityKind::Match => "matches",
            EntityKind::Player => "players",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEntityKindError(pub String);

impl FromStr for EntityKind {
    type Err = ParseEntityKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "match" => Ok(EntityKind::Match),
            "player" => Ok(EntityKind::Player),
            invalid => Err(ParseEntityKindError(invalid.to_owned())),
        }
    }
}

/// Upstream identifier of a single match, e.g. `EUW1_6612345678`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchKey(pub String);

impl MatchKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MatchKey {
    fn from(value: &str) -> Self {
        MatchKey(value.to_owned())
    }
}

/// Stable account-linked identifier of a player (a puuid), never a display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerKey(pub String);

impl PlayerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerKey {
    fn from(value: &str) -> Self {
        PlayerKey(value.to_owned())
    }
}
