//! Core match model, retention ordering and activity predicate for StatsFut.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "statsfut-core";

/// Lifecycle state of a fixture as written by the external data provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchStatus {
    Scheduled,
    Live,
    FirstHalf,
    HalfTime,
    SecondHalf,
    ExtraTime,
    Penalties,
    InPlay,
    Finished,
    Postponed,
    Cancelled,
    /// Anything the provider sends that we do not know about, kept verbatim.
    Other(String),
}

impl MatchStatus {
    pub const IN_PLAY: [MatchStatus; 7] = [
        MatchStatus::Live,
        MatchStatus::FirstHalf,
        MatchStatus::HalfTime,
        MatchStatus::SecondHalf,
        MatchStatus::ExtraTime,
        MatchStatus::Penalties,
        MatchStatus::InPlay,
    ];

    pub const TERMINAL: [MatchStatus; 3] = [
        MatchStatus::Finished,
        MatchStatus::Postponed,
        MatchStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            MatchStatus::Scheduled => "Scheduled",
            MatchStatus::Live => "Live",
            MatchStatus::FirstHalf => "1H",
            MatchStatus::HalfTime => "HT",
            MatchStatus::SecondHalf => "2H",
            MatchStatus::ExtraTime => "ET",
            MatchStatus::Penalties => "PEN",
            MatchStatus::InPlay => "IN_PLAY",
            MatchStatus::Finished => "Finished",
            MatchStatus::Postponed => "Postponed",
            MatchStatus::Cancelled => "Cancelled",
            MatchStatus::Other(raw) => raw,
        }
    }

    pub fn is_in_play(&self) -> bool {
        Self::IN_PLAY.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl FromStr for MatchStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Scheduled" => MatchStatus::Scheduled,
            "Live" => MatchStatus::Live,
            "1H" => MatchStatus::FirstHalf,
            "HT" => MatchStatus::HalfTime,
            "2H" => MatchStatus::SecondHalf,
            "ET" => MatchStatus::ExtraTime,
            "PEN" => MatchStatus::Penalties,
            "IN_PLAY" => MatchStatus::InPlay,
            "Finished" => MatchStatus::Finished,
            "Postponed" => MatchStatus::Postponed,
            "Cancelled" => MatchStatus::Cancelled,
            other => MatchStatus::Other(other.to_string()),
        })
    }
}

impl From<String> for MatchStatus {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(status) => status,
            Err(never) => match never {},
        }
    }
}

impl From<MatchStatus> for String {
    fn from(value: MatchStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the matches table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: i64,
    pub home_team: String,
    pub away_team: String,
    pub date: DateTime<Utc>,
    pub status: MatchStatus,
    pub api_id: Option<String>,
}

impl MatchRecord {
    /// Empty provider ids are treated the same as missing ones.
    pub fn has_api_id(&self) -> bool {
        self.api_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    pub fn fixture_key(&self) -> FixtureKey {
        FixtureKey {
            home_team: self.home_team.clone(),
            away_team: self.away_team.clone(),
            date: self.date,
        }
    }
}

/// Loose identity of a fixture. Two records with the same key are assumed to
/// describe the same match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FixtureKey {
    pub home_team: String,
    pub away_team: String,
    pub date: DateTime<Utc>,
}

impl fmt::Display for FixtureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} vs {} @ {}",
            self.home_team,
            self.away_team,
            self.date.to_rfc3339()
        )
    }
}

/// Retention priority of a record inside a duplicate group: provider id
/// first, then a final result, then the most recently inserted row.
pub fn retention_priority(record: &MatchRecord) -> (bool, bool, i64) {
    (
        record.has_api_id(),
        record.status == MatchStatus::Finished,
        record.id,
    )
}

/// `Ordering::Greater` means `a` should be kept over `b`.
pub fn compare_retention(a: &MatchRecord, b: &MatchRecord) -> Ordering {
    retention_priority(a).cmp(&retention_priority(b))
}

/// Whether a fixture is in progress or kicks off within `upcoming_buffer`.
pub fn is_active(record: &MatchRecord, now: DateTime<Utc>, upcoming_buffer: Duration) -> bool {
    match &record.status {
        status if status.is_terminal() => false,
        status if status.is_in_play() => true,
        MatchStatus::Scheduled => now
            .checked_add_signed(upcoming_buffer)
            .map_or(true, |horizon| record.date <= horizon),
        _ => false,
    }
}
