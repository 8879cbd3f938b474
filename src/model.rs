use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Current UTC time truncated to the millisecond precision the store keeps.
pub fn now() -> OffsetDateTime {
    from_millis(to_millis(OffsetDateTime::now_utc()))
}

pub fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Waiting,
    Active,
    Closed,
    Branched,
    Merged,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        use GameStatus::*;
        match self {
            Waiting => "waiting",
            Active => "active",
            Closed => "closed",
            Branched => "branched",
            Merged => "merged",
        }
    }

    /// Joins and realtime chat are only allowed while a game is open.
    pub fn is_open(&self) -> bool {
        matches!(self, GameStatus::Waiting | GameStatus::Active)
    }

    pub fn can_transition_to(&self, target: GameStatus) -> bool {
        use GameStatus::*;
        matches!(
            (self, target),
            (Waiting, Active)
                | (Active, Closed)
                | (Waiting | Active, Branched)
                | (Waiting | Active, Merged)
        )
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use GameStatus::*;
        Ok(match s {
            "waiting" => Waiting,
            "active" => Active,
            "closed" => Closed,
            "branched" => Branched,
            "merged" => Merged,
            other => return Err(format!("unknown game status {other:?}")),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Universe {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Character {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub attributes: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameInstance {
    pub id: Uuid,
    pub name: String,
    pub universe_id: Uuid,
    pub status: GameStatus,
    pub setup_prompt: Option<String>,
    pub created_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Lobby row: a game plus the bits the listing shows next to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameSummary {
    #[serde(flatten)]
    pub game: GameInstance,
    pub universe_name: String,
    pub players: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    pub id: Uuid,
    pub character_id: Uuid,
    pub game_id: Uuid,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub bound_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub released_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    BranchedFrom { original_game_id: Uuid },
    Merger { from_instance_ids: Vec<Uuid> },
    Other {
        label: String,
        #[serde(default)]
        detail: Value,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::BranchedFrom { .. } => "branched_from",
            EventKind::Merger { .. } => "merger",
            EventKind::Other { .. } => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameEvent {
    pub id: i64,
    pub universe_id: Uuid,
    /// The resulting instance: the branch child or the merge target.
    pub game_id: Uuid,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub game_id: Uuid,
    pub sender: String,
    pub body: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewsItem {
    pub id: i64,
    pub universe_id: Uuid,
    pub summary: String,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictRecord {
    pub id: i64,
    pub universe_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    pub description: String,
    pub game_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: i64,
    pub message: String,
    pub read: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [GameStatus; 5] = [
        GameStatus::Waiting,
        GameStatus::Active,
        GameStatus::Closed,
        GameStatus::Branched,
        GameStatus::Merged,
    ];

    #[test]
    fn terminal_states_are_sinks() {
        for from in [GameStatus::Closed, GameStatus::Branched, GameStatus::Merged] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} should be illegal");
            }
        }
    }

    #[test]
    fn nothing_returns_to_waiting() {
        for from in ALL {
            assert!(!from.can_transition_to(GameStatus::Waiting));
        }
    }

    #[test]
    fn only_active_games_close() {
        assert!(GameStatus::Active.can_transition_to(GameStatus::Closed));
        assert!(!GameStatus::Waiting.can_transition_to(GameStatus::Closed));
        assert!(GameStatus::Waiting.can_transition_to(GameStatus::Active));
        assert!(!GameStatus::Active.can_transition_to(GameStatus::Active));
    }

    #[test]
    fn status_text_round_trips() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<GameStatus>(), Ok(status));
        }
        assert!("paused".parse::<GameStatus>().is_err());
    }

    #[test]
    fn event_kind_serializes_with_type_tag() {
        let kind = EventKind::Merger { from_instance_ids: vec![Uuid::nil()] };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["event_type"], "merger");
        assert_eq!(kind.event_type(), "merger");
    }

    #[test]
    fn millis_truncation_is_stable() {
        let at = now();
        assert_eq!(from_millis(to_millis(at)), at);
    }
}
