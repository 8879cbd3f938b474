use axum::http::StatusCode;
use uuid::Uuid;

use crate::model::GameStatus;

pub type GameResult<T> = Result<T, GameError>;

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("character {character_id} is already playing in game {game_id}")]
    AlreadyBound { character_id: Uuid, game_id: Uuid },

    #[error("character {character_id} is not bound to game {game_id}")]
    NotBound { character_id: Uuid, game_id: Uuid },

    #[error("game {game_id} is {status} and cannot be joined")]
    GameNotJoinable { game_id: Uuid, status: GameStatus },

    #[error("game {game_id} cannot move from {from} to {to}")]
    IllegalTransition { game_id: Uuid, from: GameStatus, to: GameStatus },

    #[error("data integrity fault: {0}")]
    DataIntegrity(String),

    #[error("game {0} not found")]
    GameNotFound(Uuid),

    #[error("character {0} not found")]
    CharacterNotFound(Uuid),

    #[error("universe {0} not found")]
    UniverseNotFound(Uuid),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl GameError {
    pub fn code(&self) -> &'static str {
        use GameError::*;
        match self {
            AlreadyBound { .. } => "already_bound",
            NotBound { .. } => "not_bound",
            GameNotJoinable { .. } => "game_not_joinable",
            IllegalTransition { .. } => "illegal_transition",
            DataIntegrity(_) => "data_integrity_fault",
            GameNotFound(_) | CharacterNotFound(_) | UniverseNotFound(_) => "not_found",
            InvalidPayload(_) => "invalid_payload",
            Forbidden(_) => "forbidden",
            Database(_) => "database",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        use GameError::*;
        match self {
            AlreadyBound { .. } | GameNotJoinable { .. } => StatusCode::CONFLICT,
            NotBound { .. } | GameNotFound(_) | CharacterNotFound(_) | UniverseNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            IllegalTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Forbidden(_) => StatusCode::FORBIDDEN,
            DataIntegrity(_) | Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// rows hold ids and json as text
impl From<uuid::Error> for GameError {
    fn from(err: uuid::Error) -> Self {
        Self::DataIntegrity(format!("malformed id: {err}"))
    }
}

impl From<serde_json::Error> for GameError {
    fn from(err: serde_json::Error) -> Self {
        Self::DataIntegrity(format!("malformed json column: {err}"))
    }
}
