mod command;
mod coordinator;
mod hub;
mod ws;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{GameStatus, Message};

pub use command::GmCommand;
pub use hub::{ChatHub, ChatSession, SessionHandle};
pub(crate) use ws::game_ws;

/// Outbound websocket frame, JSON tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    History { messages: Vec<Message> },
    Message(Message),
    /// Presence and status notices; never stored.
    Notice {
        body: String,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    Error { reason: String },
    Closed { status: GameStatus },
}

impl ServerFrame {
    pub fn error(reason: impl Into<String>) -> Self {
        ServerFrame::Error { reason: reason.into() }
    }
}
