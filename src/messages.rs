use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    error::{GameError, GameResult},
    model::{self, Message},
};

pub const SYSTEM: &str = "System";
pub const GM: &str = "GM";

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    game_id: String,
    sender: String,
    body: String,
    sent_at: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = GameError;

    fn try_from(row: MessageRow) -> GameResult<Self> {
        Ok(Message {
            id: Uuid::parse_str(&row.id)?,
            game_id: Uuid::parse_str(&row.game_id)?,
            sender: row.sender,
            body: row.body,
            timestamp: model::from_millis(row.sent_at),
        })
    }
}

fn new_message(game_id: Uuid, sender: &str, body: &str) -> Message {
    Message {
        id: Uuid::now_v7(),
        game_id,
        sender: sender.to_owned(),
        body: body.to_owned(),
        timestamp: model::now(),
    }
}

/// Unconditional append, for games the caller just created inside its transaction.
pub(crate) async fn append_in(
    conn: &mut SqliteConnection,
    game_id: Uuid,
    sender: &str,
    body: &str,
) -> GameResult<Message> {
    let message = new_message(game_id, sender, body);
    sqlx::query("INSERT INTO messages (id, game_id, sender, body, sent_at) VALUES (?, ?, ?, ?, ?)")
        .bind(message.id.to_string())
        .bind(game_id.to_string())
        .bind(&message.sender)
        .bind(&message.body)
        .bind(model::to_millis(message.timestamp))
        .execute(conn)
        .await?;
    Ok(message)
}

/// Append only while the game is open. `None` means the game is gone or terminal.
pub async fn append(db_pool: &SqlitePool, game_id: Uuid, sender: &str, body: &str) -> GameResult<Option<Message>> {
    let message = new_message(game_id, sender, body);
    let done = sqlx::query(
        "INSERT INTO messages (id, game_id, sender, body, sent_at) \
         SELECT ?1, ?2, ?3, ?4, ?5 \
         WHERE EXISTS (SELECT 1 FROM games WHERE id = ?2 AND status IN ('waiting', 'active'))",
    )
    .bind(message.id.to_string())
    .bind(game_id.to_string())
    .bind(&message.sender)
    .bind(&message.body)
    .bind(model::to_millis(message.timestamp))
    .execute(db_pool)
    .await?;

    Ok((done.rows_affected() == 1).then_some(message))
}

pub async fn history(db_pool: &SqlitePool, game_id: Uuid) -> GameResult<Vec<Message>> {
    sqlx::query_as::<_, MessageRow>(
        "SELECT id, game_id, sender, body, sent_at FROM messages WHERE game_id = ? ORDER BY seq",
    )
    .bind(game_id.to_string())
    .fetch_all(db_pool)
    .await?
    .into_iter()
    .map(Message::try_from)
    .collect()
}
