use axum::{
    Json, Router, debug_handler,
    extract::State,
    routing::{get, post},
};
use serde_json::{Value, json};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    error::GameResult,
    model::{self, Notification},
    session::Caller,
};

#[derive(sqlx::FromRow)]
struct NotificationRow {
    seq: i64,
    message: String,
    read: bool,
    created_at: i64,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Notification {
            id: row.seq,
            message: row.message,
            read: row.read,
            created_at: model::from_millis(row.created_at),
        }
    }
}

/// Queue a notification for the owner of `character_id`. False when the character is unknown.
pub(crate) async fn notify_owner_in(
    conn: &mut SqliteConnection,
    character_id: Uuid,
    message: &str,
) -> GameResult<bool> {
    let done = sqlx::query(
        "INSERT INTO notifications (user_id, message, read, created_at) \
         SELECT owner, ?, 0, ? FROM characters WHERE id = ?",
    )
    .bind(message)
    .bind(model::to_millis(model::now()))
    .bind(character_id.to_string())
    .execute(conn)
    .await?;
    Ok(done.rows_affected() == 1)
}

#[derive(Clone)]
pub struct Notifications {
    db_pool: SqlitePool,
}

impl Notifications {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn list(&self, user_id: &str) -> GameResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(
            "SELECT seq, message, read, created_at FROM notifications WHERE user_id = ? ORDER BY seq DESC",
        )
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await?;
        Ok(rows.into_iter().map(Notification::from).collect())
    }

    pub async fn unread_count(&self, user_id: &str) -> GameResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0")
                .bind(user_id)
                .fetch_one(&self.db_pool)
                .await?;
        Ok(count)
    }

    pub async fn mark_all_read(&self, user_id: &str) -> GameResult<u64> {
        let done = sqlx::query("UPDATE notifications SET read = 1 WHERE user_id = ? AND read = 0")
            .bind(user_id)
            .execute(&self.db_pool)
            .await?;
        Ok(done.rows_affected())
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/read", post(read_all))
}

#[debug_handler(state = AppState)]
async fn list(State(notifications): State<Notifications>, Caller(user_id): Caller) -> AppResult<Json<Value>> {
    let unread = notifications.unread_count(&user_id).await?;
    let items = notifications.list(&user_id).await?;
    Ok(Json(json!({ "unread": unread, "notifications": items })))
}

#[debug_handler(state = AppState)]
async fn read_all(State(notifications): State<Notifications>, Caller(user_id): Caller) -> AppResult<Json<Value>> {
    let marked = notifications.mark_all_read(&user_id).await?;
    Ok(Json(json!({ "marked": marked })))
}
