use axum::{
    Json, debug_handler,
    extract::{Path, Query, State},
};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    ledger::Ledger,
    lifecycle::{GameFilter, Lifecycle},
    messages,
    model::{Binding, GameInstance, GameSummary, Message},
    session::Caller,
};

#[derive(Serialize)]
pub(crate) struct GameDetail {
    #[serde(flatten)]
    game: GameInstance,
    participants: Vec<Binding>,
    operator: bool,
}

#[debug_handler(state = AppState)]
pub(crate) async fn list(
    State(lifecycle): State<Lifecycle>,
    _: Caller,
    Query(filter): Query<GameFilter>,
) -> AppResult<Json<Vec<GameSummary>>> {
    Ok(Json(lifecycle.list(&filter).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn detail(
    State(lifecycle): State<Lifecycle>,
    State(ledger): State<Ledger>,
    Caller(user_id): Caller,
    Path(game_id): Path<Uuid>,
) -> AppResult<Json<GameDetail>> {
    let game = lifecycle.game(game_id).await?;
    let participants = ledger.participants(game_id).await?;
    let operator = lifecycle.is_operator(game_id, &user_id).await?;

    Ok(Json(GameDetail { game, participants, operator }))
}

/// Stored history stays readable after the game ends.
#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    State(db_pool): State<SqlitePool>,
    State(lifecycle): State<Lifecycle>,
    _: Caller,
    Path(game_id): Path<Uuid>,
) -> AppResult<Json<Vec<Message>>> {
    lifecycle.game(game_id).await?;
    Ok(Json(messages::history(&db_pool, game_id).await?))
}
