use axum::{
    Json, debug_handler,
    extract::{Path, State},
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    lifecycle::{Lifecycle, TransitionPayload},
    model::{GameEvent, GameStatus},
    session::Caller,
};

#[derive(Debug, Deserialize)]
pub(crate) struct TransitionRequest {
    status: GameStatus,
    #[serde(default)]
    payload: TransitionPayload,
}

#[debug_handler(state = AppState)]
pub(crate) async fn transition(
    State(lifecycle): State<Lifecycle>,
    Caller(user_id): Caller,
    Path(game_id): Path<Uuid>,
    Json(TransitionRequest { status, payload }): Json<TransitionRequest>,
) -> AppResult<Json<Vec<GameEvent>>> {
    Ok(Json(lifecycle.transition_as(&user_id, game_id, status, payload).await?))
}
