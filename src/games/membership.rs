use axum::{
    Json, debug_handler,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    AppResult, AppState,
    ledger::Ledger,
    lifecycle::Lifecycle,
    model::{Binding, Character},
    session::Caller,
};

#[derive(Debug, Deserialize)]
pub(crate) struct CharacterChoice {
    character_id: Uuid,
}

#[debug_handler(state = AppState)]
pub(crate) async fn join(
    State(ledger): State<Ledger>,
    State(lifecycle): State<Lifecycle>,
    Caller(user_id): Caller,
    Path(game_id): Path<Uuid>,

    Json(CharacterChoice { character_id }): Json<CharacterChoice>,
) -> AppResult<Json<Binding>> {
    ledger.owned_character(character_id, &user_id).await?;
    Ok(Json(lifecycle.join(game_id, character_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn leave(
    State(ledger): State<Ledger>,
    Caller(user_id): Caller,
    Path(game_id): Path<Uuid>,

    Json(CharacterChoice { character_id }): Json<CharacterChoice>,
) -> AppResult<StatusCode> {
    ledger.owned_character(character_id, &user_id).await?;
    ledger.release(character_id, game_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[debug_handler(state = AppState)]
pub(crate) async fn bound_character(
    State(ledger): State<Ledger>,
    State(lifecycle): State<Lifecycle>,
    Caller(user_id): Caller,
    Path(game_id): Path<Uuid>,
) -> AppResult<Json<Option<Character>>> {
    lifecycle.game(game_id).await?;
    Ok(Json(ledger.bound_character_for(game_id, Some(&user_id)).await?))
}
