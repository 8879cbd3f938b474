use axum::{Json, debug_handler, extract::State, http::StatusCode};
use serde::Deserialize;
use uuid::Uuid;

use crate::{AppResult, AppState, ledger::Ledger, lifecycle::Lifecycle, model::GameInstance, session::Caller};

#[derive(Debug, Deserialize)]
pub(crate) struct NewGame {
    name: String,
    universe_id: Uuid,
    character_id: Uuid,
    setup_prompt: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_game(
    State(ledger): State<Ledger>,
    State(lifecycle): State<Lifecycle>,
    Caller(user_id): Caller,

    Json(NewGame { name, universe_id, character_id, setup_prompt }): Json<NewGame>,
) -> AppResult<(StatusCode, Json<GameInstance>)> {
    ledger.owned_character(character_id, &user_id).await?;
    let game = lifecycle
        .create(&name, universe_id, character_id, setup_prompt, &user_id)
        .await?;

    Ok((StatusCode::CREATED, Json(game)))
}
