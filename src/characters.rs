use axum::{
    Json, Router, debug_handler,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{AppResult, AppState, ledger::Ledger, model::Character, session::Caller};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(new_character))
        .route("/available", get(available))
        .route("/{id}", get(character))
}

#[derive(Debug, Deserialize)]
pub(crate) struct NewCharacter {
    name: String,
    #[serde(default = "empty_attributes")]
    attributes: Value,
}

fn empty_attributes() -> Value {
    Value::Object(Map::new())
}

#[debug_handler(state = AppState)]
async fn new_character(
    State(ledger): State<Ledger>,
    Caller(user_id): Caller,
    Json(NewCharacter { name, attributes }): Json<NewCharacter>,
) -> AppResult<(StatusCode, Json<Character>)> {
    let character = ledger.create_character(&user_id, &name, attributes).await?;
    Ok((StatusCode::CREATED, Json(character)))
}

#[debug_handler(state = AppState)]
async fn available(State(ledger): State<Ledger>, Caller(user_id): Caller) -> AppResult<Json<Vec<Character>>> {
    Ok(Json(ledger.list_available(&user_id).await?))
}

#[debug_handler(state = AppState)]
async fn character(
    State(ledger): State<Ledger>,
    Caller(user_id): Caller,
    Path(character_id): Path<Uuid>,
) -> AppResult<Json<Character>> {
    Ok(Json(ledger.owned_character(character_id, &user_id).await?))
}
