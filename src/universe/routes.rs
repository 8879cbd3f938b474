use std::sync::Arc;

use axum::{
    Json, Router, debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    AppResult, AppState, Config,
    error::{GameError, GameResult},
    model::{ConflictRecord, GameEvent, GameInstance, NewsItem, Universe},
    session::Caller,
};

use super::{EventGraph, NewsOrder, Universes};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list).post(create))
        .route("/{id}", get(detail))
        .route("/{id}/games", get(games))
        .route("/{id}/news", get(news).post(publish_news))
        .route("/{id}/conflicts", get(conflicts).post(record_conflict))
        .route("/{id}/events", get(events))
        .route("/{id}/graph", get(graph))
}

#[derive(Deserialize)]
pub(crate) struct NewUniverse {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
pub(crate) struct NewsQuery {
    #[serde(default)]
    order: NewsOrder,
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct LimitQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(crate) struct NewNews {
    summary: String,
}

#[derive(Deserialize)]
pub(crate) struct NewConflict {
    description: String,
    #[serde(default)]
    game_ids: Vec<Uuid>,
}

/// News and conflicts come from collaborators running under a configured operator account.
fn collaborator(config: &Config, user_id: &str, universe_id: Uuid) -> GameResult<()> {
    if config.operators.contains(user_id) {
        return Ok(());
    }
    tracing::warn!(%universe_id, %user_id, "universe hook called by a non-operator");
    Err(GameError::Forbidden(format!("{user_id} may not write to universe {universe_id}")))
}

#[debug_handler(state = AppState)]
async fn list(State(universes): State<Universes>, _: Caller) -> AppResult<Json<Vec<Universe>>> {
    Ok(Json(universes.universes().await?))
}

#[debug_handler(state = AppState)]
async fn create(
    State(universes): State<Universes>,
    Caller(user_id): Caller,
    Json(NewUniverse { name, description }): Json<NewUniverse>,
) -> AppResult<(StatusCode, Json<Universe>)> {
    let universe = universes.create_universe(&name, &description).await?;
    tracing::debug!(universe_id = %universe.id, %user_id, "universe created over http");
    Ok((StatusCode::CREATED, Json(universe)))
}

#[debug_handler(state = AppState)]
async fn detail(
    State(universes): State<Universes>,
    _: Caller,
    Path(universe_id): Path<Uuid>,
) -> AppResult<Json<Universe>> {
    Ok(Json(universes.universe(universe_id).await?))
}

#[debug_handler(state = AppState)]
async fn games(
    State(universes): State<Universes>,
    _: Caller,
    Path(universe_id): Path<Uuid>,
) -> AppResult<Json<Vec<GameInstance>>> {
    Ok(Json(universes.games(universe_id).await?))
}

#[debug_handler(state = AppState)]
async fn news(
    State(universes): State<Universes>,
    _: Caller,
    Path(universe_id): Path<Uuid>,
    Query(NewsQuery { order, limit }): Query<NewsQuery>,
) -> AppResult<Json<Vec<NewsItem>>> {
    Ok(Json(universes.news(universe_id, order, limit).await?))
}

#[debug_handler(state = AppState)]
async fn publish_news(
    State(universes): State<Universes>,
    State(config): State<Arc<Config>>,
    Caller(user_id): Caller,
    Path(universe_id): Path<Uuid>,
    Json(NewNews { summary }): Json<NewNews>,
) -> AppResult<(StatusCode, Json<NewsItem>)> {
    collaborator(&config, &user_id, universe_id)?;
    Ok((StatusCode::CREATED, Json(universes.publish_news(universe_id, &summary).await?)))
}

#[debug_handler(state = AppState)]
async fn conflicts(
    State(universes): State<Universes>,
    _: Caller,
    Path(universe_id): Path<Uuid>,
    Query(LimitQuery { limit }): Query<LimitQuery>,
) -> AppResult<Json<Vec<ConflictRecord>>> {
    Ok(Json(universes.conflicts(universe_id, limit).await?))
}

#[debug_handler(state = AppState)]
async fn record_conflict(
    State(universes): State<Universes>,
    State(config): State<Arc<Config>>,
    Caller(user_id): Caller,
    Path(universe_id): Path<Uuid>,
    Json(NewConflict { description, game_ids }): Json<NewConflict>,
) -> AppResult<(StatusCode, Json<ConflictRecord>)> {
    collaborator(&config, &user_id, universe_id)?;
    let record = universes.record_conflict(universe_id, &description, game_ids).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[debug_handler(state = AppState)]
async fn events(
    State(universes): State<Universes>,
    _: Caller,
    Path(universe_id): Path<Uuid>,
) -> AppResult<Json<Vec<GameEvent>>> {
    Ok(Json(universes.events(universe_id).await?))
}

#[debug_handler(state = AppState)]
async fn graph(
    State(universes): State<Universes>,
    _: Caller,
    Path(universe_id): Path<Uuid>,
) -> AppResult<Json<EventGraph>> {
    Ok(Json(universes.event_graph(universe_id).await?))
}
