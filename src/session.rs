//! Session identity. Authentication itself happens elsewhere; handlers only see
//! the `user_id` stored in the tower-sessions session.

use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{FromRequestParts, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use tower_sessions::Session;

use crate::{AppError, AppResult, AppState, config::Config};

pub const USER_ID: &str = "user_id";

/// The signed-in user. Rejects with 401 when the session has no user.
#[derive(Debug, Clone)]
pub struct Caller(pub String);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;

        match session.get::<String>(USER_ID).await {
            Ok(Some(user_id)) => Ok(Caller(user_id)),
            Ok(None) => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "unauthenticated", "message": "sign in first" })),
            )
                .into_response()),
            Err(err) => Err(AppError::from(err).into_response()),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct DevLogin {
    user_id: String,
}

/// Development stand-in for the external login flow.
#[debug_handler(state = AppState)]
pub(crate) async fn dev_login(
    State(config): State<Arc<Config>>,
    session: Session,
    Json(DevLogin { user_id }): Json<DevLogin>,
) -> AppResult<Response> {
    if !config.dev_login {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "user_id is empty").into_response());
    }

    session.cycle_id().await?;
    session.insert(USER_ID, user_id).await?;
    tracing::info!(user_id, "dev login");
    Ok(Json(json!({ "user_id": user_id })).into_response())
}

#[debug_handler]
pub(crate) async fn logout(session: Session) -> AppResult<StatusCode> {
    session.flush().await?;
    Ok(StatusCode::NO_CONTENT)
}
