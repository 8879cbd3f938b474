mod game;
mod membership;
mod new;
mod transition;

use axum::{
    Router,
    routing::{get, post},
};

use crate::{AppState, chat};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(game::list).post(new::new_game))
        .route("/{id}", get(game::detail))
        .route("/{id}/join", post(membership::join))
        .route("/{id}/leave", post(membership::leave))
        .route("/{id}/bound-character", get(membership::bound_character))
        .route("/{id}/transition", post(transition::transition))
        .route("/{id}/messages", get(game::messages))
        .route("/{id}/ws", get(chat::game_ws))
}
