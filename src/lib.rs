pub mod appresult;
pub mod characters;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod games;
pub mod ledger;
pub mod lifecycle;
pub mod messages;
pub mod model;
pub mod notifications;
pub mod session;
pub mod universe;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::{Router, extract::FromRef, routing::post};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

pub use appresult::{AppError, AppResult};
pub use config::Config;

use chat::ChatHub;
use ledger::Ledger;
use lifecycle::Lifecycle;
use notifications::Notifications;
use universe::Universes;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub config: Arc<Config>,
    pub ledger: Ledger,
    pub lifecycle: Lifecycle,
    pub chat: ChatHub,
    pub universes: Universes,
    pub notifications: Notifications,
}

impl AppState {
    /// Must be called inside a tokio runtime: the chat hub starts its status listener.
    pub fn new(db_pool: SqlitePool, config: Config) -> Self {
        let ledger = Ledger::new(db_pool.clone());
        let lifecycle = Lifecycle::new(db_pool.clone(), config.operators.clone());
        let chat = ChatHub::new(db_pool.clone(), lifecycle.clone(), ledger.clone(), config.chat_buffer);

        Self {
            universes: Universes::new(db_pool.clone()),
            notifications: Notifications::new(db_pool.clone()),
            config: Arc::new(config),
            ledger,
            lifecycle,
            chat,
            db_pool,
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            app_state.config.session_idle_minutes,
        )));

    Router::new()
        .route("/session", post(session::dev_login))
        .route("/logout", post(session::logout))
        .nest("/characters", characters::router())
        .nest("/games", games::router())
        .nest("/universes", universe::router())
        .nest("/notifications", notifications::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
