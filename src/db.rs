use std::{str::FromStr, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

// ids are uuid v7 text, times are unix millis.
// bindings keep history: rows are deactivated, never deleted, and the partial
// index allows a single active row per character.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS universes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS characters (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS characters_owner ON characters (owner);

CREATE TABLE IF NOT EXISTS games (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    universe_id TEXT NOT NULL REFERENCES universes (id),
    status TEXT NOT NULL DEFAULT 'waiting',
    setup_prompt TEXT,
    created_by TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS games_universe ON games (universe_id);

CREATE TABLE IF NOT EXISTS bindings (
    id TEXT PRIMARY KEY,
    character_id TEXT NOT NULL REFERENCES characters (id),
    game_id TEXT NOT NULL REFERENCES games (id),
    active INTEGER NOT NULL,
    bound_at INTEGER NOT NULL,
    released_at INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS bindings_one_active ON bindings (character_id) WHERE active = 1;
CREATE INDEX IF NOT EXISTS bindings_game ON bindings (game_id, active);

CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    game_id TEXT NOT NULL REFERENCES games (id),
    sender TEXT NOT NULL,
    body TEXT NOT NULL,
    sent_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_game ON messages (game_id, seq);

CREATE TABLE IF NOT EXISTS game_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    universe_id TEXT NOT NULL REFERENCES universes (id),
    game_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    event_time INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS game_events_universe ON game_events (universe_id, seq);

CREATE TABLE IF NOT EXISTS universe_news (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    universe_id TEXT NOT NULL REFERENCES universes (id),
    summary TEXT NOT NULL,
    published_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conflicts (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    universe_id TEXT NOT NULL REFERENCES universes (id),
    description TEXT NOT NULL,
    game_ids TEXT NOT NULL,
    detected_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    message TEXT NOT NULL,
    read INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS notifications_user ON notifications (user_id, read);
"#;

pub async fn connect(url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let db_pool = SqlitePoolOptions::new()
        .max_connections(16)
        .connect_with(options)
        .await?;

    init(&db_pool).await?;
    Ok(db_pool)
}

pub async fn init(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(db_pool).await?;
    tracing::debug!("schema ready");
    Ok(())
}
