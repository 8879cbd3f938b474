//! Scratch environments for unit tests: a fresh SQLite file per test.

use std::collections::HashSet;

use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use crate::{
    db,
    ledger::Ledger,
    lifecycle::Lifecycle,
    model::{Character, GameInstance},
    notifications::Notifications,
    universe::Universes,
};

pub(crate) const OPERATOR: &str = "operator";

pub(crate) struct Scratch {
    _dir: TempDir,
    pub db_pool: SqlitePool,
    pub ledger: Ledger,
    pub lifecycle: Lifecycle,
    pub universes: Universes,
    pub notifications: Notifications,
    pub universe_id: Uuid,
}

pub(crate) async fn scratch() -> Scratch {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("scratch.db").display());
    let db_pool = db::connect(&url).await.unwrap();

    let universes = Universes::new(db_pool.clone());
    let universe = universes.create_universe("Testverse", "scratch universe").await.unwrap();

    Scratch {
        _dir: dir,
        ledger: Ledger::new(db_pool.clone()),
        lifecycle: Lifecycle::new(db_pool.clone(), HashSet::from([OPERATOR.to_owned()])),
        notifications: Notifications::new(db_pool.clone()),
        universes,
        universe_id: universe.id,
        db_pool,
    }
}

impl Scratch {
    /// A new character owned by `owner`, founding a waiting game called "<name>'s game".
    pub(crate) async fn game_with_founder(&self, owner: &str, name: &str) -> (Character, GameInstance) {
        let character = self.ledger.create_character(owner, name, json!({})).await.unwrap();
        let game = self
            .lifecycle
            .create(&format!("{name}'s game"), self.universe_id, character.id, None, owner)
            .await
            .unwrap();
        (character, game)
    }

    pub(crate) async fn active_bindings(&self, character_id: Uuid) -> i64 {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM bindings WHERE character_id = ? AND active = 1")
                .bind(character_id.to_string())
                .fetch_one(&self.db_pool)
                .await
                .unwrap();
        count
    }
}
