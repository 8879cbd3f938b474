//! Character registry and the binding ledger.
//!
//! A binding ties a character to a game. The store keeps at most one active
//! binding per character (partial unique index), so every bind is a single
//! guarded insert: losing a race surfaces as a unique violation, never as a
//! silent reassignment.

use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    error::{GameError, GameResult},
    model::{self, Binding, Character, GameStatus},
};

// a competing binding can be released between our failed insert and the lookup
const BIND_ATTEMPTS: usize = 3;

#[derive(sqlx::FromRow)]
pub(crate) struct CharacterRow {
    id: String,
    owner: String,
    name: String,
    attributes: String,
    created_at: i64,
}

impl TryFrom<CharacterRow> for Character {
    type Error = GameError;

    fn try_from(row: CharacterRow) -> GameResult<Self> {
        Ok(Character {
            id: Uuid::parse_str(&row.id)?,
            owner: row.owner,
            name: row.name,
            attributes: serde_json::from_str(&row.attributes)?,
            created_at: model::from_millis(row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct BindingRow {
    id: String,
    character_id: String,
    game_id: String,
    active: bool,
    bound_at: i64,
    released_at: Option<i64>,
}

impl TryFrom<BindingRow> for Binding {
    type Error = GameError;

    fn try_from(row: BindingRow) -> GameResult<Self> {
        Ok(Binding {
            id: Uuid::parse_str(&row.id)?,
            character_id: Uuid::parse_str(&row.character_id)?,
            game_id: Uuid::parse_str(&row.game_id)?,
            active: row.active,
            bound_at: model::from_millis(row.bound_at),
            released_at: row.released_at.map(model::from_millis),
        })
    }
}

pub(crate) enum BindOutcome {
    Bound(Binding),
    Refused,
}

const CHARACTER_COLUMNS: &str = "c.id, c.owner, c.name, c.attributes, c.created_at";
const BINDING_COLUMNS: &str = "id, character_id, game_id, active, bound_at, released_at";

/// Check-and-set a binding on an existing connection (plain or inside a
/// transaction). The game must be waiting or active.
pub(crate) async fn bind(
    conn: &mut SqliteConnection,
    character_id: Uuid,
    game_id: Uuid,
) -> GameResult<BindOutcome> {
    let sql = "INSERT INTO bindings (id, character_id, game_id, active, bound_at) \
               SELECT ?1, ?2, ?3, 1, ?4 \
               WHERE EXISTS (SELECT 1 FROM characters WHERE id = ?2) \
               AND EXISTS (SELECT 1 FROM games WHERE id = ?3 AND status IN ('waiting', 'active'))";

    for _ in 0..BIND_ATTEMPTS {
        let binding = Binding {
            id: Uuid::now_v7(),
            character_id,
            game_id,
            active: true,
            bound_at: model::now(),
            released_at: None,
        };

        let inserted = sqlx::query(sql)
            .bind(binding.id.to_string())
            .bind(character_id.to_string())
            .bind(game_id.to_string())
            .bind(model::to_millis(binding.bound_at))
            .execute(&mut *conn)
            .await;

        match inserted {
            Ok(done) if done.rows_affected() == 1 => {
                tracing::debug!(%character_id, %game_id, "character bound");
                return Ok(BindOutcome::Bound(binding));
            }
            Ok(_) => return Ok(BindOutcome::Refused),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                match active_binding(&mut *conn, character_id).await? {
                    Some(existing) if existing.game_id == game_id => {
                        return Ok(BindOutcome::Bound(existing));
                    }
                    Some(existing) => {
                        tracing::info!(
                            %character_id,
                            requested = %game_id,
                            bound = %existing.game_id,
                            "bind refused, character already bound"
                        );
                        return Err(GameError::AlreadyBound {
                            character_id,
                            game_id: existing.game_id,
                        });
                    }
                    None => continue,
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(GameError::AlreadyBound { character_id, game_id })
}

/// Explain why a guarded bind inserted nothing.
pub(crate) async fn refusal(
    conn: &mut SqliteConnection,
    character_id: Uuid,
    game_id: Uuid,
) -> GameResult<GameError> {
    let character: Option<(String,)> = sqlx::query_as("SELECT id FROM characters WHERE id = ?")
        .bind(character_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    if character.is_none() {
        return Ok(GameError::CharacterNotFound(character_id));
    }

    let status: Option<(String,)> = sqlx::query_as("SELECT status FROM games WHERE id = ?")
        .bind(game_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    let Some((status,)) = status else {
        return Ok(GameError::GameNotFound(game_id));
    };

    let status: GameStatus = status.parse().map_err(GameError::DataIntegrity)?;
    Ok(GameError::GameNotJoinable { game_id, status })
}

pub(crate) async fn active_binding(
    conn: &mut SqliteConnection,
    character_id: Uuid,
) -> GameResult<Option<Binding>> {
    sqlx::query_as::<_, BindingRow>(&format!(
        "SELECT {BINDING_COLUMNS} FROM bindings WHERE character_id = ? AND active = 1"
    ))
    .bind(character_id.to_string())
    .fetch_optional(conn)
    .await?
    .map(Binding::try_from)
    .transpose()
}

/// Deactivate every active binding of a game, returning the released characters.
pub(crate) async fn release_all(conn: &mut SqliteConnection, game_id: Uuid) -> GameResult<Vec<Uuid>> {
    let released: Vec<(String,)> = sqlx::query_as(
        "UPDATE bindings SET active = 0, released_at = ? \
         WHERE game_id = ? AND active = 1 RETURNING character_id",
    )
    .bind(model::to_millis(model::now()))
    .bind(game_id.to_string())
    .fetch_all(conn)
    .await?;

    released
        .into_iter()
        .map(|(id,)| Uuid::parse_str(&id).map_err(GameError::from))
        .collect()
}

pub(crate) async fn participants_in(
    conn: &mut SqliteConnection,
    game_id: Uuid,
) -> GameResult<Vec<Binding>> {
    sqlx::query_as::<_, BindingRow>(&format!(
        "SELECT {BINDING_COLUMNS} FROM bindings WHERE game_id = ? AND active = 1 ORDER BY bound_at, rowid"
    ))
    .bind(game_id.to_string())
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(Binding::try_from)
    .collect()
}

#[derive(Clone)]
pub struct Ledger {
    db_pool: SqlitePool,
}

impl Ledger {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn create_character(
        &self,
        owner: &str,
        name: &str,
        attributes: Value,
    ) -> GameResult<Character> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GameError::InvalidPayload("character name is empty".to_owned()));
        }
        if !attributes.is_object() {
            return Err(GameError::InvalidPayload("character attributes must be an object".to_owned()));
        }

        let character = Character {
            id: Uuid::now_v7(),
            owner: owner.to_owned(),
            name: name.to_owned(),
            attributes,
            created_at: model::now(),
        };

        sqlx::query("INSERT INTO characters (id, owner, name, attributes, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(character.id.to_string())
            .bind(&character.owner)
            .bind(&character.name)
            .bind(character.attributes.to_string())
            .bind(model::to_millis(character.created_at))
            .execute(&self.db_pool)
            .await?;

        tracing::info!(character_id = %character.id, owner, "character created");
        Ok(character)
    }

    pub async fn character(&self, character_id: Uuid) -> GameResult<Option<Character>> {
        sqlx::query_as::<_, CharacterRow>(&format!(
            "SELECT {CHARACTER_COLUMNS} FROM characters c WHERE c.id = ?"
        ))
        .bind(character_id.to_string())
        .fetch_optional(&self.db_pool)
        .await?
        .map(Character::try_from)
        .transpose()
    }

    /// The character, if it exists and belongs to `user_id`.
    pub async fn owned_character(&self, character_id: Uuid, user_id: &str) -> GameResult<Character> {
        match self.character(character_id).await? {
            Some(character) if character.owner == user_id => Ok(character),
            Some(_) => Err(GameError::Forbidden(format!(
                "character {character_id} belongs to someone else"
            ))),
            None => Err(GameError::CharacterNotFound(character_id)),
        }
    }

    pub async fn bind_active(&self, character_id: Uuid, game_id: Uuid) -> GameResult<Binding> {
        let mut conn = self.db_pool.acquire().await?;
        match bind(&mut conn, character_id, game_id).await? {
            BindOutcome::Bound(binding) => Ok(binding),
            BindOutcome::Refused => Err(refusal(&mut conn, character_id, game_id).await?),
        }
    }

    pub async fn release(&self, character_id: Uuid, game_id: Uuid) -> GameResult<()> {
        let done = sqlx::query(
            "UPDATE bindings SET active = 0, released_at = ? \
             WHERE character_id = ? AND game_id = ? AND active = 1",
        )
        .bind(model::to_millis(model::now()))
        .bind(character_id.to_string())
        .bind(game_id.to_string())
        .execute(&self.db_pool)
        .await?;

        if done.rows_affected() == 0 {
            tracing::info!(%character_id, %game_id, "release of a binding that is not active");
            return Err(GameError::NotBound { character_id, game_id });
        }

        tracing::debug!(%character_id, %game_id, "character released");
        Ok(())
    }

    pub async fn list_available(&self, user_id: &str) -> GameResult<Vec<Character>> {
        sqlx::query_as::<_, CharacterRow>(&format!(
            "SELECT {CHARACTER_COLUMNS} FROM characters c \
             WHERE c.owner = ? \
             AND NOT EXISTS (SELECT 1 FROM bindings b WHERE b.character_id = c.id AND b.active = 1) \
             ORDER BY c.name, c.created_at"
        ))
        .bind(user_id)
        .fetch_all(&self.db_pool)
        .await?
        .into_iter()
        .map(Character::try_from)
        .collect()
    }

    pub async fn bound_character_for(
        &self,
        game_id: Uuid,
        user_id: Option<&str>,
    ) -> GameResult<Option<Character>> {
        sqlx::query_as::<_, CharacterRow>(&format!(
            "SELECT {CHARACTER_COLUMNS} FROM bindings b \
             JOIN characters c ON c.id = b.character_id \
             WHERE b.game_id = ?1 AND b.active = 1 AND (?2 IS NULL OR c.owner = ?2) \
             ORDER BY b.bound_at, b.rowid LIMIT 1"
        ))
        .bind(game_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.db_pool)
        .await?
        .map(Character::try_from)
        .transpose()
    }

    pub async fn active_binding(&self, character_id: Uuid) -> GameResult<Option<Binding>> {
        let mut conn = self.db_pool.acquire().await?;
        active_binding(&mut conn, character_id).await
    }

    pub async fn participants(&self, game_id: Uuid) -> GameResult<Vec<Binding>> {
        let mut conn = self.db_pool.acquire().await?;
        participants_in(&mut conn, game_id).await
    }
}
