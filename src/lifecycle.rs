//! Game lifecycle: creation, joins and the status state machine.
//!
//! Every transition runs in one transaction that starts with the conditional
//! status update, so transitions on one game are serialized by the store and a
//! join racing a close either lands first (and is released by the close) or is
//! refused.

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{
    error::{GameError, GameResult},
    ledger::{self, BindOutcome},
    messages,
    model::{self, Binding, EventKind, GameEvent, GameInstance, GameStatus, GameSummary},
    notifications,
};

#[derive(sqlx::FromRow)]
pub(crate) struct GameRow {
    id: String,
    name: String,
    universe_id: String,
    status: String,
    setup_prompt: Option<String>,
    created_by: String,
    created_at: i64,
}

impl TryFrom<GameRow> for GameInstance {
    type Error = GameError;

    fn try_from(row: GameRow) -> GameResult<Self> {
        Ok(GameInstance {
            id: Uuid::parse_str(&row.id)?,
            name: row.name,
            universe_id: Uuid::parse_str(&row.universe_id)?,
            status: row.status.parse().map_err(GameError::DataIntegrity)?,
            setup_prompt: row.setup_prompt,
            created_by: row.created_by,
            created_at: model::from_millis(row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    #[sqlx(flatten)]
    game: GameRow,
    universe_name: String,
    players: i64,
}

pub(crate) const GAME_COLUMNS: &str =
    "g.id, g.name, g.universe_id, g.status, g.setup_prompt, g.created_by, g.created_at";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GameFilter {
    pub search: Option<String>,
    pub universe_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub character_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionPayload {
    #[default]
    None,
    Branch { branches: Vec<BranchSpec> },
    Merge {
        with: Vec<Uuid>,
        #[serde(default)]
        name: Option<String>,
    },
}

/// Published after a transition commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub game_id: Uuid,
    pub status: GameStatus,
}

#[derive(Clone)]
pub struct Lifecycle {
    db_pool: SqlitePool,
    operators: Arc<HashSet<String>>,
    changes: broadcast::Sender<StatusChange>,
}

impl Lifecycle {
    pub fn new(db_pool: SqlitePool, operators: HashSet<String>) -> Self {
        Self {
            db_pool,
            operators: Arc::new(operators),
            changes: broadcast::channel(256).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    pub async fn create(
        &self,
        name: &str,
        universe_id: Uuid,
        founding_character_id: Uuid,
        setup_prompt: Option<String>,
        created_by: &str,
    ) -> GameResult<GameInstance> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GameError::InvalidPayload("game name is empty".to_owned()));
        }
        let setup_prompt = setup_prompt.filter(|prompt| !prompt.trim().is_empty());

        let mut tx = self.db_pool.begin().await?;
        let game = match insert_game(&mut tx, name, universe_id, setup_prompt, created_by).await {
            Err(GameError::Database(sqlx::Error::Database(err))) if err.is_foreign_key_violation() => {
                return Err(GameError::UniverseNotFound(universe_id));
            }
            other => other?,
        };

        match ledger::bind(&mut tx, founding_character_id, game.id).await? {
            BindOutcome::Bound(_) => {}
            BindOutcome::Refused => {
                return Err(ledger::refusal(&mut tx, founding_character_id, game.id).await?);
            }
        }

        if let Some(prompt) = &game.setup_prompt {
            messages::append_in(&mut tx, game.id, messages::SYSTEM, prompt).await?;
        }
        tx.commit().await?;

        tracing::info!(game_id = %game.id, %universe_id, founder = %founding_character_id, "game created");
        Ok(game)
    }

    pub async fn join(&self, game_id: Uuid, character_id: Uuid) -> GameResult<Binding> {
        let mut conn = self.db_pool.acquire().await?;
        match ledger::bind(&mut conn, character_id, game_id).await? {
            BindOutcome::Bound(binding) => {
                tracing::info!(%game_id, %character_id, "character joined game");
                Ok(binding)
            }
            BindOutcome::Refused => Err(ledger::refusal(&mut conn, character_id, game_id).await?),
        }
    }

    pub async fn game(&self, game_id: Uuid) -> GameResult<GameInstance> {
        let mut conn = self.db_pool.acquire().await?;
        fetch_game(&mut conn, game_id).await
    }

    pub async fn status(&self, game_id: Uuid) -> GameResult<GameStatus> {
        let status: Option<(String,)> = sqlx::query_as("SELECT status FROM games WHERE id = ?")
            .bind(game_id.to_string())
            .fetch_optional(&self.db_pool)
            .await?;
        let (status,) = status.ok_or(GameError::GameNotFound(game_id))?;
        status.parse().map_err(GameError::DataIntegrity)
    }

    pub async fn list(&self, filter: &GameFilter) -> GameResult<Vec<GameSummary>> {
        let search = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|search| !search.is_empty());

        let rows: Vec<SummaryRow> = sqlx::query_as(&format!(
            "SELECT {GAME_COLUMNS}, u.name AS universe_name, \
             (SELECT COUNT(*) FROM bindings b WHERE b.game_id = g.id AND b.active = 1) AS players \
             FROM games g JOIN universes u ON u.id = g.universe_id \
             WHERE (?1 IS NULL OR g.name LIKE '%' || ?1 || '%') \
             AND (?2 IS NULL OR g.universe_id = ?2) \
             ORDER BY g.created_at DESC, g.rowid DESC"
        ))
        .bind(search)
        .bind(filter.universe_id.map(|id| id.to_string()))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|row| -> GameResult<GameSummary> {
                Ok(GameSummary {
                    game: row.game.try_into()?,
                    universe_name: row.universe_name,
                    players: row.players,
                })
            })
            .collect()
    }

    /// Game creators and configured operators may drive a game's lifecycle.
    pub async fn is_operator(&self, game_id: Uuid, user_id: &str) -> GameResult<bool> {
        if self.operators.contains(user_id) {
            return Ok(true);
        }
        Ok(self.game(game_id).await?.created_by == user_id)
    }

    /// [`Lifecycle::transition`] on behalf of `user_id`, who must operate the
    /// game and every game a merger would consume.
    pub async fn transition_as(
        &self,
        user_id: &str,
        game_id: Uuid,
        target: GameStatus,
        payload: TransitionPayload,
    ) -> GameResult<Vec<GameEvent>> {
        let mut governed = vec![game_id];
        if let TransitionPayload::Merge { with, .. } = &payload {
            governed.extend(with.iter().copied());
        }
        for id in governed {
            if !self.is_operator(id, user_id).await? {
                tracing::warn!(game_id = %id, %user_id, "transition attempt by a non-operator");
                return Err(GameError::Forbidden(format!("{user_id} does not operate game {id}")));
            }
        }

        self.transition(game_id, target, payload).await
    }

    pub async fn transition(
        &self,
        game_id: Uuid,
        target: GameStatus,
        payload: TransitionPayload,
    ) -> GameResult<Vec<GameEvent>> {
        let current = self.status(game_id).await?;
        if !current.can_transition_to(target) {
            return Err(self.illegal(game_id, current, target));
        }

        let (events, changed) = match (target, payload) {
            (GameStatus::Active | GameStatus::Closed, TransitionPayload::None) => {
                self.simple(game_id, target).await?;
                (Vec::new(), vec![game_id])
            }
            (GameStatus::Branched, TransitionPayload::Branch { branches }) => {
                (self.branch(game_id, branches).await?, vec![game_id])
            }
            (GameStatus::Merged, TransitionPayload::Merge { with, name }) => {
                let mut consumed = vec![game_id];
                for other in with {
                    if !consumed.contains(&other) {
                        consumed.push(other);
                    }
                }
                let event = self.merge(&consumed, name).await?;
                (vec![event], consumed)
            }
            (target, payload) => {
                return Err(GameError::InvalidPayload(format!(
                    "payload {payload:?} does not fit a transition to {target}"
                )));
            }
        };

        for game_id in changed {
            // no subscribers is fine
            let _ = self.changes.send(StatusChange { game_id, status: target });
        }
        tracing::info!(%game_id, from = %current, to = %target, events = events.len(), "game transitioned");
        Ok(events)
    }

    fn illegal(&self, game_id: Uuid, from: GameStatus, to: GameStatus) -> GameError {
        tracing::error!(%game_id, %from, %to, "illegal game transition requested");
        GameError::IllegalTransition { game_id, from, to }
    }

    /// A conditional update touched nothing: the game is gone or another
    /// transition got there first.
    async fn lost(&self, game_id: Uuid, to: GameStatus) -> GameError {
        match self.status(game_id).await {
            Ok(from) => self.illegal(game_id, from, to),
            Err(err) => err,
        }
    }

    async fn simple(&self, game_id: Uuid, target: GameStatus) -> GameResult<()> {
        let from = match target {
            GameStatus::Active => "('waiting')",
            _ => "('active')",
        };

        let mut tx = self.db_pool.begin().await?;
        let done = sqlx::query(&format!("UPDATE games SET status = ? WHERE id = ? AND status IN {from}"))
            .bind(target.as_str())
            .bind(game_id.to_string())
            .execute(&mut *tx)
            .await?;
        if done.rows_affected() == 0 {
            drop(tx);
            return Err(self.lost(game_id, target).await);
        }

        if !target.is_open() {
            let released = ledger::release_all(&mut tx, game_id).await?;
            tracing::debug!(%game_id, released = released.len(), "bindings released");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn branch(&self, game_id: Uuid, branches: Vec<BranchSpec>) -> GameResult<Vec<GameEvent>> {
        if branches.is_empty() {
            return Err(GameError::InvalidPayload("a branch needs at least one successor".to_owned()));
        }
        let mut seen = HashSet::new();
        for character_id in branches.iter().flat_map(|branch| &branch.character_ids) {
            if !seen.insert(*character_id) {
                return Err(GameError::InvalidPayload(format!(
                    "character {character_id} appears in more than one branch"
                )));
            }
        }

        let mut tx = self.db_pool.begin().await?;
        if !claim(&mut tx, game_id, GameStatus::Branched, None).await? {
            drop(tx);
            return Err(self.lost(game_id, GameStatus::Branched).await);
        }

        let source = fetch_game(&mut tx, game_id).await?;
        let released = ledger::release_all(&mut tx, game_id).await?;
        if let Some(stranger) = seen.iter().find(|id| !released.contains(id)) {
            return Err(GameError::InvalidPayload(format!(
                "character {stranger} is not playing in game {game_id}"
            )));
        }

        let mut events = Vec::with_capacity(branches.len());
        for branch in branches {
            let name = match branch.name.as_deref().map(str::trim) {
                Some(label) if !label.is_empty() => format!("Branch of {}: {label}", source.name),
                _ => format!("Branch of {}", source.name),
            };
            let child = insert_game(&mut tx, &name, source.universe_id, None, &source.created_by).await?;

            for character_id in &branch.character_ids {
                move_character(&mut tx, *character_id, &child).await?;
            }
            messages::append_in(
                &mut tx,
                child.id,
                messages::SYSTEM,
                &format!("Branched from {}.", source.name),
            )
            .await?;

            let event = record_event(
                &mut tx,
                source.universe_id,
                child.id,
                EventKind::BranchedFrom { original_game_id: game_id },
            )
            .await?;
            events.push(event);
        }

        tx.commit().await?;
        Ok(events)
    }

    async fn merge(&self, consumed: &[Uuid], name: Option<String>) -> GameResult<GameEvent> {
        if consumed.len() < 2 {
            return Err(GameError::InvalidPayload("a merger needs at least two games".to_owned()));
        }

        let mut tx = self.db_pool.begin().await?;
        let mut universe_id = None;
        let mut sources = Vec::with_capacity(consumed.len());
        for game_id in consumed {
            if !claim(&mut tx, *game_id, GameStatus::Merged, universe_id).await? {
                drop(tx);
                return Err(self.merge_refusal(*game_id, universe_id).await);
            }
            let source = fetch_game(&mut tx, *game_id).await?;
            universe_id = Some(source.universe_id);
            sources.push(source);
        }
        let universe_id = universe_id.ok_or_else(|| GameError::InvalidPayload("nothing to merge".to_owned()))?;

        let name = match name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => {
                let names: Vec<&str> = sources.iter().map(|source| source.name.as_str()).collect();
                format!("Merged: {}", names.join(" + "))
            }
        };
        let first = &sources[0];
        let target = insert_game(&mut tx, &name, universe_id, None, &first.created_by).await?;

        for source in &sources {
            for character_id in ledger::release_all(&mut tx, source.id).await? {
                move_character(&mut tx, character_id, &target).await?;
            }
        }
        messages::append_in(&mut tx, target.id, messages::SYSTEM, &format!("{name} begins.")).await?;

        let event = record_event(
            &mut tx,
            universe_id,
            target.id,
            EventKind::Merger { from_instance_ids: consumed.to_vec() },
        )
        .await?;

        tx.commit().await?;
        tracing::info!(target = %target.id, sources = consumed.len(), "games merged");
        Ok(event)
    }

    async fn merge_refusal(&self, game_id: Uuid, universe_id: Option<Uuid>) -> GameError {
        match (self.game(game_id).await, universe_id) {
            (Ok(game), Some(universe_id)) if game.universe_id != universe_id => GameError::InvalidPayload(
                format!("game {game_id} belongs to another universe"),
            ),
            (Ok(game), _) => self.illegal(game_id, game.status, GameStatus::Merged),
            (Err(err), _) => err,
        }
    }
}

/// Conditionally move an open game to a terminal status.
async fn claim(
    conn: &mut SqliteConnection,
    game_id: Uuid,
    target: GameStatus,
    universe_id: Option<Uuid>,
) -> GameResult<bool> {
    let done = sqlx::query(
        "UPDATE games SET status = ?1 \
         WHERE id = ?2 AND status IN ('waiting', 'active') AND (?3 IS NULL OR universe_id = ?3)",
    )
    .bind(target.as_str())
    .bind(game_id.to_string())
    .bind(universe_id.map(|id| id.to_string()))
    .execute(conn)
    .await?;
    Ok(done.rows_affected() == 1)
}

async fn move_character(conn: &mut SqliteConnection, character_id: Uuid, game: &GameInstance) -> GameResult<()> {
    match ledger::bind(&mut *conn, character_id, game.id).await? {
        BindOutcome::Bound(_) => {}
        BindOutcome::Refused => return Err(ledger::refusal(&mut *conn, character_id, game.id).await?),
    }

    let moved = notifications::notify_owner_in(
        &mut *conn,
        character_id,
        &format!("Your character now plays in {}.", game.name),
    )
    .await?;
    if !moved {
        return Err(GameError::CharacterNotFound(character_id));
    }
    Ok(())
}

async fn insert_game(
    conn: &mut SqliteConnection,
    name: &str,
    universe_id: Uuid,
    setup_prompt: Option<String>,
    created_by: &str,
) -> GameResult<GameInstance> {
    let game = GameInstance {
        id: Uuid::now_v7(),
        name: name.to_owned(),
        universe_id,
        status: GameStatus::Waiting,
        setup_prompt,
        created_by: created_by.to_owned(),
        created_at: model::now(),
    };

    sqlx::query(
        "INSERT INTO games (id, name, universe_id, status, setup_prompt, created_by, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(game.id.to_string())
    .bind(&game.name)
    .bind(game.universe_id.to_string())
    .bind(game.status.as_str())
    .bind(&game.setup_prompt)
    .bind(&game.created_by)
    .bind(model::to_millis(game.created_at))
    .execute(conn)
    .await?;

    Ok(game)
}

pub(crate) async fn fetch_game(conn: &mut SqliteConnection, game_id: Uuid) -> GameResult<GameInstance> {
    sqlx::query_as::<_, GameRow>(&format!("SELECT {GAME_COLUMNS} FROM games g WHERE g.id = ?"))
        .bind(game_id.to_string())
        .fetch_optional(conn)
        .await?
        .ok_or(GameError::GameNotFound(game_id))?
        .try_into()
}

async fn record_event(
    conn: &mut SqliteConnection,
    universe_id: Uuid,
    game_id: Uuid,
    kind: EventKind,
) -> GameResult<GameEvent> {
    let time = model::now();
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO game_events (universe_id, game_id, event_type, payload, event_time) \
         VALUES (?, ?, ?, ?, ?) RETURNING seq",
    )
    .bind(universe_id.to_string())
    .bind(game_id.to_string())
    .bind(kind.event_type())
    .bind(serde_json::to_string(&kind)?)
    .bind(model::to_millis(time))
    .fetch_one(conn)
    .await?;

    Ok(GameEvent { id, universe_id, game_id, kind, time })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{self, OPERATOR};

    #[tokio::test]
    async fn create_binds_the_founder_and_waits() {
        let env = testing::scratch().await;
        let (aria, game) = env.game_with_founder("alice", "Aria").await;

        assert_eq!(game.status, GameStatus::Waiting);
        assert_eq!(env.lifecycle.status(game.id).await.unwrap(), GameStatus::Waiting);
        let bound = env.ledger.active_binding(aria.id).await.unwrap().unwrap();
        assert_eq!(bound.game_id, game.id);
    }

    #[tokio::test]
    async fn create_with_a_busy_founder_leaves_no_game_behind() {
        let env = testing::scratch().await;
        let (aria, _) = env.game_with_founder("alice", "Aria").await;

        let second = env.lifecycle.create("Second", env.universe_id, aria.id, None, "alice").await;
        assert!(matches!(second, Err(GameError::AlreadyBound { .. })));
        let games = env.lifecycle.list(&GameFilter::default()).await.unwrap();
        assert_eq!(games.len(), 1);
    }

    #[tokio::test]
    async fn create_in_unknown_universe_fails() {
        let env = testing::scratch().await;
        let aria = env.ledger.create_character("alice", "Aria", json!({})).await.unwrap();

        let created = env.lifecycle.create("Lost", Uuid::now_v7(), aria.id, None, "alice").await;
        assert!(matches!(created, Err(GameError::UniverseNotFound(_))));
    }

    #[tokio::test]
    async fn setup_prompt_opens_the_history() {
        let env = testing::scratch().await;
        let aria = env.ledger.create_character("alice", "Aria", json!({})).await.unwrap();
        let game = env
            .lifecycle
            .create("Harbor", env.universe_id, aria.id, Some("Fog rolls in.".to_owned()), "alice")
            .await
            .unwrap();

        let history = messages::history(&env.db_pool, game.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "Fog rolls in.");
        assert_eq!(history[0].sender, messages::SYSTEM);
    }

    #[tokio::test]
    async fn joins_fail_in_every_terminal_state() {
        let env = testing::scratch().await;

        let (_, closed) = env.game_with_founder("alice", "Aria").await;
        env.lifecycle.transition(closed.id, GameStatus::Active, TransitionPayload::None).await.unwrap();
        env.lifecycle.transition(closed.id, GameStatus::Closed, TransitionPayload::None).await.unwrap();

        let (bram, branched) = env.game_with_founder("bob", "Bram").await;
        env.lifecycle
            .transition(
                branched.id,
                GameStatus::Branched,
                TransitionPayload::Branch {
                    branches: vec![BranchSpec { name: None, character_ids: vec![bram.id] }],
                },
            )
            .await
            .unwrap();

        let (_, left) = env.game_with_founder("carol", "Cyra").await;
        let (_, right) = env.game_with_founder("dave", "Dax").await;
        env.lifecycle
            .transition(left.id, GameStatus::Merged, TransitionPayload::Merge { with: vec![right.id], name: None })
            .await
            .unwrap();

        let joiner = env.ledger.create_character("erin", "Eve", json!({})).await.unwrap();
        for game_id in [closed.id, branched.id, left.id, right.id] {
            match env.lifecycle.join(game_id, joiner.id).await {
                Err(GameError::GameNotJoinable { status, .. }) => assert!(!status.is_open()),
                other => panic!("expected GameNotJoinable, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn terminal_states_reject_every_transition() {
        let env = testing::scratch().await;
        let (_, game) = env.game_with_founder("alice", "Aria").await;
        env.lifecycle.transition(game.id, GameStatus::Active, TransitionPayload::None).await.unwrap();
        env.lifecycle.transition(game.id, GameStatus::Closed, TransitionPayload::None).await.unwrap();

        for target in [
            GameStatus::Waiting,
            GameStatus::Active,
            GameStatus::Closed,
            GameStatus::Branched,
            GameStatus::Merged,
        ] {
            match env.lifecycle.transition(game.id, target, TransitionPayload::None).await {
                Err(GameError::IllegalTransition { from, to, .. }) => {
                    assert_eq!(from, GameStatus::Closed);
                    assert_eq!(to, target);
                }
                other => panic!("expected IllegalTransition, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn waiting_games_cannot_close() {
        let env = testing::scratch().await;
        let (_, game) = env.game_with_founder("alice", "Aria").await;

        let closed = env.lifecycle.transition(game.id, GameStatus::Closed, TransitionPayload::None).await;
        assert!(matches!(closed, Err(GameError::IllegalTransition { .. })));
        assert_eq!(env.lifecycle.status(game.id).await.unwrap(), GameStatus::Waiting);
    }

    #[tokio::test]
    async fn mismatched_payload_is_rejected() {
        let env = testing::scratch().await;
        let (_, game) = env.game_with_founder("alice", "Aria").await;

        let branched = env.lifecycle.transition(game.id, GameStatus::Branched, TransitionPayload::None).await;
        assert!(matches!(branched, Err(GameError::InvalidPayload(_))));
        assert_eq!(env.lifecycle.status(game.id).await.unwrap(), GameStatus::Waiting);
    }

    #[tokio::test]
    async fn closing_releases_bindings() {
        let env = testing::scratch().await;
        let (aria, game) = env.game_with_founder("alice", "Aria").await;
        env.lifecycle.transition(game.id, GameStatus::Active, TransitionPayload::None).await.unwrap();
        env.lifecycle.transition(game.id, GameStatus::Closed, TransitionPayload::None).await.unwrap();

        assert!(env.ledger.active_binding(aria.id).await.unwrap().is_none());
        assert_eq!(env.ledger.list_available("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn branch_moves_characters_into_children() {
        let env = testing::scratch().await;
        let (aria, game) = env.game_with_founder("alice", "Aria").await;
        let bram = env.ledger.create_character("bob", "Bram", json!({})).await.unwrap();
        env.lifecycle.join(game.id, bram.id).await.unwrap();
        env.lifecycle.transition(game.id, GameStatus::Active, TransitionPayload::None).await.unwrap();

        let mut changes = env.lifecycle.subscribe();
        let events = env
            .lifecycle
            .transition(
                game.id,
                GameStatus::Branched,
                TransitionPayload::Branch {
                    branches: vec![
                        BranchSpec { name: Some("north".to_owned()), character_ids: vec![aria.id] },
                        BranchSpec { name: None, character_ids: vec![bram.id] },
                    ],
                },
            )
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(env.lifecycle.status(game.id).await.unwrap(), GameStatus::Branched);
        assert_eq!(
            changes.recv().await.unwrap(),
            StatusChange { game_id: game.id, status: GameStatus::Branched }
        );

        let children: Vec<Uuid> = events.iter().map(|event| event.game_id).collect();
        for event in &events {
            assert_eq!(event.kind, EventKind::BranchedFrom { original_game_id: game.id });
        }
        let aria_now = env.ledger.active_binding(aria.id).await.unwrap().unwrap();
        let bram_now = env.ledger.active_binding(bram.id).await.unwrap().unwrap();
        assert_eq!(aria_now.game_id, children[0]);
        assert_eq!(bram_now.game_id, children[1]);

        let north = env.lifecycle.game(children[0]).await.unwrap();
        assert_eq!(north.name, "Branch of Aria's game: north");
        assert_eq!(north.status, GameStatus::Waiting);
        assert_eq!(env.notifications.unread_count("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn branch_refuses_characters_from_elsewhere() {
        let env = testing::scratch().await;
        let (_, game) = env.game_with_founder("alice", "Aria").await;
        let outsider = env.ledger.create_character("bob", "Bram", json!({})).await.unwrap();

        let branched = env
            .lifecycle
            .transition(
                game.id,
                GameStatus::Branched,
                TransitionPayload::Branch {
                    branches: vec![BranchSpec { name: None, character_ids: vec![outsider.id] }],
                },
            )
            .await;
        assert!(matches!(branched, Err(GameError::InvalidPayload(_))));
        assert_eq!(env.lifecycle.status(game.id).await.unwrap(), GameStatus::Waiting);
    }

    #[tokio::test]
    async fn merge_collapses_games_into_a_new_target() {
        let env = testing::scratch().await;
        let (aria, left) = env.game_with_founder("alice", "Aria").await;
        let (bram, right) = env.game_with_founder("bob", "Bram").await;

        let events = env
            .lifecycle
            .transition(left.id, GameStatus::Merged, TransitionPayload::Merge { with: vec![right.id], name: None })
            .await
            .unwrap();

        let [event] = events.as_slice() else { panic!("expected one merger event") };
        assert_eq!(event.kind, EventKind::Merger { from_instance_ids: vec![left.id, right.id] });
        assert_eq!(env.lifecycle.status(left.id).await.unwrap(), GameStatus::Merged);
        assert_eq!(env.lifecycle.status(right.id).await.unwrap(), GameStatus::Merged);

        let target = env.lifecycle.game(event.game_id).await.unwrap();
        assert_eq!(target.name, "Merged: Aria's game + Bram's game");
        for character in [aria.id, bram.id] {
            let binding = env.ledger.active_binding(character).await.unwrap().unwrap();
            assert_eq!(binding.game_id, target.id);
        }
    }

    #[tokio::test]
    async fn merge_is_all_or_nothing() {
        let env = testing::scratch().await;
        let (_, open) = env.game_with_founder("alice", "Aria").await;
        let (_, done) = env.game_with_founder("bob", "Bram").await;
        env.lifecycle.transition(done.id, GameStatus::Active, TransitionPayload::None).await.unwrap();
        env.lifecycle.transition(done.id, GameStatus::Closed, TransitionPayload::None).await.unwrap();

        let merged = env
            .lifecycle
            .transition(open.id, GameStatus::Merged, TransitionPayload::Merge { with: vec![done.id], name: None })
            .await;
        assert!(matches!(merged, Err(GameError::IllegalTransition { from: GameStatus::Closed, .. })));
        assert_eq!(env.lifecycle.status(open.id).await.unwrap(), GameStatus::Waiting);
    }

    #[tokio::test]
    async fn merge_needs_a_partner() {
        let env = testing::scratch().await;
        let (_, game) = env.game_with_founder("alice", "Aria").await;

        let merged = env
            .lifecycle
            .transition(game.id, GameStatus::Merged, TransitionPayload::Merge { with: vec![game.id], name: None })
            .await;
        assert!(matches!(merged, Err(GameError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn operators_act_only_on_games_they_run() {
        let env = testing::scratch().await;
        let (_, hers) = env.game_with_founder("alice", "Aria").await;
        let (_, his) = env.game_with_founder("bob", "Bram").await;
        let merge = || TransitionPayload::Merge { with: vec![his.id], name: None };

        let stolen = env.lifecycle.transition_as("alice", hers.id, GameStatus::Merged, merge()).await;
        assert!(matches!(stolen, Err(GameError::Forbidden(_))));
        assert_eq!(env.lifecycle.status(his.id).await.unwrap(), GameStatus::Waiting);

        let activated = env.lifecycle.transition_as("alice", his.id, GameStatus::Active, TransitionPayload::None).await;
        assert!(matches!(activated, Err(GameError::Forbidden(_))));

        let events = env.lifecycle.transition_as(OPERATOR, hers.id, GameStatus::Merged, merge()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(env.lifecycle.status(his.id).await.unwrap(), GameStatus::Merged);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_racing_close_never_lands_in_a_closed_game() {
        let env = testing::scratch().await;
        for round in 0..5 {
            let (_, game) = env.game_with_founder("alice", &format!("Aria {round}")).await;
            env.lifecycle.transition(game.id, GameStatus::Active, TransitionPayload::None).await.unwrap();
            let joiner = env.ledger.create_character("bob", "Bram", json!({})).await.unwrap();
            let (game_id, joiner_id) = (game.id, joiner.id);

            let lifecycle = env.lifecycle.clone();
            let joining = tokio::spawn(async move { lifecycle.join(game_id, joiner_id).await });
            let lifecycle = env.lifecycle.clone();
            let closing = tokio::spawn(async move {
                lifecycle.transition(game_id, GameStatus::Closed, TransitionPayload::None).await
            });

            closing.await.unwrap().unwrap();
            match joining.await.unwrap() {
                Ok(_) | Err(GameError::GameNotJoinable { .. }) => {}
                Err(other) => panic!("unexpected join error {other:?}"),
            }
            assert!(env.ledger.participants(game_id).await.unwrap().is_empty());
            assert!(env.ledger.active_binding(joiner_id).await.unwrap().is_none());
        }
    }
}
