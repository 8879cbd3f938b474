//! Universe-wide read projections: news, conflicts, the event log and its graph.
//! News and conflicts are written by external collaborators through the hooks here.

mod graph;
mod routes;

use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::{
    error::{GameError, GameResult},
    lifecycle::{GAME_COLUMNS, GameRow},
    model::{self, ConflictRecord, EventKind, GameEvent, GameInstance, NewsItem, Universe},
};

pub use graph::{EdgeKind, EventGraph, GraphEdge, GraphNode, Tick};
pub use routes::router;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewsOrder {
    #[default]
    Newest,
    Oldest,
}

#[derive(sqlx::FromRow)]
struct UniverseRow {
    id: String,
    name: String,
    description: String,
    created_at: i64,
}

impl TryFrom<UniverseRow> for Universe {
    type Error = GameError;

    fn try_from(row: UniverseRow) -> GameResult<Self> {
        Ok(Universe {
            id: Uuid::parse_str(&row.id)?,
            name: row.name,
            description: row.description,
            created_at: model::from_millis(row.created_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    universe_id: String,
    game_id: String,
    payload: String,
    event_time: i64,
}

impl TryFrom<EventRow> for GameEvent {
    type Error = GameError;

    fn try_from(row: EventRow) -> GameResult<Self> {
        Ok(GameEvent {
            id: row.seq,
            universe_id: Uuid::parse_str(&row.universe_id)?,
            game_id: Uuid::parse_str(&row.game_id)?,
            kind: serde_json::from_str::<EventKind>(&row.payload)?,
            time: model::from_millis(row.event_time),
        })
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

#[derive(Clone)]
pub struct Universes {
    db_pool: SqlitePool,
}

impl Universes {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn create_universe(&self, name: &str, description: &str) -> GameResult<Universe> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GameError::InvalidPayload("universe name is empty".to_owned()));
        }
        let universe = Universe {
            id: Uuid::now_v7(),
            name: name.to_owned(),
            description: description.trim().to_owned(),
            created_at: model::now(),
        };

        let inserted = sqlx::query("INSERT INTO universes (id, name, description, created_at) VALUES (?, ?, ?, ?)")
            .bind(universe.id.to_string())
            .bind(&universe.name)
            .bind(&universe.description)
            .bind(model::to_millis(universe.created_at))
            .execute(&self.db_pool)
            .await;
        match inserted {
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                return Err(GameError::InvalidPayload(format!("universe {name:?} already exists")));
            }
            other => other?,
        };

        tracing::info!(universe_id = %universe.id, name, "universe created");
        Ok(universe)
    }

    pub async fn universes(&self) -> GameResult<Vec<Universe>> {
        sqlx::query_as::<_, UniverseRow>("SELECT id, name, description, created_at FROM universes ORDER BY name")
            .fetch_all(&self.db_pool)
            .await?
            .into_iter()
            .map(Universe::try_from)
            .collect()
    }

    pub async fn universe(&self, universe_id: Uuid) -> GameResult<Universe> {
        let mut conn = self.db_pool.acquire().await?;
        fetch_universe(&mut conn, universe_id).await
    }

    pub async fn games(&self, universe_id: Uuid) -> GameResult<Vec<GameInstance>> {
        let mut conn = self.db_pool.acquire().await?;
        fetch_universe(&mut conn, universe_id).await?;
        fetch_games(&mut conn, universe_id).await
    }

    pub async fn news(&self, universe_id: Uuid, order: NewsOrder, limit: Option<i64>) -> GameResult<Vec<NewsItem>> {
        self.universe(universe_id).await?;
        let direction = match order {
            NewsOrder::Newest => "DESC",
            NewsOrder::Oldest => "ASC",
        };
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(&format!(
            "SELECT seq, universe_id, summary, published_at FROM universe_news \
             WHERE universe_id = ? ORDER BY published_at {direction}, seq {direction} LIMIT ?"
        ))
        .bind(universe_id.to_string())
        .bind(clamp_limit(limit))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(id, universe_id, summary, published_at)| -> GameResult<NewsItem> {
                Ok(NewsItem {
                    id,
                    universe_id: Uuid::parse_str(&universe_id)?,
                    summary,
                    published_at: model::from_millis(published_at),
                })
            })
            .collect()
    }

    pub async fn publish_news(&self, universe_id: Uuid, summary: &str) -> GameResult<NewsItem> {
        let summary = summary.trim();
        if summary.is_empty() {
            return Err(GameError::InvalidPayload("news summary is empty".to_owned()));
        }
        self.universe(universe_id).await?;

        let published_at = model::now();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO universe_news (universe_id, summary, published_at) VALUES (?, ?, ?) RETURNING seq",
        )
        .bind(universe_id.to_string())
        .bind(summary)
        .bind(model::to_millis(published_at))
        .fetch_one(&self.db_pool)
        .await?;

        tracing::debug!(%universe_id, news_id = id, "news published");
        Ok(NewsItem { id, universe_id, summary: summary.to_owned(), published_at })
    }

    pub async fn conflicts(&self, universe_id: Uuid, limit: Option<i64>) -> GameResult<Vec<ConflictRecord>> {
        self.universe(universe_id).await?;
        let rows: Vec<(i64, String, String, i64)> = sqlx::query_as(
            "SELECT seq, description, game_ids, detected_at FROM conflicts \
             WHERE universe_id = ? ORDER BY detected_at DESC, seq DESC LIMIT ?",
        )
        .bind(universe_id.to_string())
        .bind(clamp_limit(limit))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(id, description, game_ids, detected_at)| -> GameResult<ConflictRecord> {
                Ok(ConflictRecord {
                    id,
                    universe_id,
                    detected_at: model::from_millis(detected_at),
                    description,
                    game_ids: serde_json::from_str(&game_ids)?,
                })
            })
            .collect()
    }

    /// Every game named must belong to the universe.
    pub async fn record_conflict(
        &self,
        universe_id: Uuid,
        description: &str,
        game_ids: Vec<Uuid>,
    ) -> GameResult<ConflictRecord> {
        let description = description.trim();
        if description.is_empty() {
            return Err(GameError::InvalidPayload("conflict description is empty".to_owned()));
        }
        let known = self.games(universe_id).await?;
        if let Some(stranger) = game_ids.iter().find(|id| !known.iter().any(|game| game.id == **id)) {
            return Err(GameError::InvalidPayload(format!(
                "game {stranger} is not part of universe {universe_id}"
            )));
        }

        let detected_at = model::now();
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO conflicts (universe_id, description, game_ids, detected_at) \
             VALUES (?, ?, ?, ?) RETURNING seq",
        )
        .bind(universe_id.to_string())
        .bind(description)
        .bind(serde_json::to_string(&game_ids)?)
        .bind(model::to_millis(detected_at))
        .fetch_one(&self.db_pool)
        .await?;

        tracing::info!(%universe_id, conflict_id = id, games = game_ids.len(), "conflict recorded");
        Ok(ConflictRecord { id, universe_id, detected_at, description: description.to_owned(), game_ids })
    }

    /// The raw event log in append order.
    pub async fn events(&self, universe_id: Uuid) -> GameResult<Vec<GameEvent>> {
        let mut conn = self.db_pool.acquire().await?;
        fetch_universe(&mut conn, universe_id).await?;
        fetch_events(&mut conn, universe_id).await
    }

    /// Integrity faults degrade to an empty graph carrying the fault.
    /// Games and events come from one read snapshot.
    pub async fn event_graph(&self, universe_id: Uuid) -> GameResult<EventGraph> {
        let mut tx = self.db_pool.begin().await?;
        fetch_universe(&mut tx, universe_id).await?;
        let games = fetch_games(&mut tx, universe_id).await?;
        let built = match fetch_events(&mut tx, universe_id).await {
            Ok(events) => graph::build(&games, &events),
            Err(err) => Err(err),
        };
        tx.commit().await?;

        match built {
            Ok(graph) => Ok(graph),
            Err(GameError::DataIntegrity(fault)) => {
                tracing::error!(%universe_id, %fault, "event graph is inconsistent");
                Ok(EventGraph::faulted(fault))
            }
            Err(err) => Err(err),
        }
    }
}

async fn fetch_universe(conn: &mut SqliteConnection, universe_id: Uuid) -> GameResult<Universe> {
    sqlx::query_as::<_, UniverseRow>("SELECT id, name, description, created_at FROM universes WHERE id = ?")
        .bind(universe_id.to_string())
        .fetch_optional(conn)
        .await?
        .ok_or(GameError::UniverseNotFound(universe_id))?
        .try_into()
}

async fn fetch_games(conn: &mut SqliteConnection, universe_id: Uuid) -> GameResult<Vec<GameInstance>> {
    sqlx::query_as::<_, GameRow>(&format!(
        "SELECT {GAME_COLUMNS} FROM games g WHERE g.universe_id = ? ORDER BY g.created_at, g.rowid"
    ))
    .bind(universe_id.to_string())
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(GameInstance::try_from)
    .collect()
}

async fn fetch_events(conn: &mut SqliteConnection, universe_id: Uuid) -> GameResult<Vec<GameEvent>> {
    sqlx::query_as::<_, EventRow>(
        "SELECT seq, universe_id, game_id, payload, event_time FROM game_events \
         WHERE universe_id = ? ORDER BY seq",
    )
    .bind(universe_id.to_string())
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(GameEvent::try_from)
    .collect()
}
