//! Branch/merge DAG of a universe, projected from its games and event log.

use std::collections::HashMap;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{GameError, GameResult},
    model::{EventKind, GameEvent, GameInstance, GameStatus},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: Uuid,
    pub name: String,
    pub status: GameStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    /// Index into [`EventGraph::times`].
    pub slot: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Branch,
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub from: Uuid,
    pub to: Uuid,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Tick(#[serde(with = "time::serde::rfc3339")] pub OffsetDateTime);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub times: Vec<Tick>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl EventGraph {
    pub fn faulted(description: String) -> Self {
        Self { fault: Some(description), ..Self::default() }
    }
}

/// Single pass over `events` in log order. Every id an event names must be
/// one of `games`.
pub fn build(games: &[GameInstance], events: &[GameEvent]) -> GameResult<EventGraph> {
    let mut nodes: Vec<GraphNode> = games
        .iter()
        .map(|game| GraphNode {
            id: game.id,
            name: game.name.clone(),
            status: game.status,
            time: game.created_at,
            slot: 0,
        })
        .collect();
    let index: HashMap<Uuid, usize> = nodes.iter().enumerate().map(|(i, node)| (node.id, i)).collect();

    let lookup = |event: &GameEvent, id: Uuid| {
        index.get(&id).copied().ok_or_else(|| {
            GameError::DataIntegrity(format!("event {} references unknown game {id}", event.id))
        })
    };

    let mut edges = Vec::new();
    for event in events {
        match &event.kind {
            EventKind::BranchedFrom { original_game_id } => {
                let child = lookup(event, event.game_id)?;
                lookup(event, *original_game_id)?;
                nodes[child].time = event.time;
                edges.push(GraphEdge { from: *original_game_id, to: event.game_id, kind: EdgeKind::Branch });
            }
            EventKind::Merger { from_instance_ids } => {
                let target = lookup(event, event.game_id)?;
                for source in from_instance_ids {
                    lookup(event, *source)?;
                    edges.push(GraphEdge { from: *source, to: event.game_id, kind: EdgeKind::Merge });
                }
                nodes[target].time = event.time;
            }
            EventKind::Other { .. } => {}
        }
    }

    let mut times: Vec<Tick> = nodes.iter().map(|node| Tick(node.time)).collect();
    times.sort();
    times.dedup();
    for node in &mut nodes {
        node.slot = times.binary_search(&Tick(node.time)).unwrap_or_default();
    }

    Ok(EventGraph { nodes, edges, times, fault: None })
}
