use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use sqlx::SqlitePool;
use tokio::{
    runtime::Handle,
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
};
use uuid::Uuid;

use crate::{
    error::{GameError, GameResult},
    ledger::Ledger,
    lifecycle::{Lifecycle, StatusChange},
    model::{GameStatus, Message},
};

use super::{
    ServerFrame,
    coordinator::{Command, Coordinator, Joined, Joiner},
};

const COMMAND_BUFFER: usize = 64;

/// Routes sessions to the per-game coordinators, starting them on demand.
#[derive(Clone)]
pub struct ChatHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    db_pool: SqlitePool,
    lifecycle: Lifecycle,
    ledger: Ledger,
    buffer: usize,
    rooms: Mutex<HashMap<Uuid, mpsc::Sender<Command>>>,
}

/// A registered chat session. Dropping it deregisters the session.
pub struct ChatSession {
    pub id: Uuid,
    pub game_id: Uuid,
    pub history: Vec<Message>,
    pub frames: mpsc::Receiver<ServerFrame>,
    pub handle: SessionHandle,
}

pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn post(&self, body: impl Into<String>) {
        let post = Command::Post { session_id: self.id, body: body.into() };
        if self.commands.send(post).await.is_err() {
            tracing::debug!(session_id = %self.id, "post after the game chat stopped");
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let leave = Command::Leave { session_id: self.id };
        if let Err(TrySendError::Full(leave)) = self.commands.try_send(leave) {
            // full queue: deliver once the coordinator catches up
            let commands = self.commands.clone();
            if let Ok(runtime) = Handle::try_current() {
                runtime.spawn(async move {
                    let _ = commands.send(leave).await;
                });
            }
        }
    }
}

impl ChatSession {
    pub async fn post(&self, body: impl Into<String>) {
        self.handle.post(body).await
    }
}

impl ChatHub {
    pub fn new(db_pool: SqlitePool, lifecycle: Lifecycle, ledger: Ledger, buffer: usize) -> Self {
        let changes = lifecycle.subscribe();
        let inner = Arc::new(HubInner {
            db_pool,
            lifecycle,
            ledger,
            buffer: buffer.max(1),
            rooms: Mutex::new(HashMap::new()),
        });
        tokio::spawn(follow_status(Arc::downgrade(&inner), changes));
        Self { inner }
    }

    /// Register a session on an open game. With a character, the character
    /// must belong to `user_id` and be bound to the game.
    pub async fn connect(
        &self,
        game_id: Uuid,
        user_id: &str,
        character_id: Option<Uuid>,
    ) -> GameResult<ChatSession> {
        let inner = &self.inner;
        let status = inner.lifecycle.status(game_id).await?;
        if !status.is_open() {
            return Err(GameError::GameNotJoinable { game_id, status });
        }

        let display = match character_id {
            Some(character_id) => {
                let character = inner.ledger.owned_character(character_id, user_id).await?;
                match inner.ledger.active_binding(character_id).await? {
                    Some(binding) if binding.game_id == game_id => {}
                    _ => return Err(GameError::NotBound { character_id, game_id }),
                }
                Some(format!("{} ({user_id})", character.name))
            }
            None => None,
        };
        let operator = inner.lifecycle.is_operator(game_id, user_id).await?;

        // a coordinator that went idle may exit with our connect still queued
        for _ in 0..2 {
            let commands = self.coordinator(game_id);
            let (reply, joined) = oneshot::channel();
            let connect = Command::Connect {
                joiner: Joiner {
                    user_id: user_id.to_owned(),
                    display: display.clone(),
                    operator,
                },
                reply,
            };
            if commands.send(connect).await.is_err() {
                self.forget(game_id, &commands);
                continue;
            }

            match joined.await {
                Ok(joined) => {
                    let Joined { session_id, history, frames } = joined?;
                    return Ok(ChatSession {
                        id: session_id,
                        game_id,
                        history,
                        frames,
                        handle: SessionHandle { id: session_id, commands },
                    });
                }
                Err(_) => self.forget(game_id, &commands),
            }
        }

        Err(GameError::DataIntegrity(format!("chat for game {game_id} keeps stopping")))
    }

    /// Number of games with a running coordinator.
    pub fn live_games(&self) -> usize {
        self.rooms().values().filter(|commands| !commands.is_closed()).count()
    }

    fn rooms(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, mpsc::Sender<Command>>> {
        self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn coordinator(&self, game_id: Uuid) -> mpsc::Sender<Command> {
        let mut rooms = self.rooms();
        // coordinators that went idle leave their closed senders behind
        rooms.retain(|_, commands| !commands.is_closed());
        if let Some(commands) = rooms.get(&game_id) {
            return commands.clone();
        }

        let inner = &self.inner;
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let coordinator = Coordinator::new(
            game_id,
            inner.db_pool.clone(),
            inner.lifecycle.clone(),
            inner.ledger.clone(),
            inner.buffer,
            receiver,
        );
        tokio::spawn(coordinator.run());
        rooms.insert(game_id, commands.clone());
        commands
    }

    fn forget(&self, game_id: Uuid, stale: &mpsc::Sender<Command>) {
        let mut rooms = self.rooms();
        if rooms.get(&game_id).is_some_and(|current| current.same_channel(stale)) {
            rooms.remove(&game_id);
        }
    }
}

async fn follow_status(hub: Weak<HubInner>, mut changes: broadcast::Receiver<StatusChange>) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "chat hub lagged behind status changes");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(hub) = hub.upgrade() else {
            break;
        };
        if !change.status.is_open() {
            shutdown(&hub, change.game_id, change.status).await;
        }
    }
}

async fn shutdown(hub: &HubInner, game_id: Uuid, status: GameStatus) {
    let commands = hub
        .rooms
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&game_id);
    if let Some(commands) = commands {
        let _ = commands.send(Command::Shutdown { status }).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        lifecycle::TransitionPayload,
        messages,
        testing::{self, OPERATOR, Scratch},
    };

    fn hub(env: &Scratch) -> ChatHub {
        ChatHub::new(env.db_pool.clone(), env.lifecycle.clone(), env.ledger.clone(), 16)
    }

    async fn next_frame(session: &mut ChatSession) -> Option<ServerFrame> {
        timeout(Duration::from_secs(5), session.frames.recv())
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next frame that is not a presence notice.
    async fn next_event(session: &mut ChatSession) -> Option<ServerFrame> {
        loop {
            match next_frame(session).await {
                Some(ServerFrame::Notice { body, .. }) if body.ends_with("joined") || body.ends_with("watching") => {}
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn every_session_sees_the_same_message() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, game) = env.game_with_founder("alice", "Aria").await;
        let bram = env.ledger.create_character("bob", "Bram", json!({})).await.unwrap();
        env.lifecycle.join(game.id, bram.id).await.unwrap();

        let mut alice = chat.connect(game.id, "alice", Some(aria.id)).await.unwrap();
        let mut bob = chat.connect(game.id, "bob", Some(bram.id)).await.unwrap();
        assert!(bob.history.is_empty());

        alice.post("  Hello there  ").await;
        let seen_by_alice = next_event(&mut alice).await.unwrap();
        let seen_by_bob = next_event(&mut bob).await.unwrap();
        assert_eq!(seen_by_alice, seen_by_bob);
        let ServerFrame::Message(message) = seen_by_bob else { panic!("expected a message frame") };
        assert_eq!(message.sender, "Aria (alice)");
        assert_eq!(message.body, "Hello there");
        assert_eq!(chat.live_games(), 1);

        let stored = messages::history(&env.db_pool, game.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, message.id);
        assert_eq!(stored[0].timestamp, message.timestamp);
    }

    #[tokio::test]
    async fn history_arrives_on_connect() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, game) = env.game_with_founder("alice", "Aria").await;
        messages::append(&env.db_pool, game.id, messages::GM, "Once upon a time").await.unwrap();

        let session = chat.connect(game.id, "alice", Some(aria.id)).await.unwrap();
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.history[0].body, "Once upon a time");
    }

    #[tokio::test]
    async fn gm_commands_need_an_operator() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (_, game) = env.game_with_founder("alice", "Aria").await;
        let bram = env.ledger.create_character("bob", "Bram", json!({})).await.unwrap();
        env.lifecycle.join(game.id, bram.id).await.unwrap();

        let mut bob = chat.connect(game.id, "bob", Some(bram.id)).await.unwrap();
        bob.post("/gm close").await;
        assert!(matches!(next_event(&mut bob).await, Some(ServerFrame::Error { .. })));
        assert_eq!(env.lifecycle.status(game.id).await.unwrap(), GameStatus::Waiting);
    }

    #[tokio::test]
    async fn gm_merge_needs_every_consumed_game() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, hers) = env.game_with_founder("alice", "Aria").await;
        let (_, his) = env.game_with_founder("bob", "Bram").await;

        let mut alice = chat.connect(hers.id, "alice", Some(aria.id)).await.unwrap();
        alice.post(format!(r#"/gm merge {{"with": ["{}"]}}"#, his.id)).await;
        match next_event(&mut alice).await {
            Some(ServerFrame::Error { reason }) => assert!(reason.contains(&his.id.to_string()), "{reason}"),
            other => panic!("expected an error frame, got {other:?}"),
        }
        assert_eq!(env.lifecycle.status(hers.id).await.unwrap(), GameStatus::Waiting);
        assert_eq!(env.lifecycle.status(his.id).await.unwrap(), GameStatus::Waiting);
    }

    #[tokio::test]
    async fn spectators_read_but_do_not_post() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (_, game) = env.game_with_founder("alice", "Aria").await;

        let mut carol = chat.connect(game.id, "carol", None).await.unwrap();
        carol.post("can I play?").await;
        assert!(matches!(next_event(&mut carol).await, Some(ServerFrame::Error { .. })));
        assert!(messages::history(&env.db_pool, game.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_or_unbound_characters_are_refused() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, game) = env.game_with_founder("alice", "Aria").await;
        let idle = env.ledger.create_character("bob", "Bram", json!({})).await.unwrap();

        assert!(matches!(
            chat.connect(game.id, "bob", Some(aria.id)).await,
            Err(GameError::Forbidden(_))
        ));
        assert!(matches!(
            chat.connect(game.id, "bob", Some(idle.id)).await,
            Err(GameError::NotBound { .. })
        ));
    }

    #[tokio::test]
    async fn operator_close_ends_every_session() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, game) = env.game_with_founder("alice", "Aria").await;
        env.lifecycle.transition(game.id, GameStatus::Active, TransitionPayload::None).await.unwrap();

        let mut alice = chat.connect(game.id, "alice", Some(aria.id)).await.unwrap();
        let mut op = chat.connect(game.id, OPERATOR, None).await.unwrap();

        op.post("/gm The storm breaks.").await;
        let Some(ServerFrame::Message(narration)) = next_event(&mut alice).await else {
            panic!("expected narration")
        };
        assert_eq!(narration.sender, messages::GM);

        op.post("/gm close").await;
        for session in [&mut alice, &mut op] {
            loop {
                match next_frame(session).await {
                    Some(ServerFrame::Closed { status }) => {
                        assert_eq!(status, GameStatus::Closed);
                        break;
                    }
                    Some(_) => {}
                    None => panic!("session ended without a closed frame"),
                }
            }
            assert!(next_frame(session).await.is_none());
        }

        match chat.connect(game.id, "alice", None).await {
            Err(GameError::GameNotJoinable { status, .. }) => assert_eq!(status, GameStatus::Closed),
            other => panic!("expected a closed game, got {:?}", other.map(|s| s.id)),
        }
        assert!(env.ledger.active_binding(aria.id).await.unwrap().is_none());
        let history = messages::history(&env.db_pool, game.id).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn transitions_elsewhere_shut_the_chat_down() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, game) = env.game_with_founder("alice", "Aria").await;
        let mut alice = chat.connect(game.id, "alice", Some(aria.id)).await.unwrap();

        env.lifecycle
            .transition(
                game.id,
                GameStatus::Branched,
                TransitionPayload::Branch {
                    branches: vec![crate::lifecycle::BranchSpec { name: None, character_ids: vec![aria.id] }],
                },
            )
            .await
            .unwrap();

        loop {
            match next_frame(&mut alice).await {
                Some(ServerFrame::Closed { status }) => {
                    assert_eq!(status, GameStatus::Branched);
                    break;
                }
                Some(_) => {}
                None => panic!("session ended without a closed frame"),
            }
        }
    }

    #[tokio::test]
    async fn idle_rooms_are_pruned() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, first) = env.game_with_founder("alice", "Aria").await;
        let (bram, second) = env.game_with_founder("bob", "Bram").await;

        drop(chat.connect(first.id, "alice", Some(aria.id)).await.unwrap());
        timeout(Duration::from_secs(5), async {
            while chat.live_games() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("coordinator never stopped");
        assert_eq!(chat.rooms().len(), 1);

        let _bob = chat.connect(second.id, "bob", Some(bram.id)).await.unwrap();
        let rooms = chat.rooms();
        assert_eq!(rooms.len(), 1);
        assert!(rooms.contains_key(&second.id));
    }

    #[tokio::test]
    async fn leave_waits_for_a_full_command_queue() {
        let (commands, mut queue) = mpsc::channel(1);
        let busy = Uuid::now_v7();
        assert!(commands.try_send(Command::Leave { session_id: busy }).is_ok());

        let id = Uuid::now_v7();
        drop(SessionHandle { id, commands });

        assert!(matches!(queue.recv().await, Some(Command::Leave { session_id }) if session_id == busy));
        let next = timeout(Duration::from_secs(5), queue.recv()).await.expect("leave was lost");
        assert!(matches!(next, Some(Command::Leave { session_id }) if session_id == id));
    }

    #[tokio::test]
    async fn dropped_sessions_leave_and_idle_chats_stop() {
        let env = testing::scratch().await;
        let chat = hub(&env);
        let (aria, game) = env.game_with_founder("alice", "Aria").await;

        let session = chat.connect(game.id, "alice", Some(aria.id)).await.unwrap();
        drop(session);

        timeout(Duration::from_secs(5), async {
            while chat.live_games() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("coordinator never stopped");

        let again = chat.connect(game.id, "alice", Some(aria.id)).await.unwrap();
        assert_eq!(again.game_id, game.id);
    }
}
