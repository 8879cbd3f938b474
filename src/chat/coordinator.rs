//! One task per game owns the session set. Appends and fan-out happen in
//! command order, so every session sees messages in append order.

use std::collections::HashMap;

use sqlx::SqlitePool;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use uuid::Uuid;

use crate::{
    error::{GameError, GameResult},
    ledger::Ledger,
    lifecycle::Lifecycle,
    messages,
    model::{self, GameStatus, Message},
};

use super::{ServerFrame, command::GmCommand};

pub(crate) struct Joiner {
    pub user_id: String,
    /// Sender name for posts; `None` joins read-only.
    pub display: Option<String>,
    pub operator: bool,
}

pub(crate) struct Joined {
    pub session_id: Uuid,
    pub history: Vec<Message>,
    pub frames: mpsc::Receiver<ServerFrame>,
}

pub(crate) enum Command {
    Connect {
        joiner: Joiner,
        reply: oneshot::Sender<GameResult<Joined>>,
    },
    Post {
        session_id: Uuid,
        body: String,
    },
    Leave {
        session_id: Uuid,
    },
    Shutdown {
        status: GameStatus,
    },
}

struct Member {
    user_id: String,
    display: Option<String>,
    operator: bool,
    frames: mpsc::Sender<ServerFrame>,
}

impl Member {
    fn label(&self) -> &str {
        self.display.as_deref().unwrap_or(&self.user_id)
    }
}

pub(crate) struct Coordinator {
    game_id: Uuid,
    db_pool: SqlitePool,
    lifecycle: Lifecycle,
    ledger: Ledger,
    buffer: usize,
    members: HashMap<Uuid, Member>,
    commands: mpsc::Receiver<Command>,
}

impl Coordinator {
    pub(crate) fn new(
        game_id: Uuid,
        db_pool: SqlitePool,
        lifecycle: Lifecycle,
        ledger: Ledger,
        buffer: usize,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            game_id,
            db_pool,
            lifecycle,
            ledger,
            buffer,
            members: HashMap::new(),
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(game_id = %self.game_id, "chat coordinator started");

        while let Some(command) = self.commands.recv().await {
            let ended = match command {
                Command::Connect { joiner, reply } => {
                    let joined = self.connect(joiner).await;
                    if let Err(Ok(joined)) = reply.send(joined) {
                        // the caller gave up waiting
                        self.members.remove(&joined.session_id);
                    }
                    None
                }
                Command::Post { session_id, body } => self.post(session_id, body).await,
                Command::Leave { session_id } => {
                    self.leave(session_id);
                    None
                }
                Command::Shutdown { status } => Some(status),
            };

            if let Some(status) = ended {
                self.close(status);
                break;
            }
            if self.members.is_empty() {
                break;
            }
        }

        tracing::debug!(game_id = %self.game_id, "chat coordinator stopped");
    }

    async fn connect(&mut self, joiner: Joiner) -> GameResult<Joined> {
        let status = self.lifecycle.status(self.game_id).await?;
        if !status.is_open() {
            return Err(GameError::GameNotJoinable { game_id: self.game_id, status });
        }
        let history = messages::history(&self.db_pool, self.game_id).await?;

        let (frames_tx, frames) = mpsc::channel(self.buffer);
        let session_id = Uuid::now_v7();
        let member = Member {
            user_id: joiner.user_id,
            display: joiner.display,
            operator: joiner.operator,
            frames: frames_tx,
        };
        let notice = match &member.display {
            Some(display) => format!("{display} joined"),
            None => format!("{} is watching", member.user_id),
        };
        tracing::info!(game_id = %self.game_id, %session_id, user_id = %member.user_id, "chat session registered");

        self.broadcast(notice_frame(notice));
        self.members.insert(session_id, member);
        Ok(Joined { session_id, history, frames })
    }

    fn leave(&mut self, session_id: Uuid) {
        if let Some(member) = self.members.remove(&session_id) {
            tracing::debug!(game_id = %self.game_id, %session_id, "chat session left");
            self.broadcast(notice_frame(format!("{} left", member.label())));
        }
    }

    /// Returns the terminal status when the game is no longer open.
    async fn post(&mut self, session_id: Uuid, body: String) -> Option<GameStatus> {
        let body = body.trim();
        let Some(member) = self.members.get(&session_id) else {
            return None;
        };
        if body.is_empty() {
            return None;
        }

        if let Some(parsed) = GmCommand::parse(body) {
            if !member.operator {
                tracing::warn!(game_id = %self.game_id, user_id = %member.user_id, "gm command from a non-operator");
                self.reply(session_id, ServerFrame::error("only the game's operators can use /gm"));
                return None;
            }
            return match parsed {
                Ok(command) => self.command(session_id, command).await,
                Err(reason) => {
                    self.reply(session_id, ServerFrame::Error { reason });
                    None
                }
            };
        }

        let sender = match (&member.display, member.operator) {
            (Some(display), _) => display.clone(),
            (None, true) => member.user_id.clone(),
            (None, false) => {
                self.reply(session_id, ServerFrame::error("pick a character to post in this game"));
                return None;
            }
        };
        self.say(&sender, body).await
    }

    async fn command(&mut self, session_id: Uuid, command: GmCommand) -> Option<GameStatus> {
        match command {
            GmCommand::Who => {
                let frame = match self.who().await {
                    Ok(names) if names.is_empty() => notice_frame("Nobody is playing.".to_owned()),
                    Ok(names) => notice_frame(format!("Playing: {}", names.join(", "))),
                    Err(err) => ServerFrame::error(err.to_string()),
                };
                self.reply(session_id, frame);
                None
            }
            GmCommand::Narrate(text) => self.say(messages::GM, &text).await,
            command => {
                let (target, payload) = command.transition()?;
                let user_id = self.members.get(&session_id)?.user_id.clone();
                match self.lifecycle.transition_as(&user_id, self.game_id, target, payload).await {
                    Ok(_) if target.is_open() => {
                        self.broadcast(notice_frame(format!("The game is now {target}.")));
                        None
                    }
                    Ok(_) => Some(target),
                    Err(err) => {
                        self.reply(session_id, ServerFrame::error(err.to_string()));
                        None
                    }
                }
            }
        }
    }

    async fn who(&self) -> GameResult<Vec<String>> {
        let mut names = Vec::new();
        for binding in self.ledger.participants(self.game_id).await? {
            if let Some(character) = self.ledger.character(binding.character_id).await? {
                names.push(format!("{} ({})", character.name, character.owner));
            }
        }
        Ok(names)
    }

    async fn say(&mut self, sender: &str, body: &str) -> Option<GameStatus> {
        match messages::append(&self.db_pool, self.game_id, sender, body).await {
            Ok(Some(message)) => {
                self.broadcast(ServerFrame::Message(message));
                None
            }
            Ok(None) => match self.lifecycle.status(self.game_id).await {
                Ok(status) => Some(status),
                Err(err) => {
                    tracing::error!(game_id = %self.game_id, error = %err, "game vanished under its chat");
                    Some(GameStatus::Closed)
                }
            },
            Err(err) => {
                tracing::error!(game_id = %self.game_id, error = %err, "failed to append message");
                self.broadcast(ServerFrame::error("message could not be stored"));
                None
            }
        }
    }

    /// Deliver to every session; sessions that cannot keep up are dropped.
    fn broadcast(&mut self, frame: ServerFrame) {
        let game_id = self.game_id;
        self.members.retain(|session_id, member| match member.frames.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(%game_id, %session_id, "dropping slow chat session");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    fn reply(&mut self, session_id: Uuid, frame: ServerFrame) {
        let Some(member) = self.members.get(&session_id) else {
            return;
        };
        if member.frames.try_send(frame).is_err() {
            self.members.remove(&session_id);
        }
    }

    fn close(&mut self, status: GameStatus) {
        tracing::info!(game_id = %self.game_id, %status, sessions = self.members.len(), "closing game chat");
        self.broadcast(ServerFrame::Closed { status });
        self.members.clear();
    }
}

fn notice_frame(body: String) -> ServerFrame {
    ServerFrame::Notice { body, timestamp: model::now() }
}
