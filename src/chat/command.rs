use serde::Deserialize;
use uuid::Uuid;

use crate::lifecycle::{BranchSpec, TransitionPayload};
use crate::model::GameStatus;

const PREFIX: &str = "/gm";

#[derive(Debug, Clone, PartialEq)]
pub enum GmCommand {
    Activate,
    Close,
    Branch(Vec<BranchSpec>),
    Merge { with: Vec<Uuid>, name: Option<String> },
    Who,
    Narrate(String),
}

#[derive(Deserialize)]
struct MergeSpec {
    with: Vec<Uuid>,
    #[serde(default)]
    name: Option<String>,
}

impl GmCommand {
    /// `None` when the body is ordinary chat.
    pub fn parse(body: &str) -> Option<Result<GmCommand, String>> {
        let rest = body.strip_prefix(PREFIX)?;
        if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
            return None;
        }
        let rest = rest.trim();

        let (word, arg) = match rest.split_once(char::is_whitespace) {
            Some((word, arg)) => (word, arg.trim()),
            None => (rest, ""),
        };

        Some(match word {
            "" => Err("empty /gm command".to_owned()),
            "activate" => Ok(GmCommand::Activate),
            "close" => Ok(GmCommand::Close),
            "who" => Ok(GmCommand::Who),
            "branch" => serde_json::from_str::<Vec<BranchSpec>>(arg)
                .map(GmCommand::Branch)
                .map_err(|err| format!("bad branch list: {err}")),
            "merge" => serde_json::from_str::<MergeSpec>(arg)
                .map(|MergeSpec { with, name }| GmCommand::Merge { with, name })
                .map_err(|err| format!("bad merge spec: {err}")),
            _ => Ok(GmCommand::Narrate(rest.to_owned())),
        })
    }

    /// The lifecycle transition this command drives, if any.
    pub fn transition(self) -> Option<(GameStatus, TransitionPayload)> {
        Some(match self {
            GmCommand::Activate => (GameStatus::Active, TransitionPayload::None),
            GmCommand::Close => (GameStatus::Closed, TransitionPayload::None),
            GmCommand::Branch(branches) => (GameStatus::Branched, TransitionPayload::Branch { branches }),
            GmCommand::Merge { with, name } => (GameStatus::Merged, TransitionPayload::Merge { with, name }),
            GmCommand::Who | GmCommand::Narrate(_) => return None,
        })
    }
}
