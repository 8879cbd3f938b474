use axum::{
    Json, debug_handler,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message as WsMessage, WebSocket, close_code},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{AppResult, AppState, error::GameError, session::Caller};

use super::{ChatHub, ChatSession, ServerFrame};

#[derive(Deserialize)]
pub(crate) struct WsQuery {
    character_id: Option<Uuid>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn game_ws(
    Path(game_id): Path<Uuid>,
    State(chat): State<ChatHub>,
    Caller(user_id): Caller,
    Query(WsQuery { character_id }): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let session = match chat.connect(game_id, &user_id, character_id).await {
        Err(GameError::GameNotJoinable { status, .. }) => {
            tracing::info!(%game_id, %status, "chat refused, game is over");
            let body = json!({ "error": "game_closed", "status": status });
            return Ok((StatusCode::GONE, Json(body)).into_response());
        }
        other => other?,
    };

    Ok(ws.on_upgrade(async move |stream| pump(stream, session).await))
}

fn encode(frame: &ServerFrame) -> Option<WsMessage> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(WsMessage::Text(text.into())),
        Err(err) => {
            tracing::error!(error = %err, "unencodable chat frame");
            None
        }
    }
}

async fn pump(stream: WebSocket, session: ChatSession) {
    let ChatSession { id, history, mut frames, handle, .. } = session;
    let (mut sender, mut receiver) = stream.split();

    let mut send_task = tokio::spawn(async move {
        let snapshot = ServerFrame::History { messages: history };
        if let Some(msg) = encode(&snapshot) {
            if sender.send(msg).await.is_err() {
                return;
            }
        }

        while let Some(frame) = frames.recv().await {
            let closing = matches!(frame, ServerFrame::Closed { .. });
            if let Some(msg) = encode(&frame) {
                if sender.send(msg).await.is_err() {
                    return;
                }
            }
            if closing {
                break;
            }
        }

        let close = CloseFrame { code: close_code::NORMAL, reason: "game chat closed".into() };
        let _ = sender.send(WsMessage::Close(Some(close))).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                WsMessage::Text(text) => handle.post(text.as_str()).await,
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    };
    tracing::debug!(session_id = %id, "chat socket finished");
}
