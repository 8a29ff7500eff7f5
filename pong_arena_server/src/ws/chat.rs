//! Chat socket ingress: `GET /ws/chat`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::StreamExt;

use shared::{close, ChatClientMessage, ChatServerMessage, ErrorCode};

use super::pong::socket_token;
use super::{conn_channel, outbound_pump, reject, TokenQuery};
use crate::chat::HubCmd;
use crate::state::AppState;
use crate::util::now_ms;

pub async fn handle_chat_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let token = socket_token(&headers, &query);
    ws.on_upgrade(move |socket| chat_session(state, socket, token))
}

async fn chat_session(state: AppState, socket: WebSocket, token: Option<String>) {
    let auth = match token {
        Some(token) => match state.gate.verify(&token).await {
            Ok(auth) => auth,
            Err(_) => return reject(socket, close::UNAUTHORIZED, "invalid token").await,
        },
        None => return reject(socket, close::UNAUTHORIZED, "missing token").await,
    };

    let (sink, mut stream) = socket.split();
    let (conn, frames_rx, kill_rx) = conn_channel();
    let pump = tokio::spawn(outbound_pump(sink, frames_rx, kill_rx));

    state
        .hub
        .send(HubCmd::Connect {
            user_id: auth.user_id,
            conn: conn.clone(),
        })
        .await;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ChatClientMessage>(&text) {
                Ok(ChatClientMessage::Ping { .. }) => {
                    conn.send_msg(&ChatServerMessage::Pong { ts: now_ms() });
                }
                Ok(parsed) => {
                    state
                        .hub
                        .send(HubCmd::Client {
                            user_id: auth.user_id,
                            conn_id: conn.id(),
                            msg: parsed,
                        })
                        .await;
                }
                Err(_) => {
                    conn.send_msg(&ChatServerMessage::Error {
                        error: ErrorCode::InvalidInput,
                        message: "malformed message".into(),
                    });
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state
        .hub
        .send(HubCmd::Disconnect {
            user_id: auth.user_id,
            conn_id: conn.id(),
        })
        .await;
    conn.close(close::NORMAL);
    let _ = pump.await;
}
