//! Match socket ingress: `GET /ws/pong/:matchId`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::StreamExt;
use uuid::Uuid;

use shared::{close, ErrorCode, PongClientMessage, PongServerMessage};

use super::{conn_channel, outbound_pump, reject, TokenQuery};
use crate::auth::strip_bearer;
use crate::game::MatchCmd;
use crate::state::AppState;
use crate::util::now_ms;

/// Token from `Authorization: Bearer` or, for browsers, `?token=`.
pub fn socket_token(headers: &HeaderMap, query: &TokenQuery) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(strip_bearer)
        .map(str::to_string)
        .or_else(|| query.token.clone())
}

pub async fn handle_pong_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let token = socket_token(&headers, &query);
    ws.on_upgrade(move |socket| pong_session(state, socket, match_id, token))
}

async fn pong_session(
    state: AppState,
    socket: WebSocket,
    match_id: Uuid,
    token: Option<String>,
) {
    let auth = match token {
        Some(token) => match state.gate.verify(&token).await {
            Ok(auth) => auth,
            Err(_) => return reject(socket, close::UNAUTHORIZED, "invalid token").await,
        },
        None => return reject(socket, close::UNAUTHORIZED, "missing token").await,
    };
    let record = match state.store.matches.get(match_id).await {
        Some(record) => record,
        None => return reject(socket, close::NOT_FOUND, "unknown match").await,
    };
    if !record.is_participant(auth.user_id) {
        tracing::warn!(match_id = %match_id, user_id = %auth.user_id, "non-participant rejected");
        return reject(socket, close::UNAUTHORIZED, "not a participant").await;
    }

    let (sink, mut stream) = socket.split();
    let (conn, frames_rx, kill_rx) = conn_channel();
    let pump = tokio::spawn(outbound_pump(sink, frames_rx, kill_rx));

    conn.send_msg(&PongServerMessage::ConnectionOk {
        user_id: auth.user_id,
        match_id,
    });

    let runtime = state
        .registry
        .get_or_create(&record, &state.runtime_deps())
        .await;
    runtime
        .send(MatchCmd::Connect {
            user_id: auth.user_id,
            conn: conn.clone(),
        })
        .await;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<PongClientMessage>(&text) {
                Ok(PongClientMessage::Ping { .. }) => {
                    conn.send_msg(&PongServerMessage::Pong {
                        timestamp: now_ms(),
                    });
                }
                Ok(parsed) => {
                    runtime
                        .send(MatchCmd::Message {
                            user_id: auth.user_id,
                            msg: parsed,
                        })
                        .await;
                }
                Err(_) => {
                    conn.send_msg(&PongServerMessage::Error {
                        code: ErrorCode::InvalidInput,
                        message: "malformed message".into(),
                    });
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    runtime
        .send(MatchCmd::Disconnect {
            user_id: auth.user_id,
            conn_id: conn.id(),
        })
        .await;
    conn.close(close::NORMAL);
    let _ = pump.await;
}
