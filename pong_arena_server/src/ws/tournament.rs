//! Tournament subscription socket: `GET /ws/tournament`.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::StreamExt;
use uuid::Uuid;

use shared::{close, ErrorCode, TournamentClientMessage, TournamentServerMessage};

use super::pong::socket_token;
use super::{conn_channel, outbound_pump, reject, TokenQuery};
use crate::state::AppState;
use crate::tournament::CoordinatorHandle;
use crate::util::now_ms;

pub async fn handle_tournament_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let token = socket_token(&headers, &query);
    ws.on_upgrade(move |socket| tournament_session(state, socket, token))
}

async fn tournament_session(state: AppState, socket: WebSocket, token: Option<String>) {
    if let Some(token) = token {
        if state.gate.verify(&token).await.is_err() {
            return reject(socket, close::UNAUTHORIZED, "invalid token").await;
        }
    } else {
        return reject(socket, close::UNAUTHORIZED, "missing token").await;
    }

    let (sink, mut stream) = socket.split();
    let (conn, frames_rx, kill_rx) = conn_channel();
    let pump = tokio::spawn(outbound_pump(sink, frames_rx, kill_rx));

    // tournaments this socket is subscribed to
    let mut subscriptions: HashMap<Uuid, CoordinatorHandle> = HashMap::new();

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                match serde_json::from_str::<TournamentClientMessage>(&text) {
                    Ok(TournamentClientMessage::Subscribe { tournament_id }) => {
                        match state.tournaments.handle(tournament_id).await {
                            Ok(handle) => {
                                handle.subscribe(conn.clone()).await;
                                subscriptions.insert(tournament_id, handle);
                            }
                            Err(err) => {
                                conn.send_msg(&TournamentServerMessage::Error {
                                    error: err.code(),
                                    message: err.to_string(),
                                });
                            }
                        }
                    }
                    Ok(TournamentClientMessage::Unsubscribe { tournament_id }) => {
                        if let Some(handle) = subscriptions.remove(&tournament_id) {
                            handle.unsubscribe(conn.id()).await;
                        }
                    }
                    Ok(TournamentClientMessage::Ping { .. }) => {
                        conn.send_msg(&TournamentServerMessage::Pong { ts: now_ms() });
                    }
                    Err(_) => {
                        conn.send_msg(&TournamentServerMessage::Error {
                            error: ErrorCode::InvalidInput,
                            message: "malformed message".into(),
                        });
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    for handle in subscriptions.values() {
        handle.unsubscribe(conn.id()).await;
    }
    conn.close(close::NORMAL);
    let _ = pump.await;
}
