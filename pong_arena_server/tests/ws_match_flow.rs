//! End-to-end socket flows: invite -> match -> play -> forfeit.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use pong_arena_server::{state, AppState, Config};
use shared::{ChatClientMessage, ChatServerMessage, PongClientMessage, PongServerMessage};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (AppState, SocketAddr) {
    let state = AppState::new(Config::for_tests());
    let app = state::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, addr)
}

async fn connect_ws(addr: SocketAddr, path: &str, token: &str) -> WsClient {
    let url = format!("ws://{addr}{path}?token={token}");
    let (socket, _) = connect_async(url).await.expect("websocket upgrade");
    socket
}

async fn next_text(socket: &mut WsClient) -> String {
    loop {
        let msg = timeout(Duration::from_secs(15), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn next_chat(socket: &mut WsClient) -> ChatServerMessage {
    serde_json::from_str(&next_text(socket).await).expect("valid chat frame")
}

async fn next_pong(socket: &mut WsClient) -> PongServerMessage {
    serde_json::from_str(&next_text(socket).await).expect("valid pong frame")
}

async fn wait_chat<F>(socket: &mut WsClient, mut pred: F) -> ChatServerMessage
where
    F: FnMut(&ChatServerMessage) -> bool,
{
    loop {
        let msg = next_chat(socket).await;
        if pred(&msg) {
            return msg;
        }
    }
}

async fn wait_pong<F>(socket: &mut WsClient, mut pred: F) -> PongServerMessage
where
    F: FnMut(&PongServerMessage) -> bool,
{
    loop {
        let msg = next_pong(socket).await;
        if pred(&msg) {
            return msg;
        }
    }
}

async fn send_chat(socket: &mut WsClient, msg: &ChatClientMessage) {
    let text = serde_json::to_string(msg).unwrap();
    socket.send(Message::Text(text)).await.unwrap();
}

async fn send_pong(socket: &mut WsClient, msg: &PongClientMessage) {
    let text = serde_json::to_string(msg).unwrap();
    socket.send(Message::Text(text)).await.unwrap();
}

#[tokio::test]
async fn invite_to_match_to_forfeit() {
    let (state, addr) = start_server().await;

    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let alice_token = state.gate.issue(alice).await;
    let bob_token = state.gate.issue(bob).await;

    // --- invite over chat ---------------------------------------------
    let mut alice_chat = connect_ws(addr, "/ws/chat", &alice_token).await;
    let mut bob_chat = connect_ws(addr, "/ws/chat", &bob_token).await;
    assert!(matches!(
        next_chat(&mut alice_chat).await,
        ChatServerMessage::Welcome { .. }
    ));
    assert!(matches!(
        next_chat(&mut bob_chat).await,
        ChatServerMessage::Welcome { .. }
    ));

    send_chat(&mut bob_chat, &ChatClientMessage::MatchInvite { to: alice }).await;
    let invite_id = match wait_chat(&mut alice_chat, |m| {
        matches!(m, ChatServerMessage::MatchInvite { .. })
    })
    .await
    {
        ChatServerMessage::MatchInvite { invite_id, from, .. } => {
            assert_eq!(from, bob);
            invite_id
        }
        _ => unreachable!(),
    };

    send_chat(
        &mut alice_chat,
        &ChatClientMessage::MatchInviteResponse {
            invite_id,
            accepted: true,
        },
    )
    .await;

    let match_id = match wait_chat(&mut alice_chat, |m| {
        matches!(m, ChatServerMessage::MatchInviteConfirmed { .. })
    })
    .await
    {
        ChatServerMessage::MatchInviteConfirmed { match_id, .. } => match_id,
        _ => unreachable!(),
    };
    match wait_chat(&mut bob_chat, |m| {
        matches!(m, ChatServerMessage::MatchInviteAccepted { .. })
    })
    .await
    {
        ChatServerMessage::MatchInviteAccepted { match_id: m, .. } => assert_eq!(m, match_id),
        _ => unreachable!(),
    }

    // --- play ----------------------------------------------------------
    let path = format!("/ws/pong/{match_id}");
    let mut alice_game = connect_ws(addr, &path, &alice_token).await;
    let mut bob_game = connect_ws(addr, &path, &bob_token).await;

    for socket in [&mut alice_game, &mut bob_game] {
        match next_pong(socket).await {
            PongServerMessage::ConnectionOk {
                match_id: m,
                user_id,
            } => {
                assert_eq!(m, match_id);
                assert!(user_id == alice || user_id == bob);
            }
            other => panic!("expected connection_ok, got {other:?}"),
        }
        assert!(matches!(
            wait_pong(socket, |m| matches!(m, PongServerMessage::Joined { .. })).await,
            PongServerMessage::Joined { .. }
        ));
    }

    send_pong(&mut alice_game, &PongClientMessage::Ready).await;
    send_pong(&mut bob_game, &PongClientMessage::Ready).await;

    for expected in [3u8, 2, 1] {
        match wait_pong(&mut bob_game, |m| {
            matches!(m, PongServerMessage::Countdown { .. })
        })
        .await
        {
            PongServerMessage::Countdown { seconds } => assert_eq!(seconds, expected),
            _ => unreachable!(),
        }
    }

    // authoritative state flows at ~60 Hz with normalized coordinates
    let mut states = 0;
    while states < 5 {
        if let PongServerMessage::State(view) = wait_pong(&mut bob_game, |m| {
            matches!(m, PongServerMessage::State(_))
        })
        .await
        {
            assert!((0.0..=1.0).contains(&view.ball.x));
            assert!((0.0..=1.0).contains(&view.ball.y));
            states += 1;
        }
    }

    // --- forfeit -------------------------------------------------------
    alice_game.close(None).await.unwrap();

    match wait_pong(&mut bob_game, |m| {
        matches!(m, PongServerMessage::GameOver { .. })
    })
    .await
    {
        PongServerMessage::GameOver {
            winner_id, reason, ..
        } => {
            assert_eq!(winner_id, bob);
            assert_eq!(reason, shared::GameOverReason::Forfeit);
        }
        _ => unreachable!(),
    }

    let row = state.store.matches.get(match_id).await.unwrap();
    assert_eq!(row.state, pong_arena_server::store::MatchState::Forfeited);
    assert_eq!(row.winner_id, Some(bob));

    // stats aggregation ran for both participants
    let bob_stats = state.store.stats.get(bob).await;
    assert_eq!((bob_stats.wins, bob_stats.losses), (1, 0));
    assert_eq!(bob_stats.streak, 1);
    let alice_stats = state.store.stats.get(alice).await;
    assert_eq!((alice_stats.wins, alice_stats.losses), (0, 1));
    assert_eq!(alice_stats.streak, 0);
}

#[tokio::test]
async fn bad_token_closes_with_4401() {
    let (_state, addr) = start_server().await;
    let url = format!("ws://{addr}/ws/chat?token=not-a-token");
    let (mut socket, _) = connect_async(url).await.unwrap();

    let msg = timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Library(4401));
        }
        other => panic!("expected close 4401, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_match_closes_with_4404() {
    let (state, addr) = start_server().await;
    let token = state.gate.issue(Uuid::new_v4()).await;
    let path = format!("/ws/pong/{}", Uuid::new_v4());
    let mut socket = connect_ws(addr, &path, &token).await;

    let msg = timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Library(4404));
        }
        other => panic!("expected close 4404, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_payload_gets_inline_error_and_connection_survives() {
    let (state, addr) = start_server().await;
    let user = Uuid::new_v4();
    let token = state.gate.issue(user).await;

    let mut chat = connect_ws(addr, "/ws/chat", &token).await;
    assert!(matches!(
        next_chat(&mut chat).await,
        ChatServerMessage::Welcome { .. }
    ));

    chat.send(Message::Text("{\"type\":\"no-such-type\"}".into()))
        .await
        .unwrap();
    match next_chat(&mut chat).await {
        ChatServerMessage::Error { error, .. } => {
            assert_eq!(error, shared::ErrorCode::InvalidInput)
        }
        other => panic!("expected inline error, got {other:?}"),
    }

    // the connection stays open and usable
    send_chat(&mut chat, &ChatClientMessage::Ping { ts: None }).await;
    assert!(matches!(
        next_chat(&mut chat).await,
        ChatServerMessage::Pong { .. }
    ));
}
