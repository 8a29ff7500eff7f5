//! Shared WebSocket plumbing for the three socket endpoints.

pub mod chat;
pub mod pong;
pub mod tournament;

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use shared::{close, IDLE_PING_SECS};

/// Capacity of a per-connection send queue. A consumer that falls this far
/// behind a 60 Hz broadcast is closed with 1009 instead of stalling the
/// producer.
const SEND_QUEUE_CAPACITY: usize = 128;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Query parameters accepted on socket upgrades. Browsers cannot set headers
/// on WebSocket requests, so the token may ride in the query string.
#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// Serialize a protocol message to a wire frame.
pub fn frame<T: Serialize>(msg: &T) -> Option<String> {
    serde_json::to_string(msg).ok()
}

/// Send half of a connection, cheap to clone into any broadcasting task.
///
/// `send` never blocks: a full queue kills the connection with a 1009 close
/// instead. The runtime then observes the disconnect through the reader
/// task ending.
#[derive(Debug, Clone)]
pub struct ConnTx {
    id: u64,
    frames: mpsc::Sender<String>,
    kill: mpsc::Sender<u16>,
}

impl ConnTx {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame without waiting. Returns false (and schedules a 1009
    /// close) if the peer cannot keep up.
    pub fn send(&self, frame: String) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(conn_id = self.id, "send queue full, closing slow consumer");
                let _ = self.kill.try_send(close::BACKPRESSURE);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_msg<T: Serialize>(&self, msg: &T) -> bool {
        match frame(msg) {
            Some(text) => self.send(text),
            None => false,
        }
    }

    /// Close the socket with the given code.
    pub fn close(&self, code: u16) {
        let _ = self.kill.try_send(code);
    }
}

/// Create a connection handle plus the receivers its pump drains.
pub fn conn_channel() -> (ConnTx, mpsc::Receiver<String>, mpsc::Receiver<u16>) {
    let (frames_tx, frames_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
    let (kill_tx, kill_rx) = mpsc::channel(1);
    let conn = ConnTx {
        id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
        frames: frames_tx,
        kill: kill_tx,
    };
    (conn, frames_rx, kill_rx)
}

/// Drain queued frames onto the socket, interleaving keepalive pings. Runs
/// until the queue closes, a kill code arrives, or the sink errors.
pub async fn outbound_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<String>,
    mut kill: mpsc::Receiver<u16>,
) {
    let mut keepalive = tokio::time::interval(Duration::from_secs(IDLE_PING_SECS));
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            biased;
            code = kill.recv() => {
                let code = code.unwrap_or(close::NORMAL);
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Borrowed(""),
                    })))
                    .await;
                break;
            }
            frame = frames.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close::NORMAL,
                            reason: Cow::Borrowed(""),
                        })))
                        .await;
                    break;
                }
            },
            _ = keepalive.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Accept the upgrade, then immediately close with `code`. Used for auth and
/// lookup failures so the client sees the application close code rather than
/// an opaque HTTP error.
pub async fn reject(socket: WebSocket, code: u16, reason: &'static str) {
    let mut socket = socket;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}
