//! WebSocket streaming: live worker logs and plan conversations.
//!
//! Each socket subscribes to one event-bus topic, replays the buffered tail,
//! then follows live events. A lagging socket gets a `dropped` marker frame
//! instead of silently missing messages. Ping/pong keepalive reaps dead
//! connections.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::events::{log_topic, plan_topic};

use super::api::SharedState;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long to wait for a Pong before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_LOG_HISTORY: usize = 50;
/// Plan sockets replay the whole ring: the conversation must be complete.
const PLAN_HISTORY: usize = 300;

#[derive(Debug, Default, Clone, Deserialize)]
pub struct LogStreamParams {
    #[serde(default)]
    pub history: Option<usize>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
}

impl LogStreamParams {
    /// Frames that carry a project/task id must match the requested filter;
    /// frames without those fields always pass.
    fn matches(&self, frame: &Value) -> bool {
        if let Some(want) = &self.project_id
            && let Some(got) = frame.get("project_id").and_then(|v| v.as_str())
            && got != want
        {
            return false;
        }
        if let Some(want) = &self.task_id
            && let Some(got) = frame.get("task_id").and_then(|v| v.as_str())
            && got != want
        {
            return false;
        }
        true
    }
}

/// `GET /ws/logs/:wid?history=N&project_id=&task_id=`
pub async fn ws_logs(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(worker_id): Path<String>,
    Query(params): Query<LogStreamParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let topic = log_topic(&worker_id);
        let history = params.history.unwrap_or(DEFAULT_LOG_HISTORY);
        stream_topic(socket, state, topic, history, params)
    })
}

/// `GET /ws/plan/:pid/:tid`
pub async fn ws_plan(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path((project_id, task_id)): Path<(String, String)>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let topic = plan_topic(&project_id, &task_id);
        stream_topic(socket, state, topic, PLAN_HISTORY, LogStreamParams::default())
    })
}

async fn stream_topic(
    socket: WebSocket,
    state: SharedState,
    topic: String,
    history: usize,
    params: LogStreamParams,
) {
    let (mut sender, receiver) = socket.split();
    let (replayed, rx) = state.events.subscribe(&topic, history);

    for frame in replayed {
        if !params.matches(&frame) {
            continue;
        }
        let Ok(text) = serde_json::to_string(&frame) else {
            continue;
        };
        if sender.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    run_socket_loop(sender, receiver, rx, params).await;
}

/// Core socket loop: broadcast forwarding, client frames (pong/close), and
/// periodic ping health checks in one select.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<Value>,
    params: LogStreamParams,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick fires immediately; consume it so the first real ping
    // comes after a full interval.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(frame) => {
                        if !params.matches(&frame) {
                            continue;
                        }
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        // This subscriber fell behind; its oldest pending
                        // frames were dropped. Say so instead of hiding it.
                        let marker = serde_json::json!({"type": "dropped", "count": count});
                        if sender.send(Message::Text(marker.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore client text/binary/ping frames.
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
