use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use confab_protocol::{msg_type, Envelope, Payload, SendRequest, ServerEvent};

use crate::dispatch::post_message;
use crate::room::Room;

/// Outbound envelope queue depth per client.
const OUT_ENVELOPES: usize = 256;
/// Outbound raw-frame queue depth per client (control events).
const OUT_RAW: usize = 64;

/// Wire dialect of a connection: legacy observers receive bare envelopes,
/// daemons receive `ServerEvent` wrappers and spawn signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Legacy,
    Daemon,
}

impl ClientMode {
    pub fn from_query(mode: &str) -> Self {
        if mode == "daemon" {
            Self::Daemon
        } else {
            Self::Legacy
        }
    }
}

/// Enqueue-side handle to one connection, held by the room registry.
///
/// Both queues are drained only by the connection's own loop; enqueuing
/// never blocks — a full queue drops the item. A slow consumer catches up
/// through `messages_after`.
#[derive(Clone)]
pub struct ClientHandle {
    id: Uuid,
    sender: Arc<str>,
    mode: ClientMode,
    envelopes: mpsc::Sender<Envelope>,
    raw: mpsc::Sender<String>,
}

impl ClientHandle {
    pub(crate) fn new(
        id: Uuid,
        sender: &str,
        mode: ClientMode,
        envelopes: mpsc::Sender<Envelope>,
        raw: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            mode,
            envelopes,
            raw,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn is_daemon(&self) -> bool {
        self.mode == ClientMode::Daemon
    }

    /// Queue an envelope for delivery. Drops when the peer is too slow.
    pub fn send(&self, env: Envelope) {
        if self.envelopes.try_send(env).is_err() {
            tracing::debug!(sender = %self.sender, "envelope queue full, dropping");
        }
    }

    /// Queue a control event for a daemon client. No-op for legacy clients.
    pub fn send_event(&self, event: &ServerEvent) {
        if self.mode != ClientMode::Daemon {
            return;
        }
        let Ok(frame) = serde_json::to_string(event) else {
            return;
        };
        if self.raw.try_send(frame).is_err() {
            tracing::debug!(sender = %self.sender, event = %event.event, "raw queue full, dropping");
        }
    }
}

/// Run one connection's lifecycle: register, announce the join, then a
/// single select loop multiplexing inbound frames, the two outbound queues,
/// the heartbeat ping, and the read-idle deadline. Teardown unregisters the
/// client and flips the participant record to disconnected.
pub async fn run_connection(
    socket: WebSocket,
    room: Arc<Room>,
    sender: String,
    mode: ClientMode,
    role: String,
    heartbeat_interval: Duration,
    idle_timeout: Duration,
) {
    let conn_id = Uuid::new_v4();
    let (env_tx, mut env_rx) = mpsc::channel::<Envelope>(OUT_ENVELOPES);
    let (raw_tx, mut raw_rx) = mpsc::channel::<String>(OUT_RAW);
    let handle = ClientHandle::new(conn_id, &sender, mode, env_tx, raw_tx);

    room.register_client(handle.clone());
    room.track_participant(&sender, &role, Some(handle));
    post_message(
        &room,
        "system",
        msg_type::SYSTEM,
        Payload::text(format!("{sender} joined the room")),
        HashMap::new(),
    );

    tracing::info!(room = room.name(), %sender, ?mode, %role, "client connected");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await; // consume immediate first tick
    let mut idle_deadline = tokio::time::Instant::now() + idle_timeout;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                        if !handle_inbound(&room, &sender, &text) {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        idle_deadline = tokio::time::Instant::now() + idle_timeout;
                        tracing::debug!(%sender, "ignoring binary frame");
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::warn!(room = room.name(), %sender, "ws read error: {e}");
                        break;
                    }
                }
            }
            env = env_rx.recv() => {
                let Some(env) = env else { break };
                let frame = match mode {
                    ClientMode::Daemon => serde_json::to_string(&ServerEvent::message(env)),
                    ClientMode::Legacy => serde_json::to_string(&env),
                };
                let Ok(frame) = frame else { continue };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            raw = raw_rx.recv() => {
                let Some(raw) = raw else { break };
                if sink.send(Message::Text(raw.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                tracing::info!(room = room.name(), %sender, "idle timeout");
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: 4000,
                        reason: "idle timeout".into(),
                    })))
                    .await;
                break;
            }
        }
    }

    room.unregister_client(conn_id);
    room.untrack_participant(&sender);
    tracing::info!(room = room.name(), %sender, "client disconnected");
}

/// Decode and post one inbound frame. Returns false when the connection
/// must be terminated (decode failure).
fn handle_inbound(room: &Arc<Room>, default_sender: &str, text: &str) -> bool {
    if is_app_ping(text) {
        return true;
    }
    let req: SendRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(room = room.name(), sender = default_sender, "invalid send request: {e}");
            return false;
        }
    };
    let sender = if req.sender.is_empty() {
        default_sender
    } else {
        req.sender.as_str()
    };
    let kind = if req.msg_type.is_empty() {
        msg_type::TEXT
    } else {
        req.msg_type.as_str()
    };
    post_message(room, sender, kind, req.payload, req.metadata);
    true
}

/// Application-level keepalive: an object carrying `_ping: true`.
fn is_app_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("_ping").and_then(serde_json::Value::as_bool))
        == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle(mode: ClientMode, env_cap: usize, raw_cap: usize) -> ClientHandle {
        let (env_tx, env_rx) = mpsc::channel(env_cap);
        let (raw_tx, raw_rx) = mpsc::channel(raw_cap);
        std::mem::forget(env_rx);
        std::mem::forget(raw_rx);
        ClientHandle::new(Uuid::new_v4(), "tester", mode, env_tx, raw_tx)
    }

    fn envelope(seq: i64) -> Envelope {
        Envelope {
            id: format!("e{seq}"),
            room: "dev".into(),
            sender: "alice".into(),
            timestamp: chrono::Utc::now(),
            msg_type: msg_type::TEXT.into(),
            payload: Payload::text("x"),
            seq,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn app_ping_detection() {
        assert!(is_app_ping(r#"{"_ping": true}"#));
        assert!(!is_app_ping(r#"{"_ping": false}"#));
        assert!(!is_app_ping(r#"{"sender": "a"}"#));
        assert!(!is_app_ping("not json"));
    }

    #[tokio::test]
    async fn inbound_normalizes_sender_and_type() {
        let room = Arc::new(Room::new("dev", 10));
        assert!(handle_inbound(&room, "alice", r#"{"payload":{"text":"hi"}}"#));
        let log = room.latest(1);
        assert_eq!(log[0].sender, "alice");
        assert_eq!(log[0].msg_type, "text");
    }

    #[tokio::test]
    async fn inbound_decode_error_terminates() {
        let room = Arc::new(Room::new("dev", 10));
        assert!(!handle_inbound(&room, "alice", "{broken"));
        assert!(room.latest(1).is_empty());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let handle = test_handle(ClientMode::Daemon, 2, 1);
        for seq in 0..50 {
            handle.send(envelope(seq));
        }
        handle.send_event(&ServerEvent::message(envelope(0)));
        handle.send_event(&ServerEvent::message(envelope(1)));
        // Reaching here without a hang is the assertion.
    }

    #[test]
    fn legacy_clients_never_receive_events() {
        let (env_tx, _env_rx) = mpsc::channel(4);
        let (raw_tx, mut raw_rx) = mpsc::channel(4);
        let handle = ClientHandle::new(Uuid::new_v4(), "obs", ClientMode::Legacy, env_tx, raw_tx);
        handle.send_event(&ServerEvent::message(envelope(1)));
        assert!(raw_rx.try_recv().is_err());
    }
}
