use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use confab_protocol::{
    msg_type, HealthResponse, MessageList, ParticipantList, RoomList, SendRequest,
};

use crate::agent::AgentService;
use crate::config::ServerConfig;
use crate::connection::{run_connection, ClientMode};
use crate::dispatch::post_message;
use crate::hub::Hub;
use crate::session::SessionError;

/// Shared state accessible by handlers.
#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    agents: Option<AgentService>,
    config: ServerConfig,
    started_at: Instant,
}

/// Build the axum router: the REST API under `/api` and the streaming
/// surface at `/ws/{room}`. `agents` may be None to disable the spawn and
/// stop endpoints.
pub fn build_router(config: ServerConfig, agents: Option<AgentService>) -> Router {
    let state = AppState {
        hub: Arc::new(Hub::new(config.max_history, config.context_limit)),
        agents,
        config,
        started_at: Instant::now(),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/rooms", get(list_rooms))
        .route(
            "/api/rooms/{room}/messages",
            post(send_message).get(get_messages),
        )
        .route("/api/rooms/{room}/messages/latest", get(latest_messages))
        .route("/api/rooms/{room}/participants", get(list_participants))
        .route("/api/rooms/{room}/spawn", post(spawn_agent))
        .route("/api/rooms/{room}/stop", post(stop_agent))
        .route("/ws/{room}", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(json!({ "error": msg.into() }))).into_response()
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.started_at.elapsed();
    Json(HealthResponse {
        status: "ok".into(),
        uptime: format_uptime(uptime.as_secs()),
        uptime_seconds: uptime.as_secs_f64(),
        rooms: state.hub.room_count(),
    })
}

async fn list_rooms(State(state): State<AppState>) -> Json<RoomList> {
    Json(RoomList {
        rooms: state.hub.list(),
    })
}

async fn send_message(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(req): Json<SendRequest>,
) -> Response {
    if req.sender.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "sender required");
    }
    let kind = if req.msg_type.is_empty() {
        msg_type::TEXT
    } else {
        req.msg_type.as_str()
    };
    let room = state.hub.get_or_create(&room);
    let env = post_message(&room, &req.sender, kind, req.payload, req.metadata);
    (StatusCode::CREATED, Json(env)).into_response()
}

async fn get_messages(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let after = match params.get("after").map(|v| v.parse::<i64>()) {
        None => 0,
        Some(Ok(n)) => n,
        Some(Err(_)) => return error_response(StatusCode::BAD_REQUEST, "invalid after parameter"),
    };
    let limit = match params.get("limit").map(|v| v.parse::<usize>()) {
        None => 100,
        Some(Ok(n)) if n >= 1 => n,
        Some(_) => return error_response(StatusCode::BAD_REQUEST, "invalid limit parameter"),
    };

    let messages = match state.hub.get(&room) {
        Some(r) => r.messages_after(after, limit),
        None => Vec::new(),
    };
    let count = messages.len();
    Json(MessageList {
        room,
        messages,
        count,
    })
    .into_response()
}

async fn latest_messages(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let n = match params.get("n").map(|v| v.parse::<usize>()) {
        None => 10,
        Some(Ok(n)) if n >= 1 => n,
        Some(_) => return error_response(StatusCode::BAD_REQUEST, "invalid n parameter"),
    };

    let messages = match state.hub.get(&room) {
        Some(r) => r.latest(n),
        None => Vec::new(),
    };
    let count = messages.len();
    Json(MessageList {
        room,
        messages,
        count,
    })
    .into_response()
}

async fn list_participants(
    State(state): State<AppState>,
    Path(room): Path<String>,
) -> Json<ParticipantList> {
    let participants = match state.hub.get(&room) {
        Some(r) => r.list_participants(),
        None => Vec::new(),
    };
    Json(ParticipantList { room, participants })
}

#[derive(Debug, Deserialize)]
struct SpawnBody {
    #[serde(default)]
    sender: String,
    #[serde(default)]
    prompt: String,
}

async fn spawn_agent(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<SpawnBody>,
) -> Response {
    let Some(agents) = state.agents.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "agent runner not configured");
    };
    if body.sender.is_empty() || body.prompt.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "sender and prompt required");
    }

    let room = state.hub.get_or_create(&room);
    match agents.spawn_user_turn(room, &body.sender, &body.prompt) {
        Ok(agent) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "spawning", "agent": agent })),
        )
            .into_response(),
        Err(e @ SessionError::Busy { .. }) => error_response(StatusCode::CONFLICT, e.to_string()),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct StopBody {
    #[serde(default)]
    sender: String,
}

async fn stop_agent(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Json(body): Json<StopBody>,
) -> Response {
    let Some(agents) = state.agents.as_ref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "agent runner not configured");
    };
    if body.sender.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "sender required");
    }

    let Some(room_ref) = state.hub.get(&room) else {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("no active agent session for {} in room {}", body.sender, room),
        );
    };
    match agents.stop_user_agent(&room_ref, &body.sender) {
        Ok(()) => Json(json!({ "status": "stopped" })).into_response(),
        Err(e @ SessionError::NotFound { .. }) => {
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(default)]
    sender: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    role: String,
}

async fn ws_upgrade(
    State(state): State<AppState>,
    Path(room): Path<String>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let sender = if q.sender.is_empty() {
        "anonymous".to_string()
    } else {
        q.sender
    };
    let mode = ClientMode::from_query(&q.mode);
    let role = if q.role.is_empty() {
        "user".to_string()
    } else {
        q.role
    };

    tracing::debug!(%room, %sender, ?mode, %role, "ws upgrade requested");

    let room = state.hub.get_or_create(&room);
    let heartbeat = state.config.heartbeat_interval;
    let idle = state.config.idle_timeout;

    ws.max_message_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| run_connection(socket, room, sender, mode, role, heartbeat, idle))
        .into_response()
}

/// Render an uptime the way dashboards expect it: "1h2m3s" family.
fn format_uptime(total_secs: u64) -> String {
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{m}m{s}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(0), "0s");
        assert_eq!(format_uptime(59), "59s");
        assert_eq!(format_uptime(60), "1m0s");
        assert_eq!(format_uptime(3723), "1h2m3s");
    }
}
