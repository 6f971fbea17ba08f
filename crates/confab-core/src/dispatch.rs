use std::collections::HashMap;
use std::sync::Arc;

use confab_protocol::{Envelope, Payload, ServerEvent, SpawnRequest};

use crate::room::Room;

/// Append a message and run spawn dispatch for it.
///
/// Dispatch runs once per append, however many connections are attached —
/// a directed envelope produces exactly one spawn signal per eligible
/// recipient. Must be called from a runtime context: hook targets are
/// invoked on fresh tasks so the posting path is never blocked.
pub fn post_message(
    room: &Arc<Room>,
    sender: &str,
    msg_type: &str,
    payload: Payload,
    metadata: HashMap<String, String>,
) -> Envelope {
    let env = room.append(sender, msg_type, payload, metadata);
    dispatch_spawns(room, &env);
    env
}

/// Fan spawn signals out for a freshly appended envelope: daemon targets
/// via their raw queues, hook targets on fresh tasks.
fn dispatch_spawns(room: &Arc<Room>, env: &Envelope) {
    let (targets, thread_members) = room.conv_spawn_targets(env);
    if !targets.is_empty() {
        let context = room.latest(room.context_limit());
        for (name, daemon) in room.daemon_clients(&targets) {
            tracing::debug!(room = room.name(), target = %name, seq = env.seq, "spawn dispatch: daemon");
            daemon.send_event(&ServerEvent::spawn(SpawnRequest {
                reason: "directed_message".into(),
                trigger: env.clone(),
                context: context.clone(),
                participants: thread_members.clone(),
            }));
        }
    }

    let (hooks, hook_members) = room.hook_spawn_targets(env);
    if !hooks.is_empty() {
        let context = room.latest(room.context_limit());
        for (name, hook) in hooks {
            tracing::debug!(room = room.name(), target = %name, seq = env.seq, "spawn dispatch: hook");
            let req = SpawnRequest {
                reason: "directed_message".into(),
                trigger: env.clone(),
                context: context.clone(),
                participants: hook_members.clone(),
            };
            tokio::spawn(async move { hook(req) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClientHandle, ClientMode};
    use crate::room::SpawnHook;
    use confab_protocol::{meta_key, msg_type};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn directed_meta(to: &str, conv_id: &str) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert(meta_key::TO.into(), to.into());
        m.insert(meta_key::CONV_ID.into(), conv_id.into());
        m.insert(meta_key::EXPECTING_REPLY.into(), "true".into());
        m
    }

    fn attach_daemon(room: &Room, name: &str) -> mpsc::Receiver<String> {
        let (env_tx, env_rx) = mpsc::channel(256);
        let (raw_tx, raw_rx) = mpsc::channel(64);
        std::mem::forget(env_rx);
        let handle = ClientHandle::new(Uuid::new_v4(), name, ClientMode::Daemon, env_tx, raw_tx);
        room.register_client(handle.clone());
        room.track_participant(name, "daemon", Some(handle));
        raw_rx
    }

    #[tokio::test]
    async fn directed_post_signals_the_daemon_exactly_once() {
        let room = Arc::new(Room::new("dev", 100));
        let mut raw_rx = attach_daemon(&room, "bob");
        // A second observer must not cause duplicate dispatch.
        let _other = attach_daemon(&room, "carol");

        post_message(
            &room,
            "alice",
            msg_type::TEXT,
            Payload::text("hi"),
            directed_meta("bob", "t1"),
        );

        let frame = raw_rx.recv().await.expect("spawn frame");
        let event: ServerEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(event.event, "spawn");
        let spawn = event.spawn.unwrap();
        assert_eq!(spawn.reason, "directed_message");
        assert_eq!(spawn.trigger.payload.text, "hi");
        assert!(raw_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn daemon_path_wins_over_hook_for_the_same_name() {
        let room = Arc::new(Room::new("dev", 100));
        let mut raw_rx = attach_daemon(&room, "bob");

        let (hook_tx, mut hook_rx) = mpsc::channel::<SpawnRequest>(4);
        let hook: SpawnHook = Arc::new(move |req| {
            let _ = hook_tx.try_send(req);
        });
        room.register_spawn_hook("bob", hook);

        post_message(
            &room,
            "alice",
            msg_type::TEXT,
            Payload::text("hi"),
            directed_meta("bob", "t1"),
        );

        assert!(raw_rx.recv().await.is_some());
        tokio::task::yield_now().await;
        assert!(hook_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hook_fires_when_no_daemon_is_attached() {
        let room = Arc::new(Room::new("dev", 100));

        let (hook_tx, mut hook_rx) = mpsc::channel::<SpawnRequest>(4);
        let hook: SpawnHook = Arc::new(move |req| {
            let _ = hook_tx.try_send(req);
        });
        room.register_spawn_hook("bob's agent", hook);

        post_message(
            &room,
            "alice",
            msg_type::TEXT,
            Payload::text("ping"),
            directed_meta("bob's agent", "t9"),
        );

        let req = hook_rx.recv().await.expect("hook invoked");
        assert_eq!(req.trigger.payload.text, "ping");
        assert_eq!(req.conv_id(), "t9");
    }

    #[tokio::test]
    async fn context_window_honors_the_room_limit() {
        let room = Arc::new(Room::with_context_limit("dev", 100, 2));
        let mut raw_rx = attach_daemon(&room, "bob");

        for i in 0..5 {
            post_message(
                &room,
                "alice",
                msg_type::TEXT,
                Payload::text(format!("m{i}")),
                HashMap::new(),
            );
        }
        post_message(
            &room,
            "alice",
            msg_type::TEXT,
            Payload::text("hi"),
            directed_meta("bob", "t1"),
        );

        let frame = raw_rx.recv().await.expect("spawn frame");
        let event: ServerEvent = serde_json::from_str(&frame).unwrap();
        let spawn = event.spawn.unwrap();
        assert_eq!(spawn.context.len(), 2);
        assert_eq!(spawn.context.last().unwrap().payload.text, "hi");
    }

    #[tokio::test]
    async fn undirected_post_dispatches_nothing() {
        let room = Arc::new(Room::new("dev", 100));
        let mut raw_rx = attach_daemon(&room, "bob");

        post_message(&room, "alice", msg_type::TEXT, Payload::text("hi"), HashMap::new());
        tokio::task::yield_now().await;
        assert!(raw_rx.try_recv().is_err());
    }
}
