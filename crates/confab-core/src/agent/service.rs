use std::collections::HashMap;
use std::sync::Arc;

use confab_protocol::{msg_type, Payload, SpawnRequest};

use super::runner::{build_reply_prompt, build_user_prompt, TurnRequest, TurnRunner};
use crate::room::{Room, SpawnHook};
use crate::session::{CancelHandle, SessionError, SessionManager};

/// Orchestrates agent turns for agents co-resident with the hub: session
/// exclusivity, queued re-spawn when a signal lands on a busy thread, and
/// failure reporting into the room.
///
/// Cheap to clone; clones share the runner and the session manager.
#[derive(Clone)]
pub struct AgentService {
    runner: Arc<dyn TurnRunner>,
    sessions: Arc<SessionManager>,
}

impl AgentService {
    pub fn new(runner: Arc<dyn TurnRunner>) -> Self {
        Self {
            runner,
            sessions: Arc::new(SessionManager::new()),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Display name of the agent acting for a user.
    pub fn agent_name(sender: &str) -> String {
        format!("{sender}'s agent")
    }

    /// Build the spawn hook standing in for this user's agent. Registered
    /// on the room, it receives spawn signals for directed replies and
    /// applies the busy→pending→replay protocol.
    pub fn hook(&self, room: Arc<Room>, sender: &str, agent_name: &str) -> SpawnHook {
        let svc = self.clone();
        let sender = sender.to_string();
        let agent_name = agent_name.to_string();
        Arc::new(move |signal: SpawnRequest| {
            svc.handle_signal(&room, &sender, &agent_name, signal);
        })
    }

    /// Start a user-initiated turn (empty `conv_id`). Registers the spawn
    /// hook so directed replies from other agents re-spawn this one, then
    /// runs the turn in the background.
    ///
    /// Fails with `Busy` when an unthreaded turn is already running.
    pub fn spawn_user_turn(
        &self,
        room: Arc<Room>,
        sender: &str,
        prompt: &str,
    ) -> Result<String, SessionError> {
        let agent_name = Self::agent_name(sender);
        room.register_spawn_hook(&agent_name, self.hook(room.clone(), sender, &agent_name));

        let cancel = self.sessions.start(room.name(), sender, "")?;

        room.append(
            "system",
            msg_type::SYSTEM,
            Payload::text(format!("{agent_name} is thinking...")),
            HashMap::new(),
        );
        room.track_participant(&agent_name, "agent", None);

        let req = TurnRequest {
            room: room.name().to_string(),
            sender: sender.to_string(),
            conv_id: String::new(),
            agent_name: agent_name.clone(),
            prompt: build_user_prompt(&agent_name, room.name(), prompt),
        };

        let svc = self.clone();
        let sender = sender.to_string();
        let agent = agent_name.clone();
        tokio::spawn(async move {
            svc.drive_turn(room.clone(), sender, agent.clone(), String::new(), req, cancel)
                .await;
            room.untrack_participant(&agent);
        });

        Ok(agent_name)
    }

    /// Cancel all of a user's agent turns in a room and retire the hook.
    pub fn stop_user_agent(&self, room: &Room, sender: &str) -> Result<(), SessionError> {
        self.sessions.stop(room.name(), sender)?;
        let agent_name = Self::agent_name(sender);
        room.unregister_spawn_hook(&agent_name);
        room.append(
            "system",
            msg_type::SYSTEM,
            Payload::text(format!("{agent_name} was stopped")),
            HashMap::new(),
        );
        Ok(())
    }

    /// Entry point for a spawn signal. Never blocks and never drops: a busy
    /// key records the signal as pending (latest wins), a free key starts a
    /// turn immediately.
    pub fn handle_signal(
        &self,
        room: &Arc<Room>,
        sender: &str,
        agent_name: &str,
        signal: SpawnRequest,
    ) {
        let conv_id = signal.conv_id().to_string();
        match self.sessions.start(room.name(), sender, &conv_id) {
            Err(_) => {
                tracing::info!(
                    room = room.name(),
                    %sender,
                    conv = %conv_id,
                    "session active, queueing spawn"
                );
                self.sessions.queue_pending(room.name(), sender, &conv_id, signal);
            }
            Ok(cancel) => {
                let req = TurnRequest {
                    room: room.name().to_string(),
                    sender: sender.to_string(),
                    conv_id: conv_id.clone(),
                    agent_name: agent_name.to_string(),
                    prompt: build_reply_prompt(agent_name, room.name(), &signal),
                };
                let svc = self.clone();
                let room = room.clone();
                let sender = sender.to_string();
                let agent_name = agent_name.to_string();
                tokio::spawn(svc.drive_turn(room, sender, agent_name, conv_id, req, cancel));
            }
        }
    }

    /// Run turns for one session key until no pending signal remains.
    ///
    /// Completion ends the session and atomically takes the pending signal;
    /// a present signal starts a fresh turn in the same task. Cancellation
    /// returns immediately — `stop` has already cleaned up the entry and
    /// its pending slot, and ending here could tear down a session another
    /// caller has since started under the same key.
    async fn drive_turn(
        self,
        room: Arc<Room>,
        sender: String,
        agent_name: String,
        conv_id: String,
        first: TurnRequest,
        cancel: CancelHandle,
    ) {
        let mut req = first;
        let mut conv = conv_id;
        let mut cancel = cancel;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                res = self.runner.run_turn(req) => Some(res),
            };

            match outcome {
                None => {
                    tracing::info!(room = room.name(), %sender, conv = %conv, "agent turn cancelled");
                    return;
                }
                Some(Err(e)) => {
                    tracing::error!(room = room.name(), %sender, conv = %conv, "agent turn failed: {e}");
                    room.append(
                        "system",
                        msg_type::SYSTEM,
                        Payload::text(format!("{agent_name} encountered an error: {e}")),
                        HashMap::new(),
                    );
                }
                Some(Ok(())) => {}
            }

            let Some(signal) = self.sessions.end(room.name(), &sender, &conv) else {
                return;
            };

            let next_conv = signal.conv_id().to_string();
            match self.sessions.start(room.name(), &sender, &next_conv) {
                Ok(c) => {
                    tracing::info!(
                        room = room.name(),
                        %sender,
                        conv = %next_conv,
                        "replaying queued spawn"
                    );
                    req = TurnRequest {
                        room: room.name().to_string(),
                        sender: sender.clone(),
                        conv_id: next_conv.clone(),
                        agent_name: agent_name.clone(),
                        prompt: build_reply_prompt(&agent_name, room.name(), &signal),
                    };
                    conv = next_conv;
                    cancel = c;
                }
                Err(_) => {
                    // Another dispatch claimed the key between end and start;
                    // leave the signal for that turn's completion path.
                    self.sessions.queue_pending(room.name(), &sender, &next_conv, signal);
                    return;
                }
            }
        }
    }
}
