use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use confab_protocol::{meta_key, Envelope, ParticipantInfo, Payload, RoomInfo, SpawnRequest};

use crate::connection::ClientHandle;

/// Default number of trailing envelopes carried as context on a spawn
/// signal. Receivers must not assume the context is complete history.
pub const SPAWN_CONTEXT_LIMIT: usize = 30;

/// Callback standing in for a daemon client whose agent process is
/// co-resident with the hub. Invoked on its own task by the dispatcher.
pub type SpawnHook = Arc<dyn Fn(SpawnRequest) + Send + Sync>;

struct Participant {
    role: String,
    joined_at: DateTime<Utc>,
    connected: bool,
    daemon_client: Option<ClientHandle>,
}

#[derive(Default)]
struct RoomState {
    log: VecDeque<Envelope>,
    seq: i64,
    last_timestamp: Option<DateTime<Utc>>,
    clients: HashMap<Uuid, ClientHandle>,
    participants: HashMap<String, Participant>,
    conv_participants: HashMap<String, HashSet<String>>,
    spawn_hooks: HashMap<String, SpawnHook>,
}

/// One chat scope: a bounded ordered log, the attached connections, the
/// participant registry, and conversation-thread membership.
///
/// All state lives behind a single mutex; every operation holds it for one
/// short critical section and copies out whatever it needs before touching
/// sockets or queues.
pub struct Room {
    name: String,
    max_history: usize,
    context_limit: usize,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>, max_history: usize) -> Self {
        Self::with_context_limit(name, max_history, SPAWN_CONTEXT_LIMIT)
    }

    /// Construct with an explicit spawn-context window.
    pub fn with_context_limit(
        name: impl Into<String>,
        max_history: usize,
        context_limit: usize,
    ) -> Self {
        Self {
            name: name.into(),
            max_history,
            context_limit,
            state: Mutex::new(RoomState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of trailing envelopes carried as context on a spawn signal.
    pub fn context_limit(&self) -> usize {
        self.context_limit
    }

    /// Append a message: assign id + seq + timestamp, store it, update
    /// conversation membership, and fan it out to every attached client.
    ///
    /// The seq is unique and strictly increasing for the lifetime of the
    /// room, surviving history truncation. Timestamps are clamped so they
    /// never decrease within the room.
    pub fn append(
        &self,
        sender: &str,
        msg_type: &str,
        payload: Payload,
        metadata: HashMap<String, String>,
    ) -> Envelope {
        let (env, clients) = {
            let mut st = self.state.lock().expect("room state poisoned");
            st.seq += 1;
            let mut now = Utc::now();
            if let Some(last) = st.last_timestamp {
                if now < last {
                    now = last;
                }
            }
            st.last_timestamp = Some(now);

            let env = Envelope {
                id: Uuid::new_v4().to_string(),
                room: self.name.clone(),
                sender: sender.to_string(),
                timestamp: now,
                msg_type: msg_type.to_string(),
                payload,
                seq: st.seq,
                metadata,
            };

            st.log.push_back(env.clone());
            while st.log.len() > self.max_history {
                st.log.pop_front();
            }

            // Thread membership: sender and recipient join the conv set and
            // never leave it.
            let conv_id = env.meta(meta_key::CONV_ID);
            if !conv_id.is_empty() {
                let members = st.conv_participants.entry(conv_id.to_string()).or_default();
                members.insert(env.sender.clone());
                let to = env.meta(meta_key::TO);
                if !to.is_empty() {
                    members.insert(to.to_string());
                }
            }

            let clients: Vec<ClientHandle> = st.clients.values().cloned().collect();
            (env, clients)
        };

        // Fan out after releasing the lock; enqueue never blocks.
        for client in &clients {
            client.send(env.clone());
        }
        env
    }

    /// Messages with `seq > after`, oldest first, up to `limit` when positive.
    pub fn messages_after(&self, after: i64, limit: usize) -> Vec<Envelope> {
        let st = self.state.lock().expect("room state poisoned");
        let iter = st.log.iter().filter(|m| m.seq > after).cloned();
        if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        }
    }

    /// The last `n` messages in append order.
    pub fn latest(&self, n: usize) -> Vec<Envelope> {
        let st = self.state.lock().expect("room state poisoned");
        let skip = st.log.len().saturating_sub(n);
        st.log.iter().skip(skip).cloned().collect()
    }

    pub fn register_client(&self, client: ClientHandle) {
        let mut st = self.state.lock().expect("room state poisoned");
        st.clients.insert(client.id(), client);
    }

    pub fn unregister_client(&self, id: Uuid) {
        let mut st = self.state.lock().expect("room state poisoned");
        st.clients.remove(&id);
    }

    /// Register or refresh a participant. `joined_at` is preserved across
    /// reconnects; the daemon client reference is replaced only for daemon
    /// registrations.
    pub fn track_participant(&self, name: &str, role: &str, client: Option<ClientHandle>) {
        let mut st = self.state.lock().expect("room state poisoned");
        match st.participants.get_mut(name) {
            Some(p) => {
                p.connected = true;
                p.role = role.to_string();
                if role == "daemon" {
                    p.daemon_client = client;
                }
            }
            None => {
                let daemon_client = if role == "daemon" { client } else { None };
                st.participants.insert(
                    name.to_string(),
                    Participant {
                        role: role.to_string(),
                        joined_at: Utc::now(),
                        connected: true,
                        daemon_client,
                    },
                );
            }
        }
    }

    /// Mark a participant disconnected once its last connection is gone.
    /// The participant record itself is retained.
    pub fn untrack_participant(&self, name: &str) {
        let mut guard = self.state.lock().expect("room state poisoned");
        let st = &mut *guard;
        let still_connected = st.clients.values().any(|c| c.sender() == name);
        if let Some(p) = st.participants.get_mut(name) {
            p.connected = still_connected;
            let stale = p
                .daemon_client
                .as_ref()
                .is_some_and(|dc| !st.clients.contains_key(&dc.id()));
            if stale {
                p.daemon_client = st
                    .clients
                    .values()
                    .find(|c| c.sender() == name && c.is_daemon())
                    .cloned();
            }
        }
    }

    pub fn list_participants(&self) -> Vec<ParticipantInfo> {
        let st = self.state.lock().expect("room state poisoned");
        st.participants
            .iter()
            .map(|(name, p)| ParticipantInfo {
                name: name.clone(),
                role: p.role.clone(),
                joined_at: p.joined_at,
                connected: p.connected,
            })
            .collect()
    }

    pub fn register_spawn_hook(&self, name: &str, hook: SpawnHook) {
        let mut st = self.state.lock().expect("room state poisoned");
        st.spawn_hooks.insert(name.to_string(), hook);
    }

    pub fn unregister_spawn_hook(&self, name: &str) {
        let mut st = self.state.lock().expect("room state poisoned");
        st.spawn_hooks.remove(name);
    }

    /// Point-in-time summary for room listings.
    pub fn snapshot(&self) -> RoomInfo {
        let st = self.state.lock().expect("room state poisoned");
        RoomInfo {
            name: self.name.clone(),
            clients: st.clients.len(),
            message_count: st.log.len(),
            last_seq: st.seq,
        }
    }

    /// Daemon participants to notify when this envelope lands, plus the full
    /// thread roster for the spawn signal. For group threads every member
    /// except the sender is notified, not just the direct recipient.
    pub fn conv_spawn_targets(&self, env: &Envelope) -> (Vec<String>, Vec<String>) {
        if !env.is_directed() {
            return (Vec::new(), Vec::new());
        }

        let st = self.state.lock().expect("room state poisoned");
        let conv_id = env.meta(meta_key::CONV_ID);
        let mut targets: HashSet<String> = HashSet::new();

        let is_daemon_target = |st: &RoomState, name: &str| {
            st.participants
                .get(name)
                .is_some_and(|p| p.connected && p.role == "daemon" && p.daemon_client.is_some())
        };

        let direct = env.meta(meta_key::TO);
        if is_daemon_target(&st, direct) {
            targets.insert(direct.to_string());
        }

        let mut thread_members = Vec::new();
        if !conv_id.is_empty() {
            if let Some(members) = st.conv_participants.get(conv_id) {
                for name in members {
                    if name != &env.sender && is_daemon_target(&st, name) {
                        targets.insert(name.clone());
                    }
                }
                thread_members.extend(members.iter().cloned());
            }
        }

        (targets.into_iter().collect(), thread_members)
    }

    /// Hook-backed participants to notify for this envelope: those with a
    /// registered spawn hook and no daemon connection (the daemon path wins
    /// when both exist), plus the thread roster.
    pub fn hook_spawn_targets(&self, env: &Envelope) -> (Vec<(String, SpawnHook)>, Vec<String>) {
        if !env.is_directed() {
            return (Vec::new(), Vec::new());
        }

        let st = self.state.lock().expect("room state poisoned");
        let conv_id = env.meta(meta_key::CONV_ID);
        let mut hooks: HashMap<String, SpawnHook> = HashMap::new();

        let try_add = |st: &RoomState, hooks: &mut HashMap<String, SpawnHook>, name: &str| {
            if name == env.sender {
                return;
            }
            let Some(hook) = st.spawn_hooks.get(name) else {
                return;
            };
            if st
                .participants
                .get(name)
                .is_some_and(|p| p.daemon_client.is_some())
            {
                return;
            }
            hooks.insert(name.to_string(), hook.clone());
        };

        try_add(&st, &mut hooks, env.meta(meta_key::TO));

        let mut thread_members = Vec::new();
        if !conv_id.is_empty() {
            if let Some(members) = st.conv_participants.get(conv_id) {
                for name in members {
                    try_add(&st, &mut hooks, name);
                }
                thread_members.extend(members.iter().cloned());
            }
        }

        (hooks.into_iter().collect(), thread_members)
    }

    /// Resolve daemon client handles for the given participant names.
    pub fn daemon_clients(&self, names: &[String]) -> Vec<(String, ClientHandle)> {
        let st = self.state.lock().expect("room state poisoned");
        names
            .iter()
            .filter_map(|name| {
                let p = st.participants.get(name)?;
                let client = p.daemon_client.clone()?;
                Some((name.clone(), client))
            })
            .collect()
    }
}
