use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::watch;

use confab_protocol::SpawnRequest;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("agent session already active for {sender} in room {room} (conv: {conv_id})")]
    Busy {
        room: String,
        sender: String,
        conv_id: String,
    },

    #[error("no active agent session for {sender} in room {room}")]
    NotFound { room: String, sender: String },
}

/// A `(room, sender, conv_id)` triple. Empty `conv_id` is a legal key for
/// user-initiated, unthreaded turns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    room: String,
    sender: String,
    conv_id: String,
}

impl SessionKey {
    fn new(room: &str, sender: &str, conv_id: &str) -> Self {
        Self {
            room: room.to_string(),
            sender: sender.to_string(),
            conv_id: conv_id.to_string(),
        }
    }
}

struct ActiveSession {
    cancel_tx: watch::Sender<bool>,
}

/// Cancellation signal handed to the task running an agent turn. Resolves
/// when the session is stopped; stays pending forever otherwise.
pub struct CancelHandle {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Session entry gone without a cancel; never resolve.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Tracks active agent turns and queued re-spawns.
///
/// At most one turn runs per `(room, sender, conv_id)`; triples differing
/// in any component run concurrently. When a spawn signal arrives for a
/// busy key, only the most recent signal is kept — a newer message
/// obsoletes an older one for the same thread.
pub struct SessionManager {
    state: Mutex<ManagerState>,
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<SessionKey, ActiveSession>,
    pending: HashMap<SessionKey, SpawnRequest>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Claim the key. Fails with `Busy` when a turn is already running.
    pub fn start(&self, room: &str, sender: &str, conv_id: &str) -> Result<CancelHandle, SessionError> {
        let mut st = self.state.lock().expect("session state poisoned");
        let key = SessionKey::new(room, sender, conv_id);
        if st.sessions.contains_key(&key) {
            return Err(SessionError::Busy {
                room: room.to_string(),
                sender: sender.to_string(),
                conv_id: conv_id.to_string(),
            });
        }
        let (cancel_tx, rx) = watch::channel(false);
        st.sessions.insert(key, ActiveSession { cancel_tx });
        Ok(CancelHandle { rx })
    }

    /// Release the key and atomically take any queued re-spawn signal.
    /// Idempotent: ending an unknown key returns None.
    pub fn end(&self, room: &str, sender: &str, conv_id: &str) -> Option<SpawnRequest> {
        let mut st = self.state.lock().expect("session state poisoned");
        let key = SessionKey::new(room, sender, conv_id);
        st.sessions.remove(&key);
        st.pending.remove(&key)
    }

    /// Record the latest pending signal for a busy key, overwriting any
    /// earlier one.
    pub fn queue_pending(&self, room: &str, sender: &str, conv_id: &str, signal: SpawnRequest) {
        let mut st = self.state.lock().expect("session state poisoned");
        st.pending.insert(SessionKey::new(room, sender, conv_id), signal);
    }

    /// Cancel every turn a user's agent is running in a room, across all
    /// conversation threads, dropping their queued signals.
    pub fn stop(&self, room: &str, sender: &str) -> Result<usize, SessionError> {
        let mut st = self.state.lock().expect("session state poisoned");
        let matching: Vec<SessionKey> = st
            .sessions
            .keys()
            .filter(|k| k.room == room && k.sender == sender)
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(SessionError::NotFound {
                room: room.to_string(),
                sender: sender.to_string(),
            });
        }
        for key in &matching {
            if let Some(session) = st.sessions.remove(key) {
                let _ = session.cancel_tx.send(true);
            }
            st.pending.remove(key);
        }
        Ok(matching.len())
    }

    pub fn is_active(&self, room: &str, sender: &str, conv_id: &str) -> bool {
        let st = self.state.lock().expect("session state poisoned");
        st.sessions.contains_key(&SessionKey::new(room, sender, conv_id))
    }

    pub fn active_count(&self) -> usize {
        let st = self.state.lock().expect("session state poisoned");
        st.sessions.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
