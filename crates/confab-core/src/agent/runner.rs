use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use confab_protocol::{meta_key, SpawnRequest};

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("failed to launch agent process: {0}")]
    Launch(#[from] std::io::Error),

    #[error("agent process exited with {0}")]
    Failed(std::process::ExitStatus),

    #[error("{0}")]
    Other(String),
}

/// Everything a runner needs to execute one agent turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub room: String,
    pub sender: String,
    pub conv_id: String,
    pub agent_name: String,
    pub prompt: String,
}

/// Runs one agent turn, blocking until the turn ends. The session manager
/// guarantees at most one call per `(room, sender, conv_id)` at a time.
pub trait TurnRunner: Send + Sync {
    fn run_turn(
        &self,
        req: TurnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), TurnError>> + Send + 'static>>;
}

/// Build the prompt for an agent replying to a directed message.
pub fn build_reply_prompt(agent_name: &str, room: &str, req: &SpawnRequest) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "You are {agent_name:?} in the Confab room {room:?}.\n");

    let is_group = req.participants.len() > 1;
    if is_group {
        out.push_str("This is a GROUP conversation thread. All participants:\n");
        for p in &req.participants {
            let _ = writeln!(out, "  • {p}");
        }
        out.push_str("When you reply, ALL participants in this thread are automatically notified.\n\n");
    }

    if !req.context.is_empty() {
        out.push_str("Recent conversation context (newest at bottom):\n");
        for env in &req.context {
            let ts = env.timestamp.format("%H:%M:%S");
            let _ = write!(out, "[#{} {}] {}", env.seq, ts, env.sender);
            let to = env.meta(meta_key::TO);
            if !to.is_empty() {
                let _ = write!(out, " → {to}");
            }
            let _ = writeln!(out, ": {}", env.payload.text);
        }
        out.push('\n');
    }

    let reply_to = &req.trigger.sender;
    let conv_id = req.conv_id();
    out.push_str("━━━ INCOMING MESSAGE ━━━\n");
    let _ = writeln!(out, "From:            {reply_to}");
    let _ = writeln!(out, "Conversation ID: {conv_id}");
    let _ = writeln!(out, "Message:         {}", req.trigger.payload.text);
    out.push_str("\n━━━ REPLY INSTRUCTIONS ━━━\n");
    out.push_str("1. You MUST reply using the `converse` tool — NEVER `send_message` for directed replies.\n");
    let _ = writeln!(
        out,
        "2. Use: converse(to={reply_to:?}, conv_id={conv_id:?}, message=\"your reply\")"
    );
    if is_group {
        out.push_str("   In a group thread you may also change `to` to address a specific participant.\n");
    }
    out.push_str("3. The context above is current — no need to call get_messages first.\n");
    out.push_str("4. To CONTINUE: omit `done`. All participants are notified automatically.\n");
    out.push_str("5. To END: set done=true only when the topic is genuinely exhausted.\n");
    out.push_str("6. Be concise and substantive.\n");

    out
}

/// Build the prompt for a user-initiated agent turn.
pub fn build_user_prompt(agent_name: &str, room: &str, user_prompt: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "You are {agent_name:?} in the Confab room {room:?}.\n");
    out.push_str("Tools available: send_message, converse, get_messages, list_participants.\n\n");
    out.push_str("Your user's request:\n");
    out.push_str(user_prompt);
    out.push_str("\n\n━━━ INSTRUCTIONS ━━━\n");
    out.push_str("- Use get_messages to read recent context first.\n");
    out.push_str("- ALWAYS use send_message to communicate with your user — they read the chat, not the terminal.\n");
    out.push_str("  If you need to ask them something, post it with send_message. They will reply in the chat.\n");
    out.push_str("  After asking, call get_messages to poll for their reply before continuing.\n");
    out.push_str("- To start or continue a directed conversation with another agent, use the `converse` tool.\n");
    out.push_str("- To find other agents: call list_participants and look for names ending in \"'s agent\".\n");
    out.push_str("- The `converse` tool sets metadata so the other agent is automatically notified and spawned to reply.\n");
    out.push_str("- Omit `done` (or set done=false) to keep the conversation going. Set done=true only to end it.\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use confab_protocol::{msg_type, Envelope, Payload};
    use std::collections::HashMap;

    fn envelope(sender: &str, to: &str, text: &str, seq: i64) -> Envelope {
        let mut metadata = HashMap::new();
        if !to.is_empty() {
            metadata.insert(meta_key::TO.to_string(), to.to_string());
        }
        metadata.insert(meta_key::CONV_ID.to_string(), "t1".to_string());
        Envelope {
            id: format!("e{seq}"),
            room: "dev".into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            msg_type: msg_type::TEXT.into(),
            payload: Payload::text(text),
            seq,
            metadata,
        }
    }

    #[test]
    fn reply_prompt_carries_trigger_and_conv_id() {
        let req = SpawnRequest {
            reason: "directed_message".into(),
            trigger: envelope("alice", "bob's agent", "what do you think?", 5),
            context: vec![envelope("alice", "", "earlier", 4)],
            participants: vec![],
        };
        let prompt = build_reply_prompt("bob's agent", "dev", &req);
        assert!(prompt.contains("what do you think?"));
        assert!(prompt.contains("Conversation ID: t1"));
        assert!(prompt.contains("converse(to=\"alice\""));
        assert!(!prompt.contains("GROUP conversation"));
    }

    #[test]
    fn reply_prompt_lists_group_roster() {
        let req = SpawnRequest {
            reason: "directed_message".into(),
            trigger: envelope("alice", "bob's agent", "hi all", 9),
            context: vec![],
            participants: vec!["alice".into(), "bob's agent".into(), "carol's agent".into()],
        };
        let prompt = build_reply_prompt("bob's agent", "dev", &req);
        assert!(prompt.contains("GROUP conversation thread"));
        assert!(prompt.contains("carol's agent"));
    }

    #[test]
    fn user_prompt_embeds_request() {
        let prompt = build_user_prompt("bob's agent", "dev", "summarize the backlog");
        assert!(prompt.contains("summarize the backlog"));
        assert!(prompt.contains("send_message"));
    }
}
