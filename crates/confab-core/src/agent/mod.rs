mod process;
mod runner;
mod service;

pub use process::ProcessRunner;
pub use runner::{build_reply_prompt, build_user_prompt, TurnError, TurnRequest, TurnRunner};
pub use service::AgentService;
