pub mod agent;
mod config;
mod connection;
mod dispatch;
mod hub;
mod room;
mod server;
mod session;

pub use agent::AgentService;
pub use config::ServerConfig;
pub use connection::{ClientHandle, ClientMode};
pub use dispatch::post_message;
pub use hub::Hub;
pub use room::{Room, SpawnHook, SPAWN_CONTEXT_LIMIT};
pub use server::build_router;
pub use session::{CancelHandle, SessionError, SessionManager};
