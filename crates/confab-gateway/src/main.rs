use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use confab_core::agent::ProcessRunner;
use confab_core::{build_router, AgentService, ServerConfig};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let defaults = ServerConfig::default();

    let config = ServerConfig {
        bind: parse_socket("CONFAB_BIND", defaults.bind),
        max_history: parse_usize("CONFAB_MAX_HISTORY", defaults.max_history),
        heartbeat_interval: parse_duration("CONFAB_HEARTBEAT_SECS", defaults.heartbeat_interval),
        idle_timeout: parse_duration("CONFAB_IDLE_SECS", defaults.idle_timeout),
        max_frame_bytes: parse_usize("CONFAB_MAX_FRAME_BYTES", defaults.max_frame_bytes),
        context_limit: parse_usize("CONFAB_CONTEXT_LIMIT", defaults.context_limit),
    };

    let agents = if parse_bool("CONFAB_NO_AGENT", false) {
        tracing::info!("agent runner disabled");
        None
    } else {
        let bin = env::var("CONFAB_AGENT_BIN").unwrap_or_else(|_| "agent".to_string());
        let work_dir = env::var("CONFAB_AGENT_WORKDIR").ok().map(PathBuf::from);
        let server_url = env::var("CONFAB_SERVER_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", config.bind.port()));
        tracing::info!(%bin, %server_url, "agent runner enabled (local subprocess)");
        let runner = Arc::new(ProcessRunner::new(bin, work_dir, server_url));
        Some(AgentService::new(runner))
    };

    let app = build_router(config.clone(), agents);

    let listener = TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn parse_socket(key: &str, default: SocketAddr) -> SocketAddr {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => default,
    }
}

fn parse_duration(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map(Duration::from_secs).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match env::var(key) {
        Ok(v) => v.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}
