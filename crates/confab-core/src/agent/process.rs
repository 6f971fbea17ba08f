use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use tokio::process::Command;

use super::runner::{TurnError, TurnRequest, TurnRunner};

/// Subprocess-backed turn runner: launches the configured agent binary once
/// per turn and waits for it to exit.
///
/// The binary receives the room, its display name, the hub URL, and the
/// turn prompt on the command line; how it talks back to the room (tool
/// protocol, message posting) is its own business.
pub struct ProcessRunner {
    bin: String,
    work_dir: PathBuf,
    server_url: String,
}

impl ProcessRunner {
    pub fn new(bin: impl Into<String>, work_dir: Option<PathBuf>, server_url: impl Into<String>) -> Self {
        let work_dir = work_dir
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            bin: bin.into(),
            work_dir,
            server_url: server_url.into(),
        }
    }
}

impl TurnRunner for ProcessRunner {
    fn run_turn(
        &self,
        req: TurnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), TurnError>> + Send + 'static>> {
        let bin = self.bin.clone();
        let work_dir = self.work_dir.clone();
        let server_url = self.server_url.clone();

        Box::pin(async move {
            tracing::info!(room = %req.room, sender = %req.sender, "launching agent turn");

            let status = Command::new(&bin)
                .arg("--server")
                .arg(&server_url)
                .arg("--room")
                .arg(&req.room)
                .arg("--name")
                .arg(&req.agent_name)
                .arg("--prompt")
                .arg(&req.prompt)
                .current_dir(&work_dir)
                .stdin(Stdio::null())
                // Agent output goes to the hub's stderr for visibility.
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .status()
                .await?;

            if !status.success() {
                return Err(TurnError::Failed(status));
            }

            tracing::info!(room = %req.room, sender = %req.sender, "agent turn completed");
            Ok(())
        })
    }
}
