//! Process management for the transport bridge subprocess.
//!
//! Spawns the persona-bridge binary and talks to it via JSON-lines over stdio.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use super::protocol::{BridgeCommand, BridgeEvent};

const BRIDGE_BINARY: &str = "persona-bridge";

/// The running bridge subprocess
pub struct BridgeProcess {
    child: Child,
    /// Channel for sending commands to the bridge
    command_tx: mpsc::Sender<BridgeCommand>,
}

/// Configuration for the bridge process
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Path to the persona-bridge binary
    pub binary_path: PathBuf,
    /// Directory for the bridge's session files
    pub session_dir: PathBuf,
    /// Enable verbose logging in the bridge
    pub verbose: bool,
}

impl BridgeProcess {
    /// Spawn the bridge and start forwarding its events to `event_tx`
    pub async fn spawn(config: BridgeConfig, event_tx: mpsc::Sender<BridgeEvent>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.session_dir)
            .await
            .context("Failed to create session directory")?;

        let mut cmd = Command::new(&config.binary_path);
        cmd.arg("--session-dir")
            .arg(&config.session_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if config.verbose {
            cmd.arg("--verbose");
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "Failed to spawn {} binary at {:?}",
                BRIDGE_BINARY, config.binary_path
            )
        })?;

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;
        let stdin = child.stdin.take().context("Failed to capture stdin")?;

        let (command_tx, command_rx) = mpsc::channel::<BridgeCommand>(64);

        let stdout_events = event_tx.clone();
        tokio::spawn(async move {
            Self::read_events(stdout, stdout_events).await;
        });
        tokio::spawn(async move {
            Self::read_stderr(stderr, event_tx).await;
        });
        tokio::spawn(async move {
            Self::write_commands(stdin, command_rx).await;
        });

        Ok(Self { child, command_tx })
    }

    /// Read JSON-line events from stdout
    async fn read_events(stdout: ChildStdout, event_tx: mpsc::Sender<BridgeEvent>) {
        let mut lines = BufReader::new(stdout).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }

            let event = parse_event_line(&line);
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
    }

    /// Read stderr and turn every line into a debug log event
    async fn read_stderr(stderr: ChildStderr, event_tx: mpsc::Sender<BridgeEvent>) {
        let mut lines = BufReader::new(stderr).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }

            let log_event = BridgeEvent::Log {
                level: "debug".to_string(),
                message: format!("[bridge] {}", line),
            };
            if event_tx.send(log_event).await.is_err() {
                break;
            }
        }
    }

    /// Write commands to stdin, one JSON document per line
    async fn write_commands(mut stdin: ChildStdin, mut command_rx: mpsc::Receiver<BridgeCommand>) {
        while let Some(cmd) = command_rx.recv().await {
            let mut json = match serde_json::to_string(&cmd) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize command: {}", e);
                    continue;
                }
            };
            json.push('\n');

            if let Err(e) = stdin.write_all(json.as_bytes()).await {
                tracing::error!("Failed to write command to bridge: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                tracing::error!("Failed to flush stdin: {}", e);
                break;
            }
        }
    }

    /// Sender for commands, shared with the transport client
    pub fn command_sender(&self) -> mpsc::Sender<BridgeCommand> {
        self.command_tx.clone()
    }

    /// Ask the bridge to disconnect, killing it if it does not exit in time
    pub async fn shutdown(mut self) -> Result<()> {
        let _ = self.command_tx.send(BridgeCommand::Disconnect).await;

        tokio::select! {
            result = self.child.wait() => {
                result.context("Failed to wait for bridge process")?;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {
                self.child.kill().await.context("Failed to kill bridge process")?;
            }
        }

        Ok(())
    }
}

/// Parse one stdout line. Unparseable lines become warnings.
fn parse_event_line(line: &str) -> BridgeEvent {
    match serde_json::from_str::<BridgeEvent>(line) {
        Ok(event) => event,
        Err(e) => BridgeEvent::Log {
            level: "warn".to_string(),
            message: format!("Failed to parse bridge event: {} - line: {}", e, line),
        },
    }
}

/// Find the bridge binary next to the executable or in the working directory
pub fn find_bridge_binary() -> Result<PathBuf> {
    if let Ok(exe_path) = std::env::current_exe() {
        let dir = exe_path.parent().unwrap_or(Path::new("."));
        let candidate = dir.join(BRIDGE_BINARY);
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = Path::new(".").join(BRIDGE_BINARY);
    if candidate.exists() {
        return Ok(candidate);
    }

    anyhow::bail!(
        "Could not find the {} binary. Place it next to the executable or pass --bridge-path.",
        BRIDGE_BINARY
    )
}

/// Default directory for settings, session and conversation data
pub fn default_data_dir() -> Result<PathBuf> {
    let dir = dirs::data_dir()
        .or_else(dirs::home_dir)
        .context("Could not determine home directory")?
        .join("persona-relay");

    Ok(dir)
}
