//! Sidecar process binding: the render worker runs as a child process and
//! speaks newline-delimited JSON on stdin/stdout. Stderr is drained into the
//! host's log so worker diagnostics are never lost.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{RendererConfig, SandboxSettings};
use crate::protocol::{HostMessage, SandboxMessage};

use super::{SandboxLauncher, SandboxTransport, TransportError};

/// Launches the configured worker command with the serialized renderer
/// config on its argv. The worker is expected to print `{"type":"ready"}`
/// once its rendering library has booted.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
        }
    }
}

#[async_trait]
impl SandboxLauncher for ProcessLauncher {
    async fn launch(
        &self,
        config: &RendererConfig,
    ) -> Result<Box<dyn SandboxTransport>, TransportError> {
        let config_json = serde_json::to_string(config).map_err(TransportError::Encode)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--config")
            .arg(config_json)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(TransportError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn(io::Error::other("worker stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn(io::Error::other("worker stdout unavailable")))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(
                        target = "disegno::transport::process",
                        line = %line,
                        "sandbox worker stderr"
                    );
                }
            });
        }

        debug!(
            target = "disegno::transport::process",
            program = %self.program.display(),
            "sandbox worker spawned"
        );

        Ok(Box::new(ProcessTransport {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

struct ProcessTransport {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl SandboxTransport for ProcessTransport {
    async fn run(
        mut self: Box<Self>,
        mut outbound: mpsc::Receiver<HostMessage>,
        inbound: mpsc::Sender<SandboxMessage>,
    ) {
        loop {
            tokio::select! {
                host = outbound.recv() => match host {
                    Some(message) => {
                        if let Err(error) = write_message(&mut self.stdin, &message).await {
                            warn!(
                                target = "disegno::transport::process",
                                error = %error,
                                "sandbox stdin write failed"
                            );
                            break;
                        }
                    }
                    None => break,
                },
                read = self.stdout.next_line() => match read {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str(trimmed) {
                            Ok(message) => {
                                if inbound.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                // Worker chatter that is not part of the
                                // protocol must never take the channel down.
                                debug!(
                                    target = "disegno::transport::process",
                                    error = %error,
                                    "discarding unparseable sandbox message"
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(
                            target = "disegno::transport::process",
                            "sandbox worker closed stdout"
                        );
                        break;
                    }
                    Err(error) => {
                        warn!(
                            target = "disegno::transport::process",
                            error = %error,
                            "sandbox stdout read failed"
                        );
                        break;
                    }
                },
            }
        }

        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

async fn write_message(stdin: &mut ChildStdin, message: &HostMessage) -> io::Result<()> {
    let mut line = serde_json::to_vec(message)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    line.push(b'\n');
    stdin.write_all(&line).await?;
    stdin.flush().await
}
