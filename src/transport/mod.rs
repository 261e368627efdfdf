//! Transport bindings for the isolated render worker.
//!
//! The protocol engine only sees [`SandboxTransport`]; the concrete binding
//! decides where the worker actually lives. [`ProcessLauncher`] runs it as a
//! sidecar process speaking newline-delimited JSON, while [`ChannelLauncher`]
//! hosts it in-process behind a channel pair (used by embedders that already
//! own an isolated task or thread, and by tests).

mod process;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::RendererConfig;
use crate::protocol::{HostMessage, SandboxMessage};

pub use process::ProcessLauncher;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn sandbox worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to encode launch config: {0}")]
    Encode(#[source] serde_json::Error),
}

/// One live message channel to an isolated render worker.
///
/// Delivery is unordered across logical requests. The binding drives the
/// channel itself: host messages arrive on `outbound`, worker messages are
/// delivered into `inbound`, and the isolated context is released when
/// either side closes (or when the driving task is dropped).
#[async_trait]
pub trait SandboxTransport: Send {
    async fn run(
        self: Box<Self>,
        outbound: mpsc::Receiver<HostMessage>,
        inbound: mpsc::Sender<SandboxMessage>,
    );
}

/// Creates isolated render workers on demand. The renderer config is part of
/// the launch: the worker receives its options at boot, before it signals
/// `ready`.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(
        &self,
        config: &RendererConfig,
    ) -> Result<Box<dyn SandboxTransport>, TransportError>;
}

/// Worker-side half of an in-process channel binding. Handed to the spawn
/// hook of [`ChannelLauncher`]; the hook is expected to move it onto its own
/// task or thread and serve the protocol until `requests` closes.
pub struct SandboxEndpoint {
    pub config: RendererConfig,
    pub requests: mpsc::Receiver<HostMessage>,
    pub replies: mpsc::Sender<SandboxMessage>,
}

/// In-process binding: each launch builds a fresh channel pair and hands the
/// worker half to the spawn hook.
pub struct ChannelLauncher<F> {
    spawn: F,
}

impl<F> ChannelLauncher<F>
where
    F: Fn(SandboxEndpoint) + Send + Sync,
{
    pub fn new(spawn: F) -> Self {
        Self { spawn }
    }
}

#[async_trait]
impl<F> SandboxLauncher for ChannelLauncher<F>
where
    F: Fn(SandboxEndpoint) + Send + Sync,
{
    async fn launch(
        &self,
        config: &RendererConfig,
    ) -> Result<Box<dyn SandboxTransport>, TransportError> {
        let (request_tx, request_rx) = mpsc::channel(32);
        let (reply_tx, reply_rx) = mpsc::channel(32);

        (self.spawn)(SandboxEndpoint {
            config: config.clone(),
            requests: request_rx,
            replies: reply_tx,
        });

        Ok(Box::new(ChannelTransport {
            requests: request_tx,
            replies: reply_rx,
        }))
    }
}

struct ChannelTransport {
    requests: mpsc::Sender<HostMessage>,
    replies: mpsc::Receiver<SandboxMessage>,
}

#[async_trait]
impl SandboxTransport for ChannelTransport {
    async fn run(
        mut self: Box<Self>,
        mut outbound: mpsc::Receiver<HostMessage>,
        inbound: mpsc::Sender<SandboxMessage>,
    ) {
        loop {
            tokio::select! {
                host = outbound.recv() => match host {
                    Some(message) => {
                        if self.requests.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                reply = self.replies.recv() => match reply {
                    Some(message) => {
                        if inbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }
}
