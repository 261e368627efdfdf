//! The protocol engine: owns exactly one isolated render worker and the
//! message channel to it, translating request/response traffic into caller
//! futures.
//!
//! Lifecycle runs `Uninitialized → Ready → Destroyed`. Booting is re-entrant
//! safe: concurrent callers share one in-flight boot, and a boot that fails
//! leaves the client `Uninitialized` so the next call can retry. `Ready` is
//! only entered once the worker's explicit `ready` signal is observed, so no
//! request can reach the channel before the sandbox can serve it.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::{counter, histogram};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{RendererConfig, RendererConfigPatch, SandboxSettings};
use crate::protocol::{HostMessage, SandboxMessage, generate_request_id};
use crate::telemetry::{
    METRIC_RENDER_FAILURE_TOTAL, METRIC_RENDER_MS, METRIC_RENDER_TIMEOUT_TOTAL,
    METRIC_RENDER_TOTAL, METRIC_SANDBOX_BOOT_MS,
};
use crate::transport::{SandboxLauncher, SandboxTransport as _, TransportError};
use crate::types::{RenderError, RenderOptions, RenderResult};

/// Pending render requests keyed by correlation id.
///
/// Entries are removed exactly once: by the matching response, by the
/// caller's timeout, or by teardown. A response whose id is no longer
/// present belongs to a request already resolved (or to a superseded
/// worker) and is discarded without error.
#[derive(Default)]
struct PendingRenders {
    inner: DashMap<String, oneshot::Sender<Result<RenderResult, RenderError>>>,
}

impl PendingRenders {
    fn register(&self, request_id: String) -> oneshot::Receiver<Result<RenderResult, RenderError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(request_id, tx);
        rx
    }

    fn deliver(&self, request_id: &str, outcome: Result<RenderResult, RenderError>) {
        match self.inner.remove(request_id) {
            Some((_id, sender)) => {
                // The receiver may have timed out between removal and here;
                // a failed send is the same discard as an unmatched id.
                let _ = sender.send(outcome);
            }
            None => debug!(
                target = "disegno::client",
                request_id = %request_id,
                "response for unknown request id ignored"
            ),
        }
    }

    fn discard(&self, request_id: &str) {
        self.inner.remove(request_id);
    }

    fn fail_all(&self, error: &RenderError) {
        let ids: Vec<String> = self.inner.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_id, sender)) = self.inner.remove(&id) {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }
}

struct ConfigAck {
    success: bool,
    error: Option<String>,
}

struct Channel {
    outbound: mpsc::Sender<HostMessage>,
    /// Binding-owned task driving the transport.
    pump: JoinHandle<()>,
    /// Client-owned task routing inbound messages to their consumers.
    router: JoinHandle<()>,
}

impl Channel {
    fn close(&self) {
        // Aborting the pump drops the transport; a sidecar process is
        // reaped through kill-on-drop.
        self.pump.abort();
        self.router.abort();
    }
}

enum Lifecycle {
    Uninitialized,
    Ready(Channel),
    Destroyed,
}

/// Client for one isolated render worker.
///
/// All shared mutable state (the pending table, the lifecycle slot, the
/// active config snapshot) is owned here; nothing outside this type touches
/// it directly.
pub struct SandboxClient {
    settings: SandboxSettings,
    launcher: Arc<dyn SandboxLauncher>,
    config: StdMutex<RendererConfig>,
    lifecycle: StdMutex<Lifecycle>,
    /// Serializes sandbox boots so two callers racing through a cold start
    /// launch exactly one worker.
    init_gate: Mutex<()>,
    pending: Arc<PendingRenders>,
    pong_tx: mpsc::Sender<()>,
    pong_rx: Mutex<mpsc::Receiver<()>>,
    ack_tx: mpsc::Sender<ConfigAck>,
    ack_rx: Mutex<mpsc::Receiver<ConfigAck>>,
}

impl SandboxClient {
    pub fn new(
        settings: SandboxSettings,
        launcher: Arc<dyn SandboxLauncher>,
        config: RendererConfig,
    ) -> Self {
        let (pong_tx, pong_rx) = mpsc::channel(4);
        let (ack_tx, ack_rx) = mpsc::channel(4);

        Self {
            settings,
            launcher,
            config: StdMutex::new(config),
            lifecycle: StdMutex::new(Lifecycle::Uninitialized),
            init_gate: Mutex::new(()),
            pending: Arc::new(PendingRenders::default()),
            pong_tx,
            pong_rx: Mutex::new(pong_rx),
            ack_tx,
            ack_rx: Mutex::new(ack_rx),
        }
    }

    /// Boot the isolated worker if it is not already running. Concurrent
    /// callers await the same boot; a failed boot leaves the client
    /// uninitialized so it can be retried.
    pub async fn initialize(&self) -> Result<(), RenderError> {
        self.ensure_ready().await.map(|_outbound| ())
    }

    /// Active config snapshot. Replaced only after the sandbox confirms a
    /// config update.
    pub fn config(&self) -> RendererConfig {
        lock(&self.config).clone()
    }

    /// Render a diagram source string to vector markup.
    pub async fn render(
        &self,
        id: &str,
        diagram_text: &str,
        options: &RenderOptions,
    ) -> Result<RenderResult, RenderError> {
        let outbound = self.ensure_ready().await?;

        let started_at = Instant::now();
        let request_id = generate_request_id(id);
        let wait = options.timeout.unwrap_or(self.settings.render_timeout);

        let receiver = self.pending.register(request_id.clone());
        let published = outbound
            .send(HostMessage::Render {
                request_id: request_id.clone(),
                diagram_text: diagram_text.to_owned(),
            })
            .await;
        if published.is_err() {
            self.pending.discard(&request_id);
            return Err(RenderError::ChannelUnavailable);
        }
        counter!(METRIC_RENDER_TOTAL).increment(1);

        let outcome = match timeout(wait, receiver).await {
            Ok(Ok(outcome)) => outcome,
            // The table entry was dropped without a verdict: teardown raced us.
            Ok(Err(_closed)) => Err(RenderError::Destroyed),
            Err(_elapsed) => {
                // Client-side cancellation only: the worker is not notified,
                // and a late result is discarded as an unmatched id.
                self.pending.discard(&request_id);
                counter!(METRIC_RENDER_TIMEOUT_TOTAL).increment(1);
                Err(RenderError::RenderTimeout)
            }
        };

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        histogram!(METRIC_RENDER_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        match &outcome {
            Ok(result) => info!(
                target = "disegno::client",
                op = "render",
                result = "ok",
                request_id = %request_id,
                elapsed_ms,
                svg_bytes = result.svg.len(),
                "diagram rendered"
            ),
            Err(RenderError::RenderTimeout) => warn!(
                target = "disegno::client",
                op = "render",
                result = "timeout",
                request_id = %request_id,
                elapsed_ms,
                "diagram render timed out"
            ),
            Err(error) => {
                counter!(METRIC_RENDER_FAILURE_TOTAL).increment(1);
                warn!(
                    target = "disegno::client",
                    op = "render",
                    result = "error",
                    request_id = %request_id,
                    elapsed_ms,
                    error = %error,
                    "diagram render failed"
                );
            }
        }

        outcome
    }

    /// Apply a partial config. The in-memory snapshot is replaced only after
    /// the sandbox acknowledges success. One update round-trip at a time.
    pub async fn update_config(&self, patch: RendererConfigPatch) -> Result<(), RenderError> {
        let outbound = self.require_ready()?;

        let mut ack_rx = self.ack_rx.lock().await;
        // Acks from a timed-out predecessor must not satisfy this round-trip.
        while ack_rx.try_recv().is_ok() {}

        outbound
            .send(HostMessage::ConfigUpdate {
                config: patch.clone(),
            })
            .await
            .map_err(|_| RenderError::ChannelUnavailable)?;

        match timeout(self.settings.control_timeout, ack_rx.recv()).await {
            Ok(Some(ack)) if ack.success => {
                let mut config = lock(&self.config);
                *config = patch.apply_to(&config);
                info!(
                    target = "disegno::client",
                    op = "update_config",
                    result = "ok",
                    "sandbox config updated"
                );
                Ok(())
            }
            Ok(Some(ack)) => Err(RenderError::ConfigUpdateFailed {
                message: ack
                    .error
                    .unwrap_or_else(|| "sandbox rejected the update".to_owned()),
            }),
            Ok(None) => Err(RenderError::ChannelUnavailable),
            Err(_elapsed) => Err(RenderError::ConfigUpdateFailed {
                message: "timed out waiting for acknowledgement".to_owned(),
            }),
        }
    }

    /// Health check; resolves to the round-trip latency.
    pub async fn ping(&self) -> Result<Duration, RenderError> {
        let outbound = self.require_ready()?;

        let mut pong_rx = self.pong_rx.lock().await;
        // A pong from a timed-out predecessor must not satisfy this ping.
        while pong_rx.try_recv().is_ok() {}

        let started_at = Instant::now();
        outbound
            .send(HostMessage::Ping)
            .await
            .map_err(|_| RenderError::ChannelUnavailable)?;

        match timeout(self.settings.control_timeout, pong_rx.recv()).await {
            Ok(Some(())) => Ok(started_at.elapsed()),
            Ok(None) => Err(RenderError::ChannelUnavailable),
            Err(_elapsed) => Err(RenderError::PingTimeout),
        }
    }

    /// Tear the client down: reject every pending request with a destroyed
    /// error, close the channel, and release the worker. Idempotent; the
    /// rejections complete before this call returns.
    pub fn destroy(&self) {
        let channel = {
            let mut lifecycle = lock(&self.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Destroyed) {
                Lifecycle::Ready(channel) => Some(channel),
                Lifecycle::Uninitialized | Lifecycle::Destroyed => None,
            }
        };

        if let Some(channel) = channel {
            channel.close();
            info!(
                target = "disegno::client",
                op = "destroy",
                "sandbox released"
            );
        }

        self.pending.fail_all(&RenderError::Destroyed);
    }

    fn current_outbound(&self) -> Result<Option<mpsc::Sender<HostMessage>>, RenderError> {
        match &*lock(&self.lifecycle) {
            Lifecycle::Ready(channel) => Ok(Some(channel.outbound.clone())),
            Lifecycle::Uninitialized => Ok(None),
            Lifecycle::Destroyed => Err(RenderError::Destroyed),
        }
    }

    fn require_ready(&self) -> Result<mpsc::Sender<HostMessage>, RenderError> {
        self.current_outbound()?
            .ok_or(RenderError::ChannelUnavailable)
    }

    async fn ensure_ready(&self) -> Result<mpsc::Sender<HostMessage>, RenderError> {
        if let Some(outbound) = self.current_outbound()? {
            return Ok(outbound);
        }

        let _gate = self.init_gate.lock().await;
        if let Some(outbound) = self.current_outbound()? {
            return Ok(outbound);
        }

        let started_at = Instant::now();
        let config = self.config();
        let transport = self
            .launcher
            .launch(&config)
            .await
            .map_err(launch_error)?;

        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let (inbound_tx, inbound_rx) = mpsc::channel(32);
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let pump = tokio::spawn(transport.run(outbound_rx, inbound_tx));
        let router = tokio::spawn(route_loop(
            inbound_rx,
            Arc::clone(&self.pending),
            ready_tx,
            self.pong_tx.clone(),
            self.ack_tx.clone(),
        ));
        let channel = Channel {
            outbound: outbound_tx.clone(),
            pump,
            router,
        };

        // The outbound sender is published only after this wait succeeds, so
        // nothing reaches the channel before the ready signal is observed.
        let ready = timeout(self.settings.ready_timeout, async {
            loop {
                if *ready_rx.borrow_and_update() {
                    return true;
                }
                if ready_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;

        match ready {
            Ok(true) => {}
            Ok(false) => {
                channel.close();
                warn!(
                    target = "disegno::client",
                    op = "initialize",
                    result = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "sandbox channel closed before signalling ready"
                );
                return Err(RenderError::ChannelUnavailable);
            }
            Err(_elapsed) => {
                channel.close();
                warn!(
                    target = "disegno::client",
                    op = "initialize",
                    result = "timeout",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "sandbox did not signal ready"
                );
                return Err(RenderError::InitializationTimeout);
            }
        }

        let mut lifecycle = lock(&self.lifecycle);
        match &*lifecycle {
            Lifecycle::Destroyed => {
                // destroy() won the race; release the fresh worker too.
                drop(lifecycle);
                channel.close();
                Err(RenderError::Destroyed)
            }
            Lifecycle::Uninitialized | Lifecycle::Ready(_) => {
                *lifecycle = Lifecycle::Ready(channel);
                drop(lifecycle);
                let elapsed_ms = started_at.elapsed().as_millis() as u64;
                histogram!(METRIC_SANDBOX_BOOT_MS)
                    .record(started_at.elapsed().as_secs_f64() * 1000.0);
                info!(
                    target = "disegno::client",
                    op = "initialize",
                    result = "ready",
                    elapsed_ms,
                    "sandbox ready"
                );
                Ok(outbound_tx)
            }
        }
    }
}

impl Drop for SandboxClient {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn launch_error(error: TransportError) -> RenderError {
    match error {
        TransportError::Spawn(source) => RenderError::Launch {
            message: source.to_string(),
        },
        other => RenderError::Launch {
            message: other.to_string(),
        },
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes every inbound message to its consumer. Runs until the transport
/// pump hangs up, which happens when the worker dies or the client closes
/// the channel.
async fn route_loop(
    mut inbound: mpsc::Receiver<SandboxMessage>,
    pending: Arc<PendingRenders>,
    ready_tx: watch::Sender<bool>,
    pong_tx: mpsc::Sender<()>,
    ack_tx: mpsc::Sender<ConfigAck>,
) {
    while let Some(message) = inbound.recv().await {
        route_inbound(message, &pending, &ready_tx, &pong_tx, &ack_tx);
    }

    debug!(target = "disegno::client", "sandbox channel closed");
    // Requests stranded by a dead channel are released here rather than
    // waiting out their timeouts. After destroy() the table is already empty.
    pending.fail_all(&RenderError::ChannelUnavailable);
}

fn route_inbound(
    message: SandboxMessage,
    pending: &PendingRenders,
    ready_tx: &watch::Sender<bool>,
    pong_tx: &mpsc::Sender<()>,
    ack_tx: &mpsc::Sender<ConfigAck>,
) {
    match message {
        SandboxMessage::Ready => {
            let _ = ready_tx.send(true);
        }
        SandboxMessage::Pong => {
            let _ = pong_tx.try_send(());
        }
        SandboxMessage::ConfigUpdated { success, error } => {
            let _ = ack_tx.try_send(ConfigAck { success, error });
        }
        SandboxMessage::RenderResult {
            request_id,
            success,
            svg,
            error,
            method,
        } => {
            let outcome = if success {
                match svg {
                    Some(svg) => Ok(RenderResult { svg, method }),
                    None => Err(RenderError::RenderFailed {
                        message: "sandbox reported success without markup".to_owned(),
                    }),
                }
            } else {
                Err(RenderError::RenderFailed {
                    message: error
                        .unwrap_or_else(|| "sandbox reported an unspecified failure".to_owned()),
                })
            };
            pending.deliver(&request_id, outcome);
        }
    }
}
