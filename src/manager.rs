//! The service object the embedding application owns: hides whether the
//! underlying client exists yet, serializes lazy initialization, and is the
//! sole entry point the rest of the application calls.
//!
//! Lifecycle is ordinary object lifetime management: construct the service
//! at the composition root, hand out references, and let `Drop` (or an
//! explicit [`DiagramService::destroy`]) tear the sandbox down.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::client::SandboxClient;
use crate::clipboard::{ClipboardError, copy_png_to_clipboard};
use crate::config::{RendererConfig, RendererConfigPatch, Settings};
use crate::raster::{RasterError, RasterOptions, convert_svg_to_png};
use crate::transport::{ProcessLauncher, SandboxLauncher};
use crate::types::{RenderError, RenderOptions, RenderResult};

/// Failure of the combined render → convert → clipboard export path.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Raster(#[from] RasterError),
    #[error(transparent)]
    Clipboard(#[from] ClipboardError),
}

/// Entry point for diagram rendering.
///
/// Owns at most one [`SandboxClient`]; the client slot is the only shared
/// mutable state and is guarded by an async mutex, so two concurrent lazy
/// initializations can never construct two isolated contexts.
pub struct DiagramService {
    settings: Settings,
    launcher: Arc<dyn SandboxLauncher>,
    client: Mutex<Option<Arc<SandboxClient>>>,
}

impl DiagramService {
    /// Service backed by the sidecar-process binding from `settings`.
    pub fn new(settings: Settings) -> Self {
        let launcher = Arc::new(ProcessLauncher::from_settings(&settings.sandbox));
        Self::with_launcher(settings, launcher)
    }

    /// Service backed by a caller-provided sandbox binding.
    pub fn with_launcher(settings: Settings, launcher: Arc<dyn SandboxLauncher>) -> Self {
        Self {
            settings,
            launcher,
            client: Mutex::new(None),
        }
    }

    /// Replace the active client with a fresh one carrying `config`. Always
    /// replaces: calling this again after a theme switch tears down the
    /// previous sandbox (rejecting its pending requests) before the new
    /// client is installed, so stale requests can never resolve against a
    /// newer context.
    pub async fn initialize(&self, config: RendererConfig) {
        let client = Arc::new(SandboxClient::new(
            self.settings.sandbox.clone(),
            Arc::clone(&self.launcher),
            config,
        ));

        let mut slot = self.client.lock().await;
        if let Some(previous) = slot.take() {
            previous.destroy();
        }
        *slot = Some(client);
    }

    /// Render a diagram source string, lazily initializing with the default
    /// config when no client exists yet.
    pub async fn render(
        &self,
        id: &str,
        diagram_text: &str,
        options: &RenderOptions,
    ) -> Result<RenderResult, RenderError> {
        let client = self.ensure_client().await;
        client.render(id, diagram_text, options).await
    }

    /// Pass-through to the active client; fails when none exists.
    pub async fn update_config(&self, patch: RendererConfigPatch) -> Result<(), RenderError> {
        self.active_client().await?.update_config(patch).await
    }

    /// Pass-through to the active client; fails when none exists.
    pub async fn ping(&self) -> Result<Duration, RenderError> {
        self.active_client().await?.ping().await
    }

    /// Render, rasterize, and place the PNG on the system clipboard.
    pub async fn render_and_copy_png(
        &self,
        id: &str,
        diagram_text: &str,
        options: &RenderOptions,
    ) -> Result<(), ExportError> {
        let result = self.render(id, diagram_text, options).await?;

        let raster_options = RasterOptions::from_settings(&self.settings.raster)
            .with_dimensions(options.width, options.height);
        let raster = convert_svg_to_png(&result.svg, &raster_options).await?;

        copy_png_to_clipboard(&raster.data_url).await?;
        Ok(())
    }

    /// Tear down the client and clear the slot. Safe to call repeatedly.
    pub async fn destroy(&self) {
        if let Some(client) = self.client.lock().await.take() {
            client.destroy();
        }
    }

    async fn ensure_client(&self) -> Arc<SandboxClient> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Arc::clone(client);
        }

        let client = Arc::new(SandboxClient::new(
            self.settings.sandbox.clone(),
            Arc::clone(&self.launcher),
            RendererConfig::default(),
        ));
        *slot = Some(Arc::clone(&client));
        client
    }

    async fn active_client(&self) -> Result<Arc<SandboxClient>, RenderError> {
        self.client
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(RenderError::ChannelUnavailable)
    }
}

impl Drop for DiagramService {
    fn drop(&mut self) {
        // Pending requests are rejected before the owner disappears.
        if let Some(client) = self.client.get_mut().take() {
            client.destroy();
        }
    }
}
