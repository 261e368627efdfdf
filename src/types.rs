use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How the sandbox produced the vector markup: straight from the delegate
/// library, or recovered from the worker's document tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMethod {
    Direct,
    Dom,
}

/// Successful outcome of a render round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderResult {
    /// Vector markup emitted by the delegate rendering library.
    pub svg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<RenderMethod>,
}

/// Per-call knobs for `render`. `width`/`height` are forwarded to the
/// conversion pipeline by the combined export path; the render round-trip
/// itself only consumes `timeout`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Overrides the settings-level render timeout for this call.
    pub timeout: Option<Duration>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl RenderOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }
}

/// Rasterized export payload. Constructed per conversion call, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    /// `data:image/png;base64,` URL of the encoded pixels.
    pub data_url: String,
    /// Pixel dimensions of the surface the PNG was exported from (already
    /// scaled by the pixel-ratio multiplier).
    pub width: u32,
    pub height: u32,
}

/// Structured errors surfaced by the renderer client and manager. These map
/// cleanly to caller-facing failure reasons without leaking transport
/// internals; retry policy belongs to the layer that initiated the call.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("sandbox did not signal ready in time")]
    InitializationTimeout,
    #[error("failed to launch sandbox worker: {message}")]
    Launch { message: String },
    #[error("diagram rendering timed out")]
    RenderTimeout,
    #[error("diagram rendering failed: {message}")]
    RenderFailed { message: String },
    #[error("render channel unavailable")]
    ChannelUnavailable,
    #[error("config update failed: {message}")]
    ConfigUpdateFailed { message: String },
    #[error("ping timed out")]
    PingTimeout,
    #[error("renderer destroyed")]
    Destroyed,
}
