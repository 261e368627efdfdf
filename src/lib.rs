//! Sandboxed diagram rendering for collaborative editors.
//!
//! The delegate diagram-rendering library runs in an isolated execution
//! context — a sidecar process or an in-process worker — reachable only over
//! an asynchronous message channel. This crate provides the host side of
//! that arrangement:
//!
//! - [`DiagramService`]: the entry point the embedding application owns.
//!   Lazily boots the sandbox, serializes (re)initialization, and delegates
//!   render, config-update and health-check traffic.
//! - [`SandboxClient`]: the protocol engine. Correlates out-of-order
//!   responses to callers, enforces per-call timeouts, and rejects
//!   everything outstanding on teardown.
//! - [`convert_svg_to_png`]: deterministic rasterization of the produced
//!   vector markup to an opaque PNG data URL, with text-styling
//!   normalization for markup rendered outside a styled page.
//! - [`copy_png_to_clipboard`]: clipboard delivery with a single normalized
//!   failure kind.
//!
//! # Example
//!
//! ```ignore
//! use disegno::{DiagramService, RenderOptions, Settings, convert_svg_to_png};
//!
//! let service = DiagramService::new(Settings::default());
//! let result = service
//!     .render("d1", "graph TD; A-->B", &RenderOptions::default())
//!     .await?;
//! let raster = convert_svg_to_png(&result.svg, &Default::default()).await?;
//! disegno::copy_png_to_clipboard(&raster.data_url).await?;
//! ```

pub mod client;
pub mod clipboard;
pub mod config;
pub mod manager;
pub mod protocol;
pub mod raster;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use client::SandboxClient;
pub use clipboard::{ClipboardError, copy_png_to_clipboard};
pub use config::{
    LoggingSettings, RasterSettings, RendererConfig, RendererConfigPatch, SandboxSettings,
    SecurityLevel, Settings,
};
pub use manager::{DiagramService, ExportError};
pub use raster::{RasterError, RasterOptions, convert_svg_to_png, svg_to_data_url};
pub use transport::{
    ChannelLauncher, ProcessLauncher, SandboxEndpoint, SandboxLauncher, SandboxTransport,
};
pub use types::{RasterImage, RenderError, RenderMethod, RenderOptions, RenderResult};
