//! Clipboard delivery for exported diagrams.

use std::borrow::Cow;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use metrics::counter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::telemetry::{METRIC_CLIPBOARD_FAILURE_TOTAL, METRIC_CLIPBOARD_WRITE_TOTAL};

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Every clipboard failure — malformed payload, decode failure, platform
/// rejection — collapses into this one kind; callers are expected to offer a
/// textual fallback (copying the raw diagram source) when it surfaces.
#[derive(Debug, Clone, Error)]
pub enum ClipboardError {
    #[error("clipboard write failed: {message}")]
    WriteFailed { message: String },
}

impl ClipboardError {
    fn write_failed(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }
}

/// Place a PNG payload on the system clipboard.
///
/// The payload is validated and decoded before the platform clipboard is
/// touched; the blocking platform call runs off the async runtime.
pub async fn copy_png_to_clipboard(data_url: &str) -> Result<(), ClipboardError> {
    let outcome = write_image(data_url).await;

    match &outcome {
        Ok(()) => {
            counter!(METRIC_CLIPBOARD_WRITE_TOTAL).increment(1);
            debug!(
                target = "disegno::clipboard",
                op = "copy_png_to_clipboard",
                result = "ok",
                "png placed on clipboard"
            );
        }
        Err(error) => {
            counter!(METRIC_CLIPBOARD_FAILURE_TOTAL).increment(1);
            warn!(
                target = "disegno::clipboard",
                op = "copy_png_to_clipboard",
                result = "error",
                error = %error,
                "clipboard write failed"
            );
        }
    }

    outcome
}

async fn write_image(data_url: &str) -> Result<(), ClipboardError> {
    let encoded = data_url
        .strip_prefix(PNG_DATA_URL_PREFIX)
        .ok_or_else(|| ClipboardError::write_failed("payload is not a png data url"))?;

    let bytes = BASE64
        .decode(encoded)
        .map_err(|error| ClipboardError::write_failed(format!("payload is not valid base64: {error}")))?;

    let image = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)
        .map_err(|error| ClipboardError::write_failed(format!("payload is not a decodable png: {error}")))?
        .to_rgba8();
    let (width, height) = image.dimensions();
    let pixels = image.into_raw();

    tokio::task::spawn_blocking(move || {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|error| ClipboardError::write_failed(error.to_string()))?;
        clipboard
            .set_image(arboard::ImageData {
                width: width as usize,
                height: height as usize,
                bytes: Cow::Owned(pixels),
            })
            .map_err(|error| ClipboardError::write_failed(error.to_string()))
    })
    .await
    .map_err(|error| ClipboardError::write_failed(format!("clipboard task failed: {error}")))?
}
