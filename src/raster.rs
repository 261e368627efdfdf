//! Deterministic SVG → PNG conversion.
//!
//! The delegate rendering library may omit explicit text styling that the
//! surrounding page would have supplied via inherited style, which is not
//! available in an isolated rasterization context. The pipeline therefore
//! normalizes every text-bearing element before parsing: missing
//! `font-family`, `font-size` and `fill` attributes get fixed defaults, and
//! the root element is stamped with the resolved pixel dimensions.

use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use lol_html::html_content::Element;
use lol_html::{RewriteStrSettings, element, rewrite_str};
use metrics::histogram;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

use crate::config::{
    DEFAULT_FONT_FAMILY, DEFAULT_FONT_SIZE, DEFAULT_TEXT_FILL, FALLBACK_RASTER_HEIGHT,
    FALLBACK_RASTER_WIDTH, MAX_RASTER_DIM, RasterSettings,
};
use crate::telemetry::METRIC_RASTER_MS;
use crate::types::RasterImage;

const SVG_NAMESPACE: &str = "http://www.w3.org/2000/svg";

static RASTER_FONTS: Lazy<Arc<usvg::fontdb::Database>> = Lazy::new(|| {
    let mut db = usvg::fontdb::Database::new();
    db.load_system_fonts();
    Arc::new(db)
});

#[derive(Debug, Clone, Error)]
pub enum RasterError {
    #[error("markup has no root svg element")]
    MissingRoot,
    #[error("failed to normalize markup: {message}")]
    Normalize { message: String },
    #[error("failed to parse markup: {message}")]
    InvalidMarkup { message: String },
    #[error("raster surface unavailable for {width}x{height}")]
    Surface { width: u32, height: u32 },
    #[error("raster size too large: {width}x{height} (max {max}x{max})")]
    TooLarge { width: u32, height: u32, max: u32 },
    #[error("failed to encode png: {message}")]
    Encode { message: String },
}

/// Per-call knobs for [`convert_svg_to_png`].
#[derive(Debug, Clone)]
pub struct RasterOptions {
    /// Explicit output width in CSS pixels; falls back to the markup's
    /// intrinsic view box, then to 800.
    pub width: Option<u32>,
    /// Explicit output height in CSS pixels; falls back to the markup's
    /// intrinsic view box, then to 600.
    pub height: Option<u32>,
    /// Device pixel density multiplier applied to the output surface.
    pub pixel_ratio: f32,
    /// Pause between normalization and capture. Some delegate backends shape
    /// text asynchronously relative to attribute mutation; a synchronous
    /// backend can run this at zero.
    pub settle_delay: Duration,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self::from_settings(&RasterSettings::default())
    }
}

impl RasterOptions {
    pub fn from_settings(settings: &RasterSettings) -> Self {
        Self {
            width: None,
            height: None,
            pixel_ratio: settings.pixel_ratio,
            settle_delay: settings.settle_delay,
        }
    }

    pub fn with_dimensions(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_pixel_ratio(mut self, pixel_ratio: f32) -> Self {
        self.pixel_ratio = pixel_ratio;
        self
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }
}

/// Rasterize vector markup to an opaque PNG, returned as a
/// `data:image/png;base64,` URL alongside the surface dimensions.
///
/// The output surface is the resolved CSS dimensions scaled by the pixel
/// ratio, filled opaque white before the draw so transparent markup never
/// produces a see-through export. Temporary surfaces are released on every
/// exit path.
pub async fn convert_svg_to_png(
    svg: &str,
    options: &RasterOptions,
) -> Result<RasterImage, RasterError> {
    let started_at = Instant::now();

    let normalized = normalize_markup(svg, options.width, options.height)?;

    if options.settle_delay > Duration::ZERO {
        tokio::time::sleep(options.settle_delay).await;
    }

    let surface_width = scale_dimension(normalized.width, options.pixel_ratio);
    let surface_height = scale_dimension(normalized.height, options.pixel_ratio);
    if surface_width > MAX_RASTER_DIM || surface_height > MAX_RASTER_DIM {
        return Err(RasterError::TooLarge {
            width: surface_width,
            height: surface_height,
            max: MAX_RASTER_DIM,
        });
    }

    let tree = {
        let usvg_options = usvg::Options {
            fontdb: Arc::clone(&RASTER_FONTS),
            font_family: "Arial".to_owned(),
            font_size: DEFAULT_FONT_SIZE,
            ..Default::default()
        };
        usvg::Tree::from_str(&normalized.svg, &usvg_options).map_err(|error| {
            RasterError::InvalidMarkup {
                message: error.to_string(),
            }
        })?
    };

    let mut pixmap = resvg::tiny_skia::Pixmap::new(surface_width, surface_height).ok_or(
        RasterError::Surface {
            width: surface_width,
            height: surface_height,
        },
    )?;
    pixmap.fill(resvg::tiny_skia::Color::WHITE);

    let scale_x = surface_width as f32 / tree.size().width();
    let scale_y = surface_height as f32 / tree.size().height();
    resvg::render(
        &tree,
        resvg::tiny_skia::Transform::from_scale(scale_x, scale_y),
        &mut pixmap.as_mut(),
    );

    let png = encode_png(&pixmap)?;
    let data_url = format!("data:image/png;base64,{}", BASE64.encode(&png));

    histogram!(METRIC_RASTER_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
    debug!(
        target = "disegno::raster",
        op = "convert_svg_to_png",
        width = surface_width,
        height = surface_height,
        elapsed_ms = started_at.elapsed().as_millis() as u64,
        png_bytes = png.len(),
        "markup rasterized"
    );

    Ok(RasterImage {
        data_url,
        width: surface_width,
        height: surface_height,
    })
}

/// Data URL for the raw vector markup (the non-rasterized export path).
pub fn svg_to_data_url(svg: &str) -> String {
    format!("data:image/svg+xml;base64,{}", BASE64.encode(svg.as_bytes()))
}

#[derive(Debug)]
struct NormalizedMarkup {
    svg: String,
    width: u32,
    height: u32,
}

/// Normalize the markup in a single streaming pass: resolve the output
/// dimensions from the root element, stamp it with `width`/`height` and the
/// SVG namespace, and inject text-styling defaults where absent. Markup with
/// no root svg element is rejected before any surface exists.
fn normalize_markup(
    svg: &str,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<NormalizedMarkup, RasterError> {
    let dimensions = Rc::new(RefCell::new(None::<(u32, u32)>));

    let rewritten = rewrite_str(
        svg,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!("svg", {
                    let dimensions = Rc::clone(&dimensions);
                    move |el| {
                        // Nested svg elements keep the root's dimensions.
                        if dimensions.borrow().is_some() {
                            return Ok(());
                        }
                        let resolved = resolve_dimensions(el, width, height);
                        el.set_attribute("width", &resolved.0.to_string())?;
                        el.set_attribute("height", &resolved.1.to_string())?;
                        el.set_attribute("xmlns", SVG_NAMESPACE)?;
                        *dimensions.borrow_mut() = Some(resolved);
                        Ok(())
                    }
                }),
                element!("text, tspan", |el| {
                    if el.get_attribute("font-family").is_none() {
                        el.set_attribute("font-family", DEFAULT_FONT_FAMILY)?;
                    }
                    if el.get_attribute("font-size").is_none() {
                        el.set_attribute("font-size", &DEFAULT_FONT_SIZE.to_string())?;
                    }
                    if el.get_attribute("fill").is_none() {
                        el.set_attribute("fill", DEFAULT_TEXT_FILL)?;
                    }
                    Ok(())
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )
    .map_err(|error| RasterError::Normalize {
        message: error.to_string(),
    })?;

    let Some((width, height)) = *dimensions.borrow() else {
        return Err(RasterError::MissingRoot);
    };

    Ok(NormalizedMarkup {
        svg: rewritten,
        width,
        height,
    })
}

/// Output dimensions: explicit caller values win, then the view box extent,
/// then existing width/height attributes, then 800×600.
fn resolve_dimensions(el: &Element<'_, '_>, width: Option<u32>, height: Option<u32>) -> (u32, u32) {
    if let (Some(width), Some(height)) = (width, height) {
        return (width, height);
    }

    let (fallback_width, fallback_height) = match el
        .get_attribute("viewBox")
        .and_then(|value| parse_view_box(&value))
    {
        Some(extent) => extent,
        None => (
            parse_length(el.get_attribute("width")).unwrap_or(FALLBACK_RASTER_WIDTH),
            parse_length(el.get_attribute("height")).unwrap_or(FALLBACK_RASTER_HEIGHT),
        ),
    };

    (
        width.unwrap_or(fallback_width),
        height.unwrap_or(fallback_height),
    )
}

fn parse_view_box(value: &str) -> Option<(u32, u32)> {
    let mut parts = value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty());
    let _min_x = parts.next()?;
    let _min_y = parts.next()?;
    let width = parts.next().and_then(positive_pixels);
    let height = parts.next().and_then(positive_pixels);

    // A zero or malformed extent falls back per axis, matching the
    // dimension defaults used everywhere else.
    Some((
        width.unwrap_or(FALLBACK_RASTER_WIDTH),
        height.unwrap_or(FALLBACK_RASTER_HEIGHT),
    ))
}

fn parse_length(value: Option<String>) -> Option<u32> {
    positive_pixels(value?.trim().trim_end_matches("px"))
}

fn positive_pixels(raw: &str) -> Option<u32> {
    let parsed: f32 = raw.trim().parse().ok()?;
    (parsed.is_finite() && parsed > 0.0).then(|| parsed.round() as u32)
}

fn scale_dimension(dimension: u32, pixel_ratio: f32) -> u32 {
    ((dimension as f32) * pixel_ratio).ceil().max(1.0) as u32
}

fn encode_png(pixmap: &resvg::tiny_skia::Pixmap) -> Result<Vec<u8>, RasterError> {
    let mut rgba = Vec::with_capacity(pixmap.data().len());
    for pixel in pixmap.pixels() {
        let color = pixel.demultiply();
        rgba.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
    }

    let image = image::RgbaImage::from_raw(pixmap.width(), pixmap.height(), rgba).ok_or_else(
        || RasterError::Encode {
            message: "surface dimensions disagree with pixel data".to_owned(),
        },
    )?;

    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, image::ImageFormat::Png)
        .map_err(|error| RasterError::Encode {
            message: error.to_string(),
        })?;
    Ok(png.into_inner())
}
