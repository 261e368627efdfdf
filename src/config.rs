//! Service configuration: the appearance/security options handed to the
//! sandbox, and the deployment settings (worker command, timeouts, raster
//! tuning, logging) resolved from file and environment sources.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "disegno";
const LOCAL_CONFIG_BASENAME: &str = "disegno.local";

pub(crate) const DEFAULT_SANDBOX_PROGRAM: &str = "diagram-sandbox-worker";

/// Default wait for a render round-trip.
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(10);
/// Default wait for the sandbox's `ready` signal during initialization.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);
/// Default wait for config-update and ping round-trips.
pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Default pause between markup normalization and the raster capture.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(200);

pub(crate) const FALLBACK_RASTER_WIDTH: u32 = 800;
pub(crate) const FALLBACK_RASTER_HEIGHT: u32 = 600;
pub(crate) const DEFAULT_FONT_FAMILY: &str = "Arial, sans-serif";
pub(crate) const DEFAULT_FONT_SIZE: f32 = 14.0;
pub(crate) const DEFAULT_TEXT_FILL: &str = "black";
pub(crate) const MAX_RASTER_DIM: u32 = 16_384;

/// Appearance and security options passed to the isolated context at launch
/// and patched afterwards via `config-update` round-trips. Serialized onto
/// the wire as-is, so field names follow the delegate library's casing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RendererConfig {
    pub theme: String,
    pub log_level: u8,
    pub security_level: SecurityLevel,
    pub start_on_load: bool,
    pub flowchart: FlowchartConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            theme: "default".to_owned(),
            log_level: 5,
            security_level: SecurityLevel::Loose,
            start_on_load: false,
            flowchart: FlowchartConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Strict,
    Loose,
    Antiscript,
    Sandbox,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowchartConfig {
    pub html_labels: bool,
    pub curve: String,
}

impl Default for FlowchartConfig {
    fn default() -> Self {
        Self {
            html_labels: true,
            curve: "basis".to_owned(),
        }
    }
}

/// Partial overlay applied on top of an active [`RendererConfig`]. Only the
/// provided fields travel on the wire; the client replaces its in-memory
/// copy with the merged result once the sandbox acknowledges the update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RendererConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_on_load: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flowchart: Option<FlowchartConfig>,
}

impl RendererConfigPatch {
    pub fn theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    pub fn security_level(mut self, level: SecurityLevel) -> Self {
        self.security_level = Some(level);
        self
    }

    /// Merge the patch over `base`, yielding the config snapshot the client
    /// stores after a confirmed update.
    pub fn apply_to(&self, base: &RendererConfig) -> RendererConfig {
        RendererConfig {
            theme: self.theme.clone().unwrap_or_else(|| base.theme.clone()),
            log_level: self.log_level.unwrap_or(base.log_level),
            security_level: self.security_level.unwrap_or(base.security_level),
            start_on_load: self.start_on_load.unwrap_or(base.start_on_load),
            flowchart: self.flowchart.clone().unwrap_or_else(|| base.flowchart.clone()),
        }
    }
}

/// Fully-resolved service settings after precedence resolution and validation.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub sandbox: SandboxSettings,
    pub raster: RasterSettings,
    pub logging: LoggingSettings,
}

/// The worker command and the protocol engine's round-trip timeouts.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub ready_timeout: Duration,
    pub render_timeout: Duration,
    pub control_timeout: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_SANDBOX_PROGRAM),
            args: Vec::new(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RasterSettings {
    /// Pause before the raster capture; tunable because some delegate
    /// backends shape text asynchronously relative to attribute mutation.
    pub settle_delay: Duration,
    /// Device pixel density multiplier applied to the output surface.
    pub pixel_ratio: f32,
}

impl Default for RasterSettings {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            pixel_ratio: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → local file →
/// environment under the `DISEGNO` prefix).
pub fn load() -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false))
        .add_source(Environment::with_prefix("DISEGNO").separator("__"))
        .build()?
        .try_deserialize()?;

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    sandbox: RawSandboxSettings,
    raster: RawRasterSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSandboxSettings {
    program: Option<PathBuf>,
    args: Vec<String>,
    ready_timeout_ms: Option<u64>,
    render_timeout_ms: Option<u64>,
    control_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRasterSettings {
    settle_delay_ms: Option<u64>,
    pixel_ratio: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<LogLevel>,
    format: Option<LogFormat>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let defaults = SandboxSettings::default();

        let program = raw.sandbox.program.unwrap_or(defaults.program);
        if program.as_os_str().is_empty() {
            return Err(LoadError::invalid(
                "sandbox.program",
                "worker command must not be empty",
            ));
        }

        let sandbox = SandboxSettings {
            program,
            args: raw.sandbox.args,
            ready_timeout: positive_duration(
                "sandbox.ready_timeout_ms",
                raw.sandbox.ready_timeout_ms,
                defaults.ready_timeout,
            )?,
            render_timeout: positive_duration(
                "sandbox.render_timeout_ms",
                raw.sandbox.render_timeout_ms,
                defaults.render_timeout,
            )?,
            control_timeout: positive_duration(
                "sandbox.control_timeout_ms",
                raw.sandbox.control_timeout_ms,
                defaults.control_timeout,
            )?,
        };

        let raster_defaults = RasterSettings::default();
        let pixel_ratio = raw.raster.pixel_ratio.unwrap_or(raster_defaults.pixel_ratio);
        if !pixel_ratio.is_finite() || pixel_ratio <= 0.0 {
            return Err(LoadError::invalid(
                "raster.pixel_ratio",
                format!("must be a positive finite number, got {pixel_ratio}"),
            ));
        }

        let raster = RasterSettings {
            settle_delay: raw
                .raster
                .settle_delay_ms
                .map_or(raster_defaults.settle_delay, Duration::from_millis),
            pixel_ratio,
        };

        let logging_defaults = LoggingSettings::default();
        let logging = LoggingSettings {
            level: raw
                .logging
                .level
                .map_or(logging_defaults.level, LevelFilter::from),
            format: raw.logging.format.unwrap_or(logging_defaults.format),
        };

        Ok(Self {
            sandbox,
            raster,
            logging,
        })
    }
}

fn positive_duration(
    key: &'static str,
    raw: Option<u64>,
    default: Duration,
) -> Result<Duration, LoadError> {
    match raw {
        None => Ok(default),
        Some(0) => Err(LoadError::invalid(key, "must be greater than zero")),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_delegate_defaults() {
        let config = RendererConfig::default();
        assert_eq!(config.theme, "default");
        assert_eq!(config.log_level, 5);
        assert_eq!(config.security_level, SecurityLevel::Loose);
        assert!(!config.start_on_load);
        assert!(config.flowchart.html_labels);
        assert_eq!(config.flowchart.curve, "basis");
    }

    #[test]
    fn empty_patch_is_identity() {
        let base = RendererConfig::default();
        assert_eq!(RendererConfigPatch::default().apply_to(&base), base);
    }

    #[test]
    fn patch_overrides_only_provided_fields() {
        let base = RendererConfig::default();
        let patch = RendererConfigPatch::default()
            .theme("dark")
            .security_level(SecurityLevel::Strict);

        let merged = patch.apply_to(&base);

        assert_eq!(merged.theme, "dark");
        assert_eq!(merged.security_level, SecurityLevel::Strict);
        assert_eq!(merged.log_level, base.log_level);
        assert_eq!(merged.flowchart, base.flowchart);
    }

    #[test]
    fn from_raw_applies_defaults() {
        let settings = Settings::from_raw(RawSettings::default()).expect("defaults are valid");
        assert_eq!(settings.sandbox.program, PathBuf::from(DEFAULT_SANDBOX_PROGRAM));
        assert_eq!(settings.sandbox.render_timeout, DEFAULT_RENDER_TIMEOUT);
        assert_eq!(settings.sandbox.ready_timeout, DEFAULT_READY_TIMEOUT);
        assert_eq!(settings.raster.settle_delay, DEFAULT_SETTLE_DELAY);
        assert_eq!(settings.raster.pixel_ratio, 1.0);
    }

    #[test]
    fn from_raw_rejects_zero_timeout() {
        let raw = RawSettings {
            sandbox: RawSandboxSettings {
                render_timeout_ms: Some(0),
                ..RawSandboxSettings::default()
            },
            ..RawSettings::default()
        };

        let error = Settings::from_raw(raw).expect_err("zero timeout must be rejected");
        assert!(matches!(
            error,
            LoadError::Invalid {
                key: "sandbox.render_timeout_ms",
                ..
            }
        ));
    }

    #[test]
    fn from_raw_rejects_empty_program() {
        let raw = RawSettings {
            sandbox: RawSandboxSettings {
                program: Some(PathBuf::new()),
                ..RawSandboxSettings::default()
            },
            ..RawSettings::default()
        };

        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn from_raw_rejects_non_positive_pixel_ratio() {
        let raw = RawSettings {
            raster: RawRasterSettings {
                pixel_ratio: Some(0.0),
                ..RawRasterSettings::default()
            },
            ..RawSettings::default()
        };

        assert!(Settings::from_raw(raw).is_err());
    }
}
