//! Streamer configuration using Figment.
//!
//! Values are resolved in increasing priority from:
//! 1. built-in defaults ([`StreamerConfig::default`])
//! 2. an optional TOML file
//! 3. environment variables prefixed with `PILATUS_` (`__` separates nested keys)
//!
//! The CLI applies its flags on top of the extracted value and then calls
//! [`StreamerConfig::validate`].
//!
//! # Example
//! ```no_run
//! use pilatus_core::config::StreamerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamerConfig::load(Some("pilatus.toml".as_ref()))?;
//! config.validate()?;
//! println!("watching {}", config.watch_folder.display());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::compression;
use crate::error::{StreamError, StreamResult};
use crate::ELEMENT_SIZE;

/// On-disk format written by the detector, chosen once per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// Uncompressed tag-table images
    Tif,
    /// ASCII-header images with a compressed binary section
    #[default]
    Cbf,
}

impl SourceFormat {
    /// File extension used for detector filenames (`scan<N>.<ext>`).
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            SourceFormat::Tif => "tif",
            SourceFormat::Cbf => "cbf",
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for SourceFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tif" | "tiff" => Ok(SourceFormat::Tif),
            "cbf" => Ok(SourceFormat::Cbf),
            other => Err(StreamError::Configuration(format!(
                "unknown source format '{other}' (expected tif or cbf)"
            ))),
        }
    }
}

/// Detector model, which fixes the image shape and therefore buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DetectorSize {
    /// 487 x 195 pixels
    Pilatus100k,
    /// 981 x 1043 pixels
    Pilatus1M,
    /// 1475 x 1679 pixels
    #[default]
    Pilatus2M,
}

impl DetectorSize {
    /// `(width, height)` in pixels.
    #[must_use]
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            DetectorSize::Pilatus100k => (487, 195),
            DetectorSize::Pilatus1M => (981, 1043),
            DetectorSize::Pilatus2M => (1475, 1679),
        }
    }

    /// Total pixel count.
    #[must_use]
    pub fn pixels(self) -> usize {
        let (width, height) = self.dimensions();
        width as usize * height as usize
    }
}

impl FromStr for DetectorSize {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.trim_start_matches("pilatus") {
            "100k" => Ok(DetectorSize::Pilatus100k),
            "1m" => Ok(DetectorSize::Pilatus1M),
            "2m" => Ok(DetectorSize::Pilatus2M),
            _ => Err(StreamError::Configuration(format!(
                "unknown detector size '{s}' (expected 100k, 1m or 2m)"
            ))),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(StreamError::Configuration(format!(
                "unknown log format '{other}' (expected pretty, compact or json)"
            ))),
        }
    }
}

/// Fully resolved streamer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Folder the detector writes finished images into
    pub watch_folder: PathBuf,
    /// Image file format
    #[serde(default)]
    pub format: SourceFormat,
    /// Detector model
    #[serde(default)]
    pub detector: DetectorSize,
    /// Apply the LZ4 block transform to uncompressed payloads
    #[serde(default)]
    pub compression: bool,
    /// Number of pooled frame buffers
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Extra bytes per buffer for CBF header text
    #[serde(default = "default_header_overhead")]
    pub header_overhead: usize,
    /// Detector control server address
    #[serde(default = "default_control_addr")]
    pub control_addr: String,
    /// Address the control-relay client connects to
    #[serde(default = "default_client_listen_addr")]
    pub client_listen_addr: String,
    /// Frame publish address
    #[serde(default = "default_publish_addr")]
    pub publish_addr: String,
    /// Monitor request/reply address
    #[serde(default = "default_monitor_addr")]
    pub monitor_addr: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Logging output format
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_pool_size() -> usize {
    100
}

fn default_header_overhead() -> usize {
    128_000
}

fn default_control_addr() -> String {
    "127.0.0.1:41234".to_string()
}

fn default_client_listen_addr() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_publish_addr() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_monitor_addr() -> String {
    "0.0.0.0:9998".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            watch_folder: PathBuf::new(),
            format: SourceFormat::default(),
            detector: DetectorSize::default(),
            compression: false,
            pool_size: default_pool_size(),
            header_overhead: default_header_overhead(),
            control_addr: default_control_addr(),
            client_listen_addr: default_client_listen_addr(),
            publish_addr: default_publish_addr(),
            monitor_addr: default_monitor_addr(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl StreamerConfig {
    /// Load defaults, then the optional TOML file, then `PILATUS_` variables.
    pub fn load(path: Option<&Path>) -> StreamResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            // Toml::file treats a missing file as empty
            if !path.is_file() {
                return Err(StreamError::Configuration(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config = figment
            .merge(Env::prefixed("PILATUS_").split("__"))
            .extract::<Self>()?;
        debug!(
            file = ?path,
            watch_folder = %config.watch_folder.display(),
            pool_size = config.pool_size,
            "Loaded streamer configuration"
        );
        Ok(config)
    }

    /// Validate configuration after loading and CLI overrides.
    pub fn validate(&self) -> StreamResult<()> {
        if self.watch_folder.as_os_str().is_empty() {
            return Err(StreamError::Configuration(
                "watch_folder must be set".to_string(),
            ));
        }

        // The latest image stays checked out for the monitor while the next
        // frame is read, plus one more buffer for its LZ4 copy.
        let min_pool = self.min_pool_size();
        if self.pool_size < min_pool {
            return Err(StreamError::Configuration(format!(
                "pool_size must be at least {min_pool} (compression: {})",
                self.compression
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(StreamError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let listeners = [
            ("client_listen_addr", &self.client_listen_addr),
            ("publish_addr", &self.publish_addr),
            ("monitor_addr", &self.monitor_addr),
        ];
        for (i, (name_a, addr_a)) in listeners.iter().enumerate() {
            for (name_b, addr_b) in &listeners[i + 1..] {
                if addr_a == addr_b {
                    return Err(StreamError::Configuration(format!(
                        "{name_a} and {name_b} both use {addr_a}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Smallest pool that can keep publishing frames.
    #[must_use]
    pub fn min_pool_size(&self) -> usize {
        if self.compression {
            3
        } else {
            2
        }
    }

    /// Bytes of raw pixel data in one frame.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        self.detector.pixels() * ELEMENT_SIZE
    }

    /// Size of every pooled buffer.
    ///
    /// Large enough for the raw frame plus CBF header text, and for the worst
    /// case LZ4 output when compression is enabled.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        let raw = self.frame_bytes() + self.header_overhead;
        if self.compression {
            raw.max(compression::max_compressed_len(self.frame_bytes()))
        } else {
            raw
        }
    }
}
