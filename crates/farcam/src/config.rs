//! Recording and still-capture configuration
//!
//! Settings load from an optional JSON file and are then overridden by
//! `FARCAM_*` environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::capture::image_buffer_size;
use crate::raw::RawFormat;
use crate::ring::DEFAULT_KEYFRAME_INDEX_CAPACITY;
use crate::segment::SegmentConfig;
use crate::sink::SinkResolver;

/// How often driver loops check the abort flag
pub const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Raw side-output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub destination: Option<String>,
    pub format: RawFormat,
    pub width: u32,
    pub height: u32,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            destination: None,
            format: RawFormat::Yuv,
            width: 1920,
            height: 1080,
        }
    }
}

/// Video recording settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Primary destination (file, pattern, `-`, `tcp://` or `udp://`)
    pub destination: Option<String>,
    /// Motion-vector (side info) destination
    pub side_info_destination: Option<String>,
    /// Presentation timestamp destination
    pub timestamps_destination: Option<String>,
    pub raw: RawConfig,
    /// Keep output in memory and write it out on stop
    pub circular: bool,
    /// Circular buffer size in bytes
    pub circular_capacity: usize,
    pub keyframe_index_capacity: usize,
    /// Segment length in milliseconds (0 = one segment)
    pub segment_ms: u64,
    pub segment_wrap: u32,
    pub segment_start: u32,
    /// Rotate only when a split is requested
    pub split_wait: bool,
    /// TCP destinations wait for a client instead of connecting
    pub listen: bool,
    /// Flush the sink after every write
    pub flush_buffers: bool,
    /// Recording length in milliseconds (0 = until stopped)
    pub timeout_ms: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            destination: None,
            side_info_destination: None,
            timestamps_destination: None,
            raw: RawConfig::default(),
            circular: false,
            circular_capacity: 0,
            keyframe_index_capacity: DEFAULT_KEYFRAME_INDEX_CAPACITY,
            segment_ms: 0,
            segment_wrap: 0,
            segment_start: 1,
            split_wait: false,
            listen: false,
            flush_buffers: false,
            timeout_ms: 5000,
        }
    }
}

impl RecordingConfig {
    pub fn segment(&self) -> SegmentConfig {
        SegmentConfig {
            segment_size: Duration::from_millis(self.segment_ms),
            segment_wrap: self.segment_wrap,
            initial_segment: self.segment_start,
            split_wait: self.split_wait,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Sink resolver matching these settings
    pub fn resolver(&self) -> SinkResolver {
        SinkResolver::new(self.listen, self.segment().is_segmenting())
    }
}

/// Still-capture settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Destination buffer size in bytes
    pub buffer_capacity: usize,
    /// Settle time before the driver threads start, in milliseconds
    pub settle_ms: u64,
    /// Delay before each capture, in milliseconds
    pub pre_capture_delay_ms: u64,
    /// Number of stills to take (0 disables the photo driver)
    pub count: u32,
    /// Where to save each still; `%d` is replaced with its number
    pub output: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: image_buffer_size(1920, 1080),
            settle_ms: 3000,
            pre_capture_delay_ms: 2000,
            count: 2,
            output: None,
        }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recording: RecordingConfig,
    pub capture: CaptureConfig,
}

impl Config {
    /// Parse a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Load from `FARCAM_CONFIG` (if set) and apply environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("FARCAM_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `FARCAM_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rec = &mut self.recording;

        if let Some(v) = lookup("FARCAM_OUTPUT") {
            rec.destination = Some(v);
        }
        if let Some(v) = lookup("FARCAM_IMV_OUTPUT") {
            rec.side_info_destination = Some(v);
        }
        if let Some(v) = lookup("FARCAM_PTS_OUTPUT") {
            rec.timestamps_destination = Some(v);
        }
        if let Some(v) = lookup("FARCAM_RAW_OUTPUT") {
            rec.raw.destination = Some(v);
        }
        if let Some(v) = lookup("FARCAM_RAW_FORMAT") {
            rec.raw.format = serde_json::from_value(serde_json::Value::String(v.clone()))
                .with_context(|| format!("invalid FARCAM_RAW_FORMAT {:?}", v))?;
        }

        parse_into(&lookup, "FARCAM_CIRCULAR", &mut rec.circular)?;
        parse_into(&lookup, "FARCAM_CIRCULAR_CAPACITY", &mut rec.circular_capacity)?;
        parse_into(&lookup, "FARCAM_SEGMENT_MS", &mut rec.segment_ms)?;
        parse_into(&lookup, "FARCAM_SEGMENT_WRAP", &mut rec.segment_wrap)?;
        parse_into(&lookup, "FARCAM_SEGMENT_START", &mut rec.segment_start)?;
        parse_into(&lookup, "FARCAM_SPLIT_WAIT", &mut rec.split_wait)?;
        parse_into(&lookup, "FARCAM_LISTEN", &mut rec.listen)?;
        parse_into(&lookup, "FARCAM_FLUSH", &mut rec.flush_buffers)?;
        parse_into(&lookup, "FARCAM_TIMEOUT_MS", &mut rec.timeout_ms)?;

        let cap = &mut self.capture;
        parse_into(&lookup, "FARCAM_STILL_COUNT", &mut cap.count)?;
        parse_into(&lookup, "FARCAM_STILL_BUFFER", &mut cap.buffer_capacity)?;
        parse_into(&lookup, "FARCAM_SETTLE_MS", &mut cap.settle_ms)?;
        if let Some(v) = lookup("FARCAM_STILL_OUTPUT") {
            cap.output = Some(v);
        }

        debug!("Configuration after overrides: {:?}", self);
        Ok(())
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = lookup(key) {
        *slot = value
            .trim()
            .parse()
            .with_context(|| format!("invalid value {:?} for {}", value, key))?;
    }
    Ok(())
}
