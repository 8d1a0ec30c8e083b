//! Segment rotation
//!
//! A recording can be split into consecutive segments, either every
//! `segment_size` or on an external split request. A new segment may only
//! begin on a codec header chunk: a segment that does not start with its
//! own SPS/PPS cannot be decoded from byte zero.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chunk::ChunkFlags;
use crate::control::{AbortFlag, SplitFlag};
use crate::sink::{write_counted, SinkHandle, SinkOpener, STDOUT_DESTINATION};

/// Rotation parameters
#[derive(Debug, Clone, Default)]
pub struct SegmentConfig {
    /// Length of each segment (zero disables time-based rotation)
    pub segment_size: Duration,
    /// Wrap the segment number back to 1 past this value (0 = never)
    pub segment_wrap: u32,
    /// First segment number
    pub initial_segment: u32,
    /// Split only on request (`split_now`) rather than on time
    pub split_wait: bool,
}

impl SegmentConfig {
    /// Whether destinations are expanded per segment at all
    pub fn is_segmenting(&self) -> bool {
        !self.segment_size.is_zero() || self.split_wait
    }
}

/// Rotation bookkeeping.
#[derive(Debug)]
pub struct SegmentState {
    /// Current segment number, 1-based
    pub number: u32,
    /// Instant the current segment started (set by the first callback)
    pub base_time: Option<Instant>,
    /// External one-shot split request
    pub split: SplitFlag,
}

/// Decides when the next header chunk starts a new segment.
#[derive(Debug)]
pub struct SegmentRotation {
    config: SegmentConfig,
    state: SegmentState,
}

impl SegmentRotation {
    pub fn new(config: SegmentConfig, split: SplitFlag) -> Self {
        let number = config.initial_segment.max(1);
        Self {
            config,
            state: SegmentState {
                number,
                base_time: None,
                split,
            },
        }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn segment_number(&self) -> u32 {
        self.state.number
    }

    /// Segment timing starts at the first delivered chunk
    pub fn start_clock(&mut self, now: Instant) {
        self.state.base_time.get_or_insert(now);
    }

    /// Should the chunk with `flags` open a new segment before being written?
    pub fn should_rotate(&self, flags: ChunkFlags, now: Instant) -> bool {
        if !flags.is_config() || !self.config.is_segmenting() {
            return false;
        }

        let elapsed = !self.config.segment_size.is_zero()
            && self
                .state
                .base_time
                .is_some_and(|base| now >= base + self.config.segment_size);

        elapsed || self.state.split.is_requested()
    }

    /// Advance to the next segment. Returns the new segment number.
    pub fn rotate(&mut self, now: Instant) -> u32 {
        self.state.base_time = Some(now);
        self.state.split.take();

        self.state.number += 1;
        if self.config.segment_wrap > 0 && self.state.number > self.config.segment_wrap {
            self.state.number = 1;
        }

        info!("Starting segment {}", self.state.number);
        self.state.number
    }
}

/// One configured output (primary, side-info or timestamps) and the sink
/// of its current segment.
pub struct OutputStream {
    label: &'static str,
    destination: Option<String>,
    sink: Option<SinkHandle>,
    failed: bool,
    bytes_written: u64,
}

impl OutputStream {
    pub fn new(label: &'static str, destination: Option<String>) -> Self {
        Self {
            label,
            destination,
            sink: None,
            failed: false,
            bytes_written: 0,
        }
    }

    /// A stream with an already open sink
    pub fn with_sink(label: &'static str, destination: Option<String>, sink: SinkHandle) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(label, destination)
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Open the sink for `segment_number`. Returns whether a sink is open.
    pub fn open(&mut self, opener: &dyn SinkOpener, segment_number: u32) -> Result<bool> {
        let Some(destination) = self.destination.as_deref() else {
            return Ok(false);
        };
        if let Some(sink) = opener.open(destination, segment_number)? {
            self.sink = Some(sink);
        }
        Ok(self.sink.is_some())
    }

    /// Has an open sink and has not failed
    pub fn is_active(&self) -> bool {
        self.sink.is_some() && !self.failed
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether rotation reopens this stream
    pub fn is_rotatable(&self) -> bool {
        matches!(self.destination.as_deref(), Some(d) if !d.starts_with(STDOUT_DESTINATION))
    }

    /// Write `data` once. A short write fails the stream and raises `abort`;
    /// a failed stream is never written again.
    pub fn write(&mut self, data: &[u8], abort: &AbortFlag, sync: bool) -> usize {
        if self.failed {
            return 0;
        }
        let Some(sink) = self.sink.as_mut() else {
            return 0;
        };

        let written = write_counted(sink.as_mut(), data);
        self.bytes_written += written as u64;

        if written != data.len() {
            self.failed = true;
            abort.raise(&format!(
                "failed to write {} data ({} from {})",
                self.label,
                written,
                data.len()
            ));
            return written;
        }

        if sync {
            if let Err(e) = sink.sync() {
                warn!("Failed to flush {} output: {}", self.label, e);
            }
        }
        written
    }

    /// Open the next segment and swap it in. On failure the current sink
    /// stays active and recording continues into it.
    pub fn reopen(&mut self, opener: &dyn SinkOpener, segment_number: u32) {
        if !self.is_rotatable() {
            return;
        }
        let destination = self.destination.as_deref().unwrap_or_default();
        match opener.open(destination, segment_number) {
            Ok(Some(sink)) => {
                if let Some(mut old) = self.sink.replace(sink) {
                    if let Err(e) = old.flush() {
                        warn!("Error closing previous {} segment: {}", self.label, e);
                    }
                }
                debug!("{} output now at segment {}", self.label, segment_number);
            }
            Ok(None) => warn!(
                "Could not open segment {} for {} output, continuing in current segment",
                segment_number, self.label
            ),
            Err(e) => warn!(
                "Invalid destination for {} output segment {}: {:#}",
                self.label, segment_number, e
            ),
        }
    }

    /// Flush and drop the sink
    pub fn close(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.flush() {
                warn!("Error closing {} output: {}", self.label, e);
            }
        }
    }

    /// Direct access for one-off writes such as a circular-buffer dump
    pub fn sink_mut(&mut self) -> Option<&mut SinkHandle> {
        if self.failed {
            return None;
        }
        self.sink.as_mut()
    }
}
