//! Uncompressed side output
//!
//! Frames from the splitter port are written as-is, or trimmed to the luma
//! plane when a grayscale stream is requested.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::trace;

use crate::chunk::Chunk;
use crate::control::AbortFlag;
use crate::port::{recycle, ChunkHandler};
use crate::segment::OutputStream;

/// Pixel layout of the raw output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RawFormat {
    /// Planar YUV 4:2:0, written whole
    #[default]
    Yuv,
    /// Packed RGB, written whole
    Rgb,
    /// Y plane of a YUV 4:2:0 frame only
    Gray,
}

/// Writes raw frames to their own stream.
pub struct RawOutput {
    format: RawFormat,
    width: u32,
    height: u32,
    stream: OutputStream,
    abort: AbortFlag,
    frames: u64,
}

impl RawOutput {
    pub fn new(format: RawFormat, width: u32, height: u32, stream: OutputStream, abort: AbortFlag) -> Self {
        Self {
            format,
            width,
            height,
            stream,
            abort,
            frames: 0,
        }
    }

    /// Bytes of `frame_len` that get written
    pub fn write_len(&self, frame_len: usize) -> usize {
        match self.format {
            RawFormat::Gray => frame_len.min(self.width as usize * self.height as usize),
            RawFormat::Yuv | RawFormat::Rgb => frame_len,
        }
    }

    /// Write one raw frame. Returns the bytes written.
    pub fn handle(&mut self, chunk: &Chunk) -> usize {
        if chunk.is_empty() || self.abort.is_raised() {
            return 0;
        }
        let len = self.write_len(chunk.len());
        let written = self.stream.write(&chunk.data[..len], &self.abort, false);
        self.frames += 1;
        trace!("Raw frame {}: {} bytes", self.frames, written);
        written
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn stream_mut(&mut self) -> &mut OutputStream {
        &mut self.stream
    }
}

/// Port callback for the raw splitter output
pub fn raw_handler(output: Arc<Mutex<RawOutput>>) -> ChunkHandler {
    Box::new(move |port, chunk| {
        {
            let mut output = output.lock().unwrap_or_else(|e| e.into_inner());
            output.handle(&chunk);
        }
        recycle(port, chunk);
    })
}
