//! Buffer callback router
//!
//! Entry point for every encoded chunk the producer delivers. Each chunk is
//! classified (header, side info, payload) and either appended to the
//! circular buffer or written to the active segment of the output streams,
//! rotating segments on header boundaries. The work per chunk is bounded:
//! a ring copy or one write call per stream.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, trace};

use crate::chunk::Chunk;
use crate::control::AbortFlag;
use crate::port::{recycle, ChunkHandler};
use crate::ring::CircularBuffer;
use crate::segment::{OutputStream, SegmentRotation};
use crate::sink::SinkOpener;

/// What the router did with a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterAction {
    /// Chunk consumed, keep going
    Continue,
    /// A new segment was opened before the chunk was written
    RotateThenWrite,
    /// A sink has failed; the driver should stop the recording
    Stop,
}

/// Where payload goes
pub enum RouterMode {
    /// Keep the most recent bytes in memory for a later dump
    Circular(CircularBuffer),
    /// Write straight to the output streams
    Direct,
}

/// Presentation timestamp bookkeeping for the timestamp stream.
#[derive(Debug, Default)]
pub struct PtsRecorder {
    start: Option<i64>,
    last: Option<i64>,
    frames: u64,
}

impl PtsRecorder {
    /// Format a record for `pts_us`, or `None` if it repeats the previous one
    pub fn record(&mut self, pts_us: i64) -> Option<String> {
        if self.last == Some(pts_us) {
            return None;
        }
        let start = *self.start.get_or_insert(pts_us);
        self.last = Some(pts_us);
        self.frames += 1;

        // A pts from before the first one is recorded at zero
        let relative_ms = (pts_us - start).max(0) / 1000;
        Some(format!("{}.{:03}\n", relative_ms / 1000, relative_ms % 1000))
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Output streams fed in direct mode
pub struct RouterOutputs {
    pub primary: OutputStream,
    pub side_info: OutputStream,
    pub timestamps: OutputStream,
}

impl RouterOutputs {
    fn all_mut(&mut self) -> [&mut OutputStream; 3] {
        [&mut self.primary, &mut self.side_info, &mut self.timestamps]
    }

    /// Flush and close every sink
    pub fn close(&mut self) {
        for stream in self.all_mut() {
            stream.close();
        }
    }
}

/// Routes chunks from the producer to the ring buffer or the sinks.
pub struct BufferRouter {
    mode: RouterMode,
    rotation: SegmentRotation,
    opener: Box<dyn SinkOpener>,
    outputs: RouterOutputs,
    pts: Option<PtsRecorder>,
    abort: AbortFlag,
    flush_buffers: bool,
    started: Instant,
    last_second: Option<u64>,
    chunks: u64,
    bytes: u64,
}

impl BufferRouter {
    pub fn new(
        mode: RouterMode,
        rotation: SegmentRotation,
        opener: Box<dyn SinkOpener>,
        outputs: RouterOutputs,
        abort: AbortFlag,
    ) -> Self {
        Self {
            mode,
            rotation,
            opener,
            outputs,
            pts: None,
            abort,
            flush_buffers: false,
            started: Instant::now(),
            last_second: None,
            chunks: 0,
            bytes: 0,
        }
    }

    /// Record presentation timestamps into the timestamp stream
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.pts = enabled.then(PtsRecorder::default);
        self
    }

    /// Flush (and fsync files) after every write
    pub fn with_flush(mut self, flush_buffers: bool) -> Self {
        self.flush_buffers = flush_buffers;
        self
    }

    pub fn mode(&self) -> &RouterMode {
        &self.mode
    }

    pub fn circular(&self) -> Option<&CircularBuffer> {
        match &self.mode {
            RouterMode::Circular(cb) => Some(cb),
            RouterMode::Direct => None,
        }
    }

    pub fn outputs_mut(&mut self) -> &mut RouterOutputs {
        &mut self.outputs
    }

    pub fn rotation(&self) -> &SegmentRotation {
        &self.rotation
    }

    pub fn abort(&self) -> &AbortFlag {
        &self.abort
    }

    /// (chunks, bytes) routed so far
    pub fn stats(&self) -> (u64, u64) {
        (self.chunks, self.bytes)
    }

    /// Decide what `chunk` requires without side effects
    pub fn plan(&self, chunk: &Chunk, now: Instant) -> RouterAction {
        if self.abort.is_raised() {
            return RouterAction::Stop;
        }
        match self.mode {
            RouterMode::Direct if self.rotation.should_rotate(chunk.flags, now) => {
                RouterAction::RotateThenWrite
            }
            _ => RouterAction::Continue,
        }
    }

    /// Route one chunk
    pub fn handle(&mut self, chunk: &Chunk) -> RouterAction {
        self.handle_at(chunk, Instant::now())
    }

    /// Route one chunk as if delivered at `now`
    pub fn handle_at(&mut self, chunk: &Chunk, now: Instant) -> RouterAction {
        self.rotation.start_clock(now);
        self.tick(now);

        let action = self.plan(chunk, now);
        if action == RouterAction::Stop {
            trace!("Dropping {} byte chunk after abort", chunk.len());
            return action;
        }

        self.chunks += 1;
        self.bytes += chunk.len() as u64;

        let side_info = chunk.flags.is_side_info();
        let mut wrote_primary = false;
        match &mut self.mode {
            RouterMode::Circular(cb) => {
                if chunk.flags.is_config() {
                    cb.push_header(&chunk.data);
                } else if side_info {
                    self.outputs
                        .side_info
                        .write(&chunk.data, &self.abort, self.flush_buffers);
                } else {
                    cb.append(
                        &chunk.data,
                        chunk.flags.is_keyframe(),
                        chunk.flags.is_frame_end(),
                    );
                }
            }
            RouterMode::Direct => {
                if action == RouterAction::RotateThenWrite {
                    let number = self.rotation.rotate(now);
                    for stream in self.outputs.all_mut() {
                        stream.reopen(self.opener.as_ref(), number);
                    }
                }
                if !chunk.is_empty() {
                    if side_info {
                        // Side info without a side-info sink is consumed silently
                        self.outputs
                            .side_info
                            .write(&chunk.data, &self.abort, self.flush_buffers);
                    } else {
                        self.outputs
                            .primary
                            .write(&chunk.data, &self.abort, self.flush_buffers);
                        wrote_primary = true;
                    }
                }
            }
        }
        if wrote_primary && !self.abort.is_raised() {
            self.record_timestamp(chunk);
        }

        if self.abort.is_raised() {
            RouterAction::Stop
        } else {
            action
        }
    }

    fn record_timestamp(&mut self, chunk: &Chunk) {
        let Some(pts) = self.pts.as_mut() else {
            return;
        };
        if chunk.flags.is_config() {
            return;
        }
        let Some(pts_us) = chunk.pts else {
            return;
        };
        if let Some(line) = pts.record(pts_us) {
            self.outputs
                .timestamps
                .write(line.as_bytes(), &self.abort, self.flush_buffers);
        }
    }

    fn tick(&mut self, now: Instant) {
        let second = now.saturating_duration_since(self.started).as_secs();
        if self.last_second != Some(second) {
            self.last_second = Some(second);
            debug!(
                "Router tick {}s: {} chunks, {} bytes, segment {}",
                second,
                self.chunks,
                self.bytes,
                self.rotation.segment_number()
            );
        }
    }

    /// Dump the circular buffer into the primary stream, if in circular mode.
    ///
    /// Returns the number of bytes written.
    pub fn dump_circular(&mut self) -> Result<usize> {
        let RouterMode::Circular(cb) = &self.mode else {
            return Ok(0);
        };
        let Some(sink) = self.outputs.primary.sink_mut() else {
            return Ok(0);
        };
        let written = cb.dump_to(sink.as_mut())?;
        debug!("Dumped {} bytes from circular buffer", written);
        Ok(written)
    }
}

/// Shared router as installed on a producer port
pub type SharedRouter = Arc<Mutex<BufferRouter>>;

/// Port callback: route the chunk, then release it and resubmit a buffer.
pub fn port_handler(router: SharedRouter) -> ChunkHandler {
    Box::new(move |port, chunk| {
        {
            let mut router = router.lock().unwrap_or_else(|e| e.into_inner());
            router.handle(&chunk);
        }
        recycle(port, chunk);
    })
}
