//! Synthetic encoder output for running without camera hardware

use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkFlags};
use crate::port::SimulatedPort;
use crate::ring::START_CODE;

/// Configuration for the test video source
#[derive(Debug, Clone)]
pub struct TestSourceConfig {
    /// Frames per second
    pub fps: u32,
    /// Simulated frame size in bytes
    pub frame_size: usize,
    /// Keyframe (with inline headers) every N frames
    pub keyframe_interval: u32,
    /// Split each frame over this many chunks
    pub chunks_per_frame: usize,
    /// Emit a motion-vector chunk after every frame
    pub side_info: bool,
}

impl Default for TestSourceConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            frame_size: 10000, // ~10KB per frame
            keyframe_interval: 30,
            chunks_per_frame: 1,
            side_info: false,
        }
    }
}

/// SPS + PPS, small enough for the header accumulator
const HEADER: [u8; 22] = [
    0x00, 0x00, 0x00, 0x01, 0x27, 0x64, 0x00, 0x28, 0xac, 0x2b, 0x40, 0x3c, 0x01, 0x13, 0xf2,
    0xa0, 0x00, 0x00, 0x00, 0x01, 0x28, 0xee,
];

/// Endless sequence of H.264-shaped chunks.
///
/// Every keyframe is preceded by a header chunk flagged `CONFIG`, frames
/// start with a start code, and the last chunk of each frame carries
/// `FRAME_END`.
#[derive(Debug)]
pub struct SyntheticStream {
    config: TestSourceConfig,
    frame_num: u32,
    pending: VecDeque<Chunk>,
}

impl SyntheticStream {
    pub fn new(config: TestSourceConfig) -> Self {
        Self {
            config,
            frame_num: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn header() -> Chunk {
        Chunk::new(Bytes::from_static(&HEADER), ChunkFlags(ChunkFlags::CONFIG))
    }

    /// Frames generated so far
    pub fn frames(&self) -> u32 {
        self.frame_num
    }

    /// All chunks of the next frame, in delivery order
    pub fn next_frame(&mut self) -> Vec<Chunk> {
        if self.pending.is_empty() {
            self.queue_frame();
        }
        self.pending.drain(..).collect()
    }

    fn queue_frame(&mut self) {
        let keyframe = self.frame_num % self.config.keyframe_interval.max(1) == 0;
        let pts_us = self.frame_num as i64 * 1_000_000 / self.config.fps.max(1) as i64;

        if keyframe {
            self.pending.push_back(Self::header().with_pts(pts_us));
        }

        let mut data = Vec::with_capacity(self.config.frame_size.max(8));
        data.extend_from_slice(&START_CODE);
        data.push(if keyframe { 0x25 } else { 0x21 });
        data.extend_from_slice(&self.frame_num.to_be_bytes());
        while data.len() < self.config.frame_size {
            // Padding with pattern, no start codes
            data.push((self.frame_num & 0x7F) as u8 | 0x80);
        }
        let data = Bytes::from(data);

        let parts = self.config.chunks_per_frame.clamp(1, data.len());
        let step = data.len().div_ceil(parts);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + step).min(data.len());
            let mut flags = ChunkFlags::empty();
            if keyframe {
                flags = flags.with(ChunkFlags::KEYFRAME);
            }
            if end == data.len() {
                flags = flags.with(ChunkFlags::FRAME_END);
            }
            self.pending
                .push_back(Chunk::new(data.slice(offset..end), flags).with_pts(pts_us));
            offset = end;
        }

        if self.config.side_info {
            let vectors = Bytes::from(vec![(self.frame_num & 0xFF) as u8; 16]);
            self.pending
                .push_back(Chunk::new(vectors, ChunkFlags(ChunkFlags::SIDE_INFO)).with_pts(pts_us));
        }

        self.frame_num = self.frame_num.wrapping_add(1);
    }
}

impl Iterator for SyntheticStream {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.pending.is_empty() {
            self.queue_frame();
        }
        self.pending.pop_front()
    }
}

/// Chunks of one synthetic still image of `size` bytes
pub fn still_image(size: usize, chunk_size: usize) -> Vec<Chunk> {
    let image: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let image = Bytes::from(image);
    let step = chunk_size.max(1);

    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < image.len() {
        let end = (offset + step).min(image.len());
        let flags = if end == image.len() {
            ChunkFlags(ChunkFlags::FRAME_END)
        } else {
            ChunkFlags::empty()
        };
        chunks.push(Chunk::new(image.slice(offset..end), flags));
        offset = end;
    }
    chunks
}

/// Running test source feeding a simulated port
pub struct TestSource {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u32>>,
}

impl TestSource {
    /// Signal the producer thread and wait for it. Returns frames produced.
    pub fn stop(mut self) -> u32 {
        self.stop.store(true, Ordering::Release);
        self.handle.take().and_then(|h| h.join().ok()).unwrap_or(0)
    }
}

impl Drop for TestSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Start a producer thread delivering synthetic frames to `port` at the
/// configured rate, the way the encoder calls back from its own thread.
pub fn start_test_source(port: Arc<SimulatedPort>, config: TestSourceConfig) -> Result<TestSource> {
    let stop = Arc::new(AtomicBool::new(false));
    let stopping = stop.clone();
    let frame_interval = Duration::from_micros(1_000_000 / config.fps.max(1) as u64);

    let handle = thread::Builder::new()
        .name("farcam-test-source".into())
        .spawn(move || {
            info!(
                "Test video source started: {}fps, {}B frames",
                config.fps, config.frame_size
            );
            let mut stream = SyntheticStream::new(config);

            while !stopping.load(Ordering::Acquire) {
                if !port.is_capturing() {
                    thread::sleep(frame_interval);
                    continue;
                }

                for chunk in stream.next_frame() {
                    if let Err(e) = port.deliver(chunk) {
                        warn!("Test source dropped a chunk: {:#}", e);
                    }
                }

                if stream.frames() % 300 == 0 {
                    debug!("Test source: {} frames generated", stream.frames());
                }
                thread::sleep(frame_interval);
            }

            info!("Test video source stopped after {} frames", stream.frames());
            stream.frames()
        })
        .context("failed to spawn test source thread")?;

    Ok(TestSource {
        stop,
        handle: Some(handle),
    })
}

/// Start a producer thread that answers every capture trigger on `port`
/// with one synthetic still of `size` bytes.
pub fn start_still_source(port: Arc<SimulatedPort>, size: usize, chunk_size: usize) -> Result<TestSource> {
    let stop = Arc::new(AtomicBool::new(false));
    let stopping = stop.clone();

    let handle = thread::Builder::new()
        .name("farcam-still-source".into())
        .spawn(move || {
            let mut served = 0u32;
            let mut answered = port.capture_triggers();
            while !stopping.load(Ordering::Acquire) {
                if !port.wait_until_ready(Duration::from_millis(100)) {
                    continue;
                }
                let triggers = port.capture_triggers();
                if triggers == answered {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                answered = triggers;

                for chunk in still_image(size, chunk_size) {
                    if let Err(e) = port.deliver(chunk) {
                        warn!("Still source dropped a chunk: {:#}", e);
                        break;
                    }
                }
                served += 1;
                debug!("Still source served image {}", served);
            }
            served
        })
        .context("failed to spawn still source thread")?;

    Ok(TestSource {
        stop,
        handle: Some(handle),
    })
}
