//! Synchronous still capture
//!
//! Turns the asynchronous delivery of one still frame into a blocking call.
//! Each call owns a fresh one-shot channel; the port callback copies straight
//! into the caller's buffer and completes the channel on the first chunk that
//! ends the frame (or reports a transmission failure). The buffer comes back
//! in the report so it can be reused for the next still.

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::chunk::Chunk;
use crate::port::{prime, recycle, ProducerPort};

/// How a capture ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// Whole frame fit in the buffer
    Success,
    /// Frame was larger than the buffer and has been truncated
    Overflow,
    /// Producer flagged the frame as failed
    TransmissionFailed,
}

/// Result of one completed capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    /// Bytes actually copied into the destination
    pub length: usize,
    /// Bytes delivered by the producer, including any that did not fit
    pub delivered: usize,
    pub outcome: CaptureOutcome,
    /// The caller's buffer; the first `length` bytes hold the image
    pub buffer: Vec<u8>,
}

impl CaptureReport {
    pub fn image(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Give the buffer back for the next capture
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Per-call state shared with the port callback
struct CaptureContext {
    dest: Vec<u8>,
    offset: usize,
    delivered: usize,
    overflow: bool,
    complete: bool,
}

impl CaptureContext {
    fn new(dest: Vec<u8>) -> Self {
        Self {
            dest,
            offset: 0,
            delivered: 0,
            overflow: false,
            complete: false,
        }
    }

    /// Copy a delivered chunk. Returns the outcome on the chunk that
    /// completes the frame, and only on that one.
    fn accept(&mut self, chunk: &Chunk) -> Option<CaptureOutcome> {
        // Completed already: later deliveries are drained, not copied
        if self.complete {
            return None;
        }

        self.delivered += chunk.len();
        let room = self.dest.len() - self.offset;
        let take = chunk.len().min(room);
        self.dest[self.offset..self.offset + take].copy_from_slice(&chunk.data[..take]);
        self.offset += take;
        if take < chunk.len() && !self.overflow {
            self.overflow = true;
            warn!(
                "Capture buffer overflow: {} byte buffer full, dropping excess image data",
                self.dest.len()
            );
        }

        let outcome = if chunk.flags.is_transmission_failed() {
            CaptureOutcome::TransmissionFailed
        } else if chunk.flags.is_frame_end() {
            if self.overflow {
                CaptureOutcome::Overflow
            } else {
                CaptureOutcome::Success
            }
        } else {
            return None;
        };

        self.complete = true;
        Some(outcome)
    }
}

/// Owns the still-capture port and allows one capture in flight at a time.
pub struct CaptureController {
    port: Arc<dyn ProducerPort>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however the capture returns
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CaptureController {
    pub fn new(port: Arc<dyn ProducerPort>) -> Self {
        Self {
            port,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn port(&self) -> &Arc<dyn ProducerPort> {
        &self.port
    }

    /// Whether a capture is currently waiting for its frame
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Capture one frame into `dest`, blocking until it completes.
    ///
    /// Chunks are copied into `dest` as they arrive; its length is the
    /// capacity and it is returned in the report. Fails immediately if
    /// another capture is in flight, the port is still enabled from an
    /// earlier capture, or the capture trigger is rejected. A frame larger
    /// than `dest` is truncated; compare [`CaptureReport::length`] with the
    /// expected size to detect it.
    ///
    /// Must not be called from within an async runtime.
    pub fn capture(&self, dest: Vec<u8>) -> Result<CaptureReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            bail!("a capture is already in progress, try again later");
        }
        let _guard = InFlight(&self.in_flight);

        if self.port.is_enabled() {
            bail!(
                "could not enable port {}, try waiting longer before attempting to take another picture",
                self.port.name()
            );
        }

        let (tx, rx) = oneshot::channel();
        let context = Arc::new(Mutex::new(CaptureContext::new(dest)));

        // The sender lives in the handler so that dropping the handler
        // closes the channel
        let shared = context.clone();
        let mut done = Some(tx);
        self.port
            .enable(Box::new(move |port, chunk| {
                let outcome = shared
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .accept(&chunk);
                if let (Some(outcome), Some(tx)) = (outcome, done.take()) {
                    let _ = tx.send(outcome);
                }
                recycle(port, chunk);
            }))
            .with_context(|| format!("failed to enable capture port {}", self.port.name()))?;

        if let Err(e) = prime(self.port.as_ref()).and_then(|_| self.port.set_capture(true)) {
            self.port.disable();
            return Err(e.context("failed to start capture"));
        }
        debug!("Capture triggered on port {}", self.port.name());

        // A port torn down before completion drops the sender and wakes us
        let waited = rx.blocking_recv();

        if let Err(e) = self.port.set_capture(false) {
            warn!("Failed to clear capture trigger: {:#}", e);
        }
        self.port.disable();

        let outcome = waited.context("capture port closed before the frame completed")?;

        let mut ctx = context.lock().unwrap_or_else(|e| e.into_inner());
        let length = ctx.offset;

        info!("Actual image size: {} ({:?})", length, outcome);
        Ok(CaptureReport {
            length,
            delivered: ctx.delivered,
            outcome,
            buffer: std::mem::take(&mut ctx.dest),
        })
    }
}

/// Size of the still buffer: an RGB frame aligned to the ISP's 32x16 block
/// plus room for a BMP header
pub fn image_buffer_size(width: u32, height: u32) -> usize {
    let width = (width as usize).next_multiple_of(32);
    let height = (height as usize).next_multiple_of(16);
    width * height * 3 + 54
}

#[cfg(all(test, feature = "test-source"))]
mod tests {
    use super::*;
    use crate::chunk::ChunkFlags;
    use crate::port::SimulatedPort;
    use bytes::Bytes;
    use std::thread;
    use std::time::Duration;

    fn chunk(fill: u8, len: usize, flags: u8) -> Chunk {
        Chunk::new(Bytes::from(vec![fill; len]), ChunkFlags(flags))
    }

    fn producer(port: Arc<SimulatedPort>, chunks: Vec<Chunk>) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            assert!(port.wait_until_ready(Duration::from_secs(5)));
            for c in chunks {
                if port.deliver(c).is_err() {
                    break;
                }
            }
        })
    }

    #[test]
    fn buffer_size_matches_full_hd_rgb() {
        assert_eq!(image_buffer_size(1920, 1080), 1920 * 1088 * 3 + 54);
    }

    #[test]
    fn capture_collects_whole_frame() {
        let port = Arc::new(SimulatedPort::new("still", 3));
        let controller = CaptureController::new(port.clone());
        let feeder = producer(
            port.clone(),
            vec![chunk(1, 100, 0), chunk(2, 50, ChunkFlags::FRAME_END)],
        );

        let report = controller.capture(vec![0u8; 1000]).unwrap();
        feeder.join().unwrap();

        assert_eq!(report.length, 150);
        assert_eq!(report.outcome, CaptureOutcome::Success);
        assert_eq!(&report.image()[..100], &[1u8; 100][..]);
        assert_eq!(&report.image()[100..], &[2u8; 50][..]);
        // The caller's buffer comes back whole, ready for the next still
        assert_eq!(report.into_buffer().len(), 1000);
        assert!(!port.is_enabled());
        assert!(!controller.is_busy());
    }

    #[test]
    fn oversized_frame_is_truncated_to_capacity() {
        let port = Arc::new(SimulatedPort::new("still", 4));
        let controller = CaptureController::new(port.clone());
        let feeder = producer(
            port.clone(),
            vec![
                chunk(7, 40, 0),
                chunk(8, 40, 0),
                chunk(9, 40, ChunkFlags::FRAME_END),
            ],
        );

        let report = controller.capture(vec![0u8; 64]).unwrap();
        feeder.join().unwrap();

        assert_eq!(report.length, 64);
        assert_eq!(report.delivered, 120);
        assert_eq!(report.outcome, CaptureOutcome::Overflow);
        assert_eq!(&report.image()[40..], &[8u8; 24][..]);
    }

    #[test]
    fn transmission_failure_completes_capture() {
        let port = Arc::new(SimulatedPort::new("still", 2));
        let controller = CaptureController::new(port.clone());
        let feeder = producer(
            port.clone(),
            vec![chunk(1, 10, ChunkFlags::TRANSMISSION_FAILED)],
        );

        let report = controller.capture(vec![0u8; 32]).unwrap();
        feeder.join().unwrap();
        assert_eq!(report.outcome, CaptureOutcome::TransmissionFailed);
    }

    #[test]
    fn completion_posts_once() {
        let port = Arc::new(SimulatedPort::new("still", 4));
        let controller = CaptureController::new(port.clone());
        let feeder = producer(
            port.clone(),
            vec![
                chunk(1, 10, ChunkFlags::FRAME_END),
                chunk(2, 10, ChunkFlags::FRAME_END),
            ],
        );

        let report = controller.capture(vec![0u8; 64]).unwrap();
        // The second delivery may race the disable; either way it is not copied
        feeder.join().unwrap();
        assert_eq!(report.length, 10);
        assert_eq!(report.image(), &[1u8; 10][..]);
        assert_eq!(&report.buffer[10..], &[0u8; 54][..]);
    }

    #[test]
    fn second_capture_is_rejected_while_waiting() {
        let port = Arc::new(SimulatedPort::new("still", 2));
        let controller = Arc::new(CaptureController::new(port.clone()));

        let first = {
            let controller = controller.clone();
            thread::spawn(move || controller.capture(vec![0u8; 16]))
        };

        assert!(port.wait_until_ready(Duration::from_secs(5)));
        assert!(controller.is_busy());
        assert!(controller.capture(vec![0u8; 16]).is_err());

        port.deliver(chunk(3, 4, ChunkFlags::FRAME_END)).unwrap();
        let report = first.join().unwrap().unwrap();
        assert_eq!(report.length, 4);
        assert!(!controller.is_busy());
    }

    #[test]
    fn enabled_port_fails_fast() {
        let port = Arc::new(SimulatedPort::new("still", 1));
        port.enable(Box::new(|_, _| {})).unwrap();
        let controller = CaptureController::new(port.clone());
        assert!(controller.capture(vec![0u8; 8]).is_err());
        assert!(!controller.is_busy());
    }

    #[test]
    fn trigger_failure_returns_without_waiting() {
        let port = Arc::new(SimulatedPort::new("still", 2));
        port.fail_capture_trigger(true);
        let controller = CaptureController::new(port.clone());
        assert!(controller.capture(vec![0u8; 8]).is_err());
        assert!(!port.is_enabled());
        assert_eq!(port.free_buffers(), 2);
    }

    #[test]
    fn disabled_port_wakes_waiter() {
        let port = Arc::new(SimulatedPort::new("still", 1));
        let controller = Arc::new(CaptureController::new(port.clone()));
        let waiter = {
            let controller = controller.clone();
            thread::spawn(move || controller.capture(vec![0u8; 8]))
        };
        assert!(port.wait_until_ready(Duration::from_secs(5)));
        port.disable();
        assert!(waiter.join().unwrap().is_err());
    }
}
