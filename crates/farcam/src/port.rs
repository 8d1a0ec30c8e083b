//! Producer port interface
//!
//! The hardware encoder is an asynchronous producer: it owns a fixed pool of
//! buffers, fills the ones it has been handed, and calls back once per filled
//! buffer. Consumers must give every buffer back (`release`) and, while the
//! port is enabled, hand a fresh free buffer to the port so it never runs dry.

use anyhow::{bail, Result};
use tracing::{debug, error};

use crate::chunk::Chunk;

/// Per-chunk callback installed when a port is enabled.
///
/// The port passes itself so the handler can release and resubmit buffers
/// without holding a reference back to its owner.
pub type ChunkHandler = Box<dyn FnMut(&dyn ProducerPort, Chunk) + Send>;

/// An output port of the encoder (or splitter) pipeline.
pub trait ProducerPort: Send + Sync {
    /// Port name for diagnostics
    fn name(&self) -> &str;

    /// Whether the port is currently delivering to a handler
    fn is_enabled(&self) -> bool;

    /// Install `handler` and start delivery
    fn enable(&self, handler: ChunkHandler) -> Result<()>;

    /// Stop delivery, waiting for any in-flight callback to return
    fn disable(&self);

    /// Buffers currently sitting in the free pool
    fn free_buffers(&self) -> usize;

    /// Take one buffer from the free pool and hand it to the port
    fn submit_free_buffer(&self) -> Result<()>;

    /// Return a consumed chunk's storage to the free pool
    fn release(&self, chunk: Chunk);

    /// Start or stop the capture trigger on the source feeding this port
    fn set_capture(&self, on: bool) -> Result<()>;
}

/// Hand every free pool buffer to the port.
///
/// Returns the number of buffers submitted.
pub fn prime(port: &dyn ProducerPort) -> Result<usize> {
    let count = port.free_buffers();
    for i in 0..count {
        if let Err(e) = port.submit_free_buffer() {
            bail!(
                "unable to send buffer {} of {} to port {}: {}",
                i,
                count,
                port.name(),
                e
            );
        }
    }
    debug!("Primed port {} with {} buffers", port.name(), count);
    Ok(count)
}

/// Release a consumed chunk and keep the port fed.
///
/// Failing to resubmit risks a future under-run but is not fatal.
pub fn recycle(port: &dyn ProducerPort, chunk: Chunk) {
    port.release(chunk);

    if port.is_enabled() {
        if let Err(e) = port.submit_free_buffer() {
            error!("Unable to return a buffer to port {}: {}", port.name(), e);
        }
    }
}

#[cfg(feature = "test-source")]
pub use simulated::SimulatedPort;

#[cfg(feature = "test-source")]
mod simulated {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Debug, Default)]
    struct PoolState {
        /// Buffers in the free pool
        free: usize,
        /// Buffers handed to the port, waiting to be filled
        queued: usize,
    }

    /// In-memory producer port for running the pipeline without hardware.
    ///
    /// Chunks pushed with [`SimulatedPort::deliver`] consume one queued
    /// buffer each and are handed to the installed handler on the caller's
    /// thread, the same way the hardware calls back on its own thread.
    pub struct SimulatedPort {
        name: String,
        handler: Mutex<Option<ChunkHandler>>,
        pool: Mutex<PoolState>,
        enabled: AtomicBool,
        capturing: AtomicBool,
        fail_capture: AtomicBool,
        capture_triggers: AtomicUsize,
    }

    impl SimulatedPort {
        /// Create a port with `pool_size` free buffers
        pub fn new(name: impl Into<String>, pool_size: usize) -> Self {
            Self {
                name: name.into(),
                handler: Mutex::new(None),
                pool: Mutex::new(PoolState {
                    free: pool_size,
                    queued: 0,
                }),
                enabled: AtomicBool::new(false),
                capturing: AtomicBool::new(false),
                fail_capture: AtomicBool::new(false),
                capture_triggers: AtomicUsize::new(0),
            }
        }

        /// Deliver one filled buffer to the handler.
        ///
        /// Fails when the port is disabled or no buffer has been queued.
        pub fn deliver(&self, chunk: Chunk) -> Result<()> {
            let mut handler = self.handler.lock().unwrap_or_else(|e| e.into_inner());

            if !self.enabled.load(Ordering::Acquire) {
                bail!("port {} is not enabled", self.name);
            }
            {
                let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
                if pool.queued == 0 {
                    bail!("port {} has no queued buffer (under-run)", self.name);
                }
                pool.queued -= 1;
            }

            match handler.as_mut() {
                Some(callback) => callback(self, chunk),
                None => bail!("port {} has no handler", self.name),
            }
            Ok(())
        }

        /// Buffers handed to the port and not yet filled
        pub fn queued_buffers(&self) -> usize {
            self.pool.lock().unwrap_or_else(|e| e.into_inner()).queued
        }

        pub fn is_capturing(&self) -> bool {
            self.capturing.load(Ordering::Acquire)
        }

        /// Number of times capture has been switched on
        pub fn capture_triggers(&self) -> usize {
            self.capture_triggers.load(Ordering::Acquire)
        }

        /// Make the next `set_capture(true)` calls fail
        pub fn fail_capture_trigger(&self, fail: bool) {
            self.fail_capture.store(fail, Ordering::Release);
        }

        /// Poll until capture is on and buffers are queued, or `timeout` passes
        pub fn wait_until_ready(&self, timeout: Duration) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.is_capturing() && self.is_enabled() && self.queued_buffers() > 0 {
                    return true;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            false
        }
    }

    impl ProducerPort for SimulatedPort {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::Acquire)
        }

        fn enable(&self, handler: ChunkHandler) -> Result<()> {
            let mut slot = self.handler.lock().unwrap_or_else(|e| e.into_inner());
            if self.enabled.load(Ordering::Acquire) {
                bail!("port {} is already enabled", self.name);
            }
            *slot = Some(handler);
            self.enabled.store(true, Ordering::Release);
            debug!("Port {} enabled", self.name);
            Ok(())
        }

        fn disable(&self) {
            // Taking the handler lock waits out any delivery in progress
            let mut slot = self.handler.lock().unwrap_or_else(|e| e.into_inner());
            if !self.enabled.swap(false, Ordering::AcqRel) {
                return;
            }
            *slot = None;

            let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
            pool.free += pool.queued;
            pool.queued = 0;
            debug!("Port {} disabled", self.name);
        }

        fn free_buffers(&self) -> usize {
            self.pool.lock().unwrap_or_else(|e| e.into_inner()).free
        }

        fn submit_free_buffer(&self) -> Result<()> {
            let mut pool = self.pool.lock().unwrap_or_else(|e| e.into_inner());
            if pool.free == 0 {
                bail!("free pool of port {} is empty", self.name);
            }
            pool.free -= 1;
            pool.queued += 1;
            Ok(())
        }

        fn release(&self, chunk: Chunk) {
            drop(chunk);
            self.pool.lock().unwrap_or_else(|e| e.into_inner()).free += 1;
        }

        fn set_capture(&self, on: bool) -> Result<()> {
            if on && self.fail_capture.load(Ordering::Acquire) {
                bail!("capture trigger rejected by port {}", self.name);
            }
            self.capturing.store(on, Ordering::Release);
            if on {
                self.capture_triggers.fetch_add(1, Ordering::AcqRel);
            }
            Ok(())
        }
    }
}
