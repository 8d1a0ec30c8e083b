//! Recording session
//!
//! Owns everything one video recording needs: the producer port, the router
//! with its segment state and sinks, and the abort and split flags shared
//! with the driver. The callback path never blocks on the driver; the driver
//! polls the abort flag at [`ABORT_POLL_INTERVAL`].

use anyhow::{bail, Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{RecordingConfig, ABORT_POLL_INTERVAL};
use crate::control::{AbortFlag, CancelFlag, SplitFlag};
use crate::port::{prime, ProducerPort};
use crate::raw::{raw_handler, RawOutput};
use crate::ring::CircularBuffer;
use crate::router::{port_handler, BufferRouter, RouterMode, RouterOutputs, SharedRouter};
use crate::segment::{OutputStream, SegmentRotation};
use crate::sink::SinkOpener;

/// Why a recording ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured recording time elapsed
    Timeout,
    /// The driver asked to stop
    Requested,
    /// A sink failed
    Aborted,
}

/// What a finished recording produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    pub chunks: u64,
    pub bytes: u64,
    /// Segment number in use when the recording stopped
    pub last_segment: u32,
    /// Bytes written by the circular-buffer dump
    pub dumped: usize,
    pub aborted: bool,
}

/// One video recording from start to stop.
pub struct RecordingSession {
    config: RecordingConfig,
    port: Arc<dyn ProducerPort>,
    raw_port: Option<Arc<dyn ProducerPort>>,
    opener: Option<Box<dyn SinkOpener>>,
    abort: AbortFlag,
    split: SplitFlag,
    cancel: CancelFlag,
    router: Option<SharedRouter>,
    raw: Option<Arc<Mutex<RawOutput>>>,
}

impl RecordingSession {
    /// Session opening sinks with the resolver implied by `config`
    pub fn new(config: RecordingConfig, port: Arc<dyn ProducerPort>) -> Self {
        let cancel = CancelFlag::new();
        let resolver = config.resolver().with_cancel(cancel.clone());
        let mut session = Self::with_opener(config, port, Box::new(resolver));
        session.cancel = cancel;
        session
    }

    pub fn with_opener(
        config: RecordingConfig,
        port: Arc<dyn ProducerPort>,
        opener: Box<dyn SinkOpener>,
    ) -> Self {
        Self {
            config,
            port,
            raw_port: None,
            opener: Some(opener),
            abort: AbortFlag::new(),
            split: SplitFlag::new(),
            cancel: CancelFlag::new(),
            router: None,
            raw: None,
        }
    }

    /// Port delivering uncompressed frames for the raw output
    pub fn with_raw_port(mut self, port: Arc<dyn ProducerPort>) -> Self {
        self.raw_port = Some(port);
        self
    }

    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Handle for requesting a split at the next header
    pub fn split_flag(&self) -> SplitFlag {
        self.split.clone()
    }

    pub fn is_running(&self) -> bool {
        self.router.is_some()
    }

    /// Open the outputs, install the router and start capture.
    pub fn start(&mut self) -> Result<()> {
        if self.port.is_enabled() {
            bail!(
                "port {} is already enabled, a recording is still running",
                self.port.name()
            );
        }
        let opener = self
            .opener
            .take()
            .context("recording session has already been started")?;
        self.abort.reset();

        let rotation = SegmentRotation::new(self.config.segment(), self.split.clone());
        let number = rotation.segment_number();

        let mut outputs = RouterOutputs {
            primary: OutputStream::new("video", self.config.destination.clone()),
            side_info: OutputStream::new("motion vector", self.config.side_info_destination.clone()),
            timestamps: OutputStream::new("timestamp", self.config.timestamps_destination.clone()),
        };
        if let Some(destination) = self.config.destination.as_deref() {
            if !outputs.primary.open(opener.as_ref(), number)? {
                bail!("failed to open output {}", destination);
            }
        }
        for stream in [&mut outputs.side_info, &mut outputs.timestamps] {
            if let Some(destination) = stream.destination().map(str::to_string) {
                if !stream.open(opener.as_ref(), number)? {
                    warn!("Failed to open {} output {}", stream.label(), destination);
                }
            }
        }

        let raw = match (&self.raw_port, self.config.raw.destination.clone()) {
            (Some(_), Some(destination)) => {
                let mut stream = OutputStream::new("raw", Some(destination.clone()));
                if !stream.open(opener.as_ref(), number)? {
                    warn!("Failed to open raw output {}", destination);
                }
                Some(Arc::new(Mutex::new(RawOutput::new(
                    self.config.raw.format,
                    self.config.raw.width,
                    self.config.raw.height,
                    stream,
                    self.abort.clone(),
                ))))
            }
            (None, Some(_)) => {
                warn!("Raw output configured but no raw port available");
                None
            }
            _ => None,
        };

        let mode = if self.config.circular {
            if self.config.circular_capacity == 0 {
                bail!("circular mode needs a non-zero buffer capacity");
            }
            info!(
                "Recording into {} byte circular buffer",
                self.config.circular_capacity
            );
            RouterMode::Circular(CircularBuffer::new(
                self.config.circular_capacity,
                self.config.keyframe_index_capacity,
            )?)
        } else {
            RouterMode::Direct
        };

        let router = BufferRouter::new(mode, rotation, opener, outputs, self.abort.clone())
            .with_timestamps(self.config.timestamps_destination.is_some())
            .with_flush(self.config.flush_buffers);
        let router = Arc::new(Mutex::new(router));

        self.port
            .enable(port_handler(router.clone()))
            .with_context(|| format!("failed to enable port {}", self.port.name()))?;
        if let Err(e) = prime(self.port.as_ref()).and_then(|_| self.port.set_capture(true)) {
            self.port.disable();
            router
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .outputs_mut()
                .close();
            return Err(e.context("failed to start recording"));
        }

        if let (Some(raw_port), Some(raw)) = (&self.raw_port, &raw) {
            let started = raw_port
                .enable(raw_handler(raw.clone()))
                .and_then(|_| prime(raw_port.as_ref()))
                .and_then(|_| raw_port.set_capture(true));
            if let Err(e) = started {
                warn!("Raw output disabled: {:#}", e);
                raw_port.disable();
            }
        }

        self.router = Some(router);
        self.raw = raw;
        info!("Recording started on port {}", self.port.name());
        Ok(())
    }

    /// Wait until the timeout passes, `stop` becomes true, or a sink fails.
    ///
    /// A zero timeout waits indefinitely.
    pub async fn wait(&self, mut stop: watch::Receiver<bool>) -> StopReason {
        let timeout = self.config.timeout();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            if self.abort.is_raised() {
                return StopReason::Aborted;
            }
            if *stop.borrow() {
                return StopReason::Requested;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return StopReason::Timeout;
                    }
                    (deadline - now).min(ABORT_POLL_INTERVAL)
                }
                None => ABORT_POLL_INTERVAL,
            };

            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can stop us any more, treat as a stop
                        return StopReason::Requested;
                    }
                }
            }
        }
    }

    /// Stop capture, disable the ports, dump the circular buffer if there is
    /// one and close every sink.
    pub fn stop(&mut self) -> Result<RecordingSummary> {
        let router = self
            .router
            .take()
            .context("recording session is not running")?;

        if let Err(e) = self.port.set_capture(false) {
            warn!("Failed to stop capture: {:#}", e);
        }
        self.port.disable();

        if let Some(raw_port) = &self.raw_port {
            if raw_port.is_enabled() {
                if let Err(e) = raw_port.set_capture(false) {
                    warn!("Failed to stop raw capture: {:#}", e);
                }
            }
            raw_port.disable();
        }
        if let Some(raw) = self.raw.take() {
            let mut raw = raw.lock().unwrap_or_else(|e| e.into_inner());
            info!("Raw output wrote {} frames", raw.frames());
            raw.stream_mut().close();
        }

        let mut router = router.lock().unwrap_or_else(|e| e.into_inner());
        let dumped = match router.dump_circular() {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to write circular buffer: {:#}", e);
                0
            }
        };
        router.outputs_mut().close();

        let (chunks, bytes) = router.stats();
        let summary = RecordingSummary {
            chunks,
            bytes,
            last_segment: router.rotation().segment_number(),
            dumped,
            aborted: self.abort.is_raised(),
        };
        info!(
            "Recording stopped: {} chunks, {} bytes, last segment {}",
            summary.chunks, summary.bytes, summary.last_segment
        );
        Ok(summary)
    }

    /// Start, wait for a stop condition, then stop.
    ///
    /// Opening sinks and closing them block, so both run on the blocking
    /// pool. A stop requested while the outputs are still opening (a
    /// listening sink waiting for its client) cancels the start.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<(StopReason, RecordingSummary)> {
        let cancel = self.cancel.clone();
        let mut starting = tokio::task::spawn_blocking(move || {
            let mut session = self;
            session.start().map(|_| session)
        });

        let started = tokio::select! {
            joined = &mut starting => joined.context("recording start panicked")?,
            _ = stop_requested(&mut stop) => {
                info!("Stop requested while opening outputs");
                cancel.cancel();
                match starting.await.context("recording start panicked")? {
                    Ok(mut session) => {
                        let summary = tokio::task::spawn_blocking(move || session.stop())
                            .await
                            .context("recording stop panicked")??;
                        return Ok((StopReason::Requested, summary));
                    }
                    Err(e) => {
                        info!("Recording never started: {:#}", e);
                        return Ok((StopReason::Requested, RecordingSummary::default()));
                    }
                }
            }
        };
        let mut session = started?;

        let reason = session.wait(stop).await;
        info!("Stopping recording: {:?}", reason);
        let summary = tokio::task::spawn_blocking(move || session.stop())
            .await
            .context("recording stop panicked")??;
        Ok((reason, summary))
    }
}

/// Resolves once `stop` is true or its sender is gone
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `pause`, checking `abort` every [`ABORT_POLL_INTERVAL`].
///
/// Returns true if the abort flag was raised before the pause ran out.
pub async fn pause_and_test_abort(abort: &AbortFlag, pause: Duration) -> bool {
    if pause.is_zero() {
        return abort.is_raised();
    }
    let deadline = Instant::now() + pause;
    loop {
        if abort.is_raised() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep((deadline - now).min(ABORT_POLL_INTERVAL)).await;
    }
}
