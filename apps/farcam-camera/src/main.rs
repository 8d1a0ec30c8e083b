//! Farcam Camera Binary
//!
//! Records video through the farcam router while a second thread takes
//! still pictures on demand.
//!
//! ## Usage
//!
//! ```bash
//! # Ten second recording split into 2s numbered segments
//! FARCAM_OUTPUT=clip_%04d.h264 FARCAM_SEGMENT_MS=2000 FARCAM_TIMEOUT_MS=10000 farcam-camera
//!
//! # Stream to a TCP client that connects to us
//! FARCAM_OUTPUT=tcp://0.0.0.0:5000 FARCAM_LISTEN=true FARCAM_TIMEOUT_MS=0 farcam-camera
//!
//! # Settings from a JSON file, env vars still override
//! FARCAM_CONFIG=/etc/farcam.json farcam-camera
//! ```
//!
//! Ctrl-C stops the recording. On unix, SIGUSR1 starts a new segment at
//! the next header when segmenting.

use anyhow::Result;
use farcam::{Config, SplitFlag};
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("farcam=info".parse()?)
                .add_directive("farcam_camera=info".parse()?),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let rec = &config.recording;

    info!("Farcam Camera starting");
    info!("  Output: {}", rec.destination.as_deref().unwrap_or("(none)"));
    info!(
        "  Segments: {}",
        if rec.segment().is_segmenting() {
            format!("every {}ms, wrap {}", rec.segment_ms, rec.segment_wrap)
        } else {
            "off".to_string()
        }
    );
    info!(
        "  Circular buffer: {}",
        if rec.circular {
            format!("{} bytes", rec.circular_capacity)
        } else {
            "off".to_string()
        }
    );
    info!("  Timeout: {}ms", rec.timeout_ms);
    info!("  Stills: {}", config.capture.count);

    run(config).await
}

/// Forward Ctrl-C to `stop` and SIGUSR1 to `split` until the recording ends
fn spawn_signal_handler(stop: watch::Sender<bool>, split: SplitFlag) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut usr1 = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!("SIGUSR1 split requests unavailable: {}", e);
                None
            }
        };

        loop {
            #[cfg(unix)]
            let split_requested = async {
                match usr1.as_mut() {
                    Some(signal) => signal.recv().await,
                    None => std::future::pending().await,
                }
            };
            #[cfg(not(unix))]
            let split_requested = std::future::pending::<Option<()>>();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    let _ = stop.send(true);
                    break;
                }
                _ = split_requested => {
                    info!("Split requested");
                    split.request();
                }
                _ = stop.closed() => break,
            }
        }
    });
}

#[cfg(feature = "test-source")]
async fn run(config: Config) -> Result<()> {
    use anyhow::Context;
    use farcam::{
        start_still_source, start_test_source, CaptureController, CaptureOutcome, RawFormat,
        RecordingSession, SimulatedPort, StopReason, TestSourceConfig,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::error;

    info!("Using synthetic producer (test source)");

    let encoder = Arc::new(SimulatedPort::new("encoder", 3));
    let splitter = Arc::new(SimulatedPort::new("splitter", 3));
    let still = Arc::new(SimulatedPort::new("still", 1));

    let video_source = start_test_source(
        encoder.clone(),
        TestSourceConfig {
            side_info: config.recording.side_info_destination.is_some(),
            ..TestSourceConfig::default()
        },
    )?;
    let raw = &config.recording.raw;
    let raw_frame = (raw.width * raw.height) as usize;
    let raw_source = start_test_source(
        splitter.clone(),
        TestSourceConfig {
            frame_size: match raw.format {
                RawFormat::Rgb => raw_frame * 3,
                RawFormat::Yuv | RawFormat::Gray => raw_frame * 3 / 2,
            },
            ..TestSourceConfig::default()
        },
    )?;
    let still_source = start_still_source(still.clone(), 640 * 480 * 3, 64 * 1024)?;

    // Let the pipeline settle before the drivers start
    tokio::time::sleep(Duration::from_millis(config.capture.settle_ms)).await;

    let mut session = RecordingSession::new(config.recording.clone(), encoder.clone());
    if config.recording.raw.destination.is_some() {
        session = session.with_raw_port(splitter.clone());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_signal_handler(stop_tx, session.split_flag());

    let video = tokio::spawn(async move { session.run(stop_rx).await });

    let capture = config.capture.clone();
    let controller = CaptureController::new(still.clone());
    let photo = std::thread::Builder::new()
        .name("farcam-photo".into())
        .spawn(move || {
            let mut buffer = vec![0u8; capture.buffer_capacity];
            for n in 1..=capture.count {
                std::thread::sleep(Duration::from_millis(capture.pre_capture_delay_ms));
                let report = match controller.capture(buffer) {
                    Ok(report) => report,
                    Err(e) => {
                        error!("Still {} failed: {:#}", n, e);
                        buffer = vec![0u8; capture.buffer_capacity];
                        continue;
                    }
                };
                if report.outcome == CaptureOutcome::Overflow {
                    warn!(
                        "Still {} truncated to {} of {} bytes",
                        n, report.length, report.delivered
                    );
                }
                if let Some(pattern) = capture.output.as_deref() {
                    let path = farcam::sink::pattern::expand_segment_number(pattern, n)
                        .unwrap_or_else(|| pattern.to_string());
                    match std::fs::write(&path, report.image()) {
                        Ok(()) => info!("Saved still {} to {}", n, path),
                        Err(e) => error!("Failed to save still {} to {}: {}", n, path, e),
                    }
                }
                buffer = report.into_buffer();
            }
        })
        .context("failed to spawn photo thread")?;

    let recorded = video.await.context("video task panicked")?;
    let photo_done = tokio::task::spawn_blocking(move || photo.join()).await?;
    if photo_done.is_err() {
        error!("Photo thread panicked");
    }

    let frames = video_source.stop();
    raw_source.stop();
    let stills = still_source.stop();
    info!("Producers stopped: {} video frames, {} stills", frames, stills);

    let (reason, summary) = recorded?;
    info!(
        "Recording finished ({:?}): {} chunks, {} bytes, {} bytes replayed",
        reason, summary.chunks, summary.bytes, summary.dumped
    );
    if reason == StopReason::Aborted {
        anyhow::bail!("recording aborted after a sink failure");
    }
    Ok(())
}

#[cfg(not(feature = "test-source"))]
async fn run(_config: Config) -> Result<()> {
    anyhow::bail!("no camera producer available in this build, enable the test-source feature")
}
