//! End-to-end tests for the farcam pipeline
//!
//! Drives real sinks (temp files, loopback TCP) from simulated producer
//! ports, no camera hardware:
//!
//! - Encoder port → router → segmented files
//! - Encoder port → router → TCP peer
//! - Still port → capture rendezvous, alongside a running recording
//!
//! Run: `cargo test -p farcam --test e2e`

use std::io::Read;
use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::watch;

use farcam::source::still_image;
use farcam::{
    start_still_source, start_test_source, CaptureController, CaptureOutcome, ProducerPort, RawConfig, RawFormat,
    RecordingConfig, RecordingSession, SimulatedPort, StopReason, SyntheticStream,
    TestSourceConfig,
};

// ── Shared helpers ───────────────────────────────────────────────────

fn synthetic() -> SyntheticStream {
    SyntheticStream::new(TestSourceConfig {
        fps: 25,
        frame_size: 300,
        keyframe_interval: 5,
        ..TestSourceConfig::default()
    })
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn deliver(port: &SimulatedPort, stream: &mut SyntheticStream, count: usize) {
    for chunk in stream.take(count) {
        port.deliver(chunk).unwrap();
    }
}

fn segment_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

// ── Segmented recording ──────────────────────────────────────────────

#[test]
fn split_request_starts_new_segment_at_header() {
    let dir = tempdir().unwrap();
    let port = Arc::new(SimulatedPort::new("encoder", 3));
    let config = RecordingConfig {
        destination: Some(path_str(&dir.path().join("seg_%03d.h264"))),
        split_wait: true,
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, port.clone());
    let split = session.split_flag();
    let mut stream = synthetic();

    session.start().unwrap();
    deliver(&port, &mut stream, 12);
    split.request();
    deliver(&port, &mut stream, 30);
    let summary = session.stop().unwrap();

    assert_eq!(summary.last_segment, 2);
    assert_eq!(segment_files(dir.path()), vec!["seg_001.h264", "seg_002.h264"]);

    let header = SyntheticStream::header();
    for name in segment_files(dir.path()) {
        let data = std::fs::read(dir.path().join(&name)).unwrap();
        assert!(data.starts_with(&header.data), "{} does not start with a header", name);
    }

    let total: u64 = segment_files(dir.path())
        .iter()
        .map(|n| std::fs::metadata(dir.path().join(n)).unwrap().len())
        .sum();
    assert_eq!(total, summary.bytes);
}

#[test]
fn segment_numbers_wrap_and_overwrite() {
    let dir = tempdir().unwrap();
    let port = Arc::new(SimulatedPort::new("encoder", 3));
    let config = RecordingConfig {
        destination: Some(path_str(&dir.path().join("loop_%d.h264"))),
        split_wait: true,
        segment_wrap: 2,
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, port.clone());
    let split = session.split_flag();
    let mut stream = synthetic();

    session.start().unwrap();
    deliver(&port, &mut stream, 6);
    for _ in 0..3 {
        split.request();
        // One header plus the rest of its group of pictures
        deliver(&port, &mut stream, 6);
    }
    let summary = session.stop().unwrap();

    // 1 -> 2 -> 1 -> 2
    assert_eq!(summary.last_segment, 2);
    assert_eq!(segment_files(dir.path()), vec!["loop_1.h264", "loop_2.h264"]);
    let reopened = std::fs::read(dir.path().join("loop_1.h264")).unwrap();
    assert_eq!(reopened.len(), 22 + 5 * 300);
}

#[test]
fn timestamps_written_alongside_video() {
    let dir = tempdir().unwrap();
    let port = Arc::new(SimulatedPort::new("encoder", 2));
    let pts_path = dir.path().join("video.pts");
    let config = RecordingConfig {
        destination: Some(path_str(&dir.path().join("video.h264"))),
        timestamps_destination: Some(path_str(&pts_path)),
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, port.clone());

    session.start().unwrap();
    deliver(&port, &mut synthetic(), 7);
    session.stop().unwrap();

    let text = std::fs::read_to_string(&pts_path).unwrap();
    assert_eq!(text, "0.000\n0.040\n0.080\n0.120\n0.160\n");
}

#[test]
fn side_info_goes_to_its_own_file() {
    let dir = tempdir().unwrap();
    let port = Arc::new(SimulatedPort::new("encoder", 2));
    let video = dir.path().join("video.h264");
    let vectors = dir.path().join("video.imv");
    let config = RecordingConfig {
        destination: Some(path_str(&video)),
        side_info_destination: Some(path_str(&vectors)),
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, port.clone());
    let mut stream = SyntheticStream::new(TestSourceConfig {
        frame_size: 100,
        side_info: true,
        ..TestSourceConfig::default()
    });

    session.start().unwrap();
    // header, frame, vectors, frame, vectors
    deliver(&port, &mut stream, 5);
    session.stop().unwrap();

    assert_eq!(std::fs::metadata(&vectors).unwrap().len(), 32);
    assert_eq!(std::fs::metadata(&video).unwrap().len(), 22 + 200);
}

#[test]
fn raw_frames_recorded_alongside_video() {
    let dir = tempdir().unwrap();
    let encoder = Arc::new(SimulatedPort::new("encoder", 3));
    let splitter = Arc::new(SimulatedPort::new("splitter", 3));
    let fast = |frame_size| TestSourceConfig {
        fps: 200,
        frame_size,
        ..TestSourceConfig::default()
    };
    let video_source = start_test_source(encoder.clone(), fast(400)).unwrap();
    let raw_source = start_test_source(splitter.clone(), fast(16 * 8 * 3 / 2)).unwrap();

    let raw_path = dir.path().join("video.gray");
    let config = RecordingConfig {
        destination: Some(path_str(&dir.path().join("video.h264"))),
        raw: RawConfig {
            destination: Some(path_str(&raw_path)),
            format: RawFormat::Gray,
            width: 16,
            height: 8,
        },
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, encoder.clone()).with_raw_port(splitter.clone());

    session.start().unwrap();
    assert!(splitter.is_capturing());
    std::thread::sleep(Duration::from_millis(300));
    let summary = session.stop().unwrap();
    video_source.stop();
    raw_source.stop();

    assert!(summary.chunks > 0);
    assert!(!splitter.is_capturing());
    assert!(!splitter.is_enabled());
    let raw = std::fs::read(&raw_path).unwrap();
    assert!(!raw.is_empty(), "raw output empty while video recorded {} chunks", summary.chunks);
}

// ── Network sink ─────────────────────────────────────────────────────

#[test]
fn recording_streams_to_tcp_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).unwrap();
        received
    });

    let port = Arc::new(SimulatedPort::new("encoder", 3));
    let config = RecordingConfig {
        destination: Some(format!("tcp://{}", addr)),
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, port.clone());
    session.start().unwrap();
    deliver(&port, &mut synthetic(), 10);
    let summary = session.stop().unwrap();

    let received = peer.join().unwrap();
    assert_eq!(received.len() as u64, summary.bytes);
    assert!(received.starts_with(&SyntheticStream::header().data));
    assert!(!summary.aborted);
}

#[test]
fn malformed_network_destination_fails_start() {
    let port = Arc::new(SimulatedPort::new("encoder", 1));
    let config = RecordingConfig {
        destination: Some("udp://not-an-ip:5000".to_string()),
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, port.clone());
    assert!(session.start().is_err());
    assert!(!port.is_enabled());
}

// ── Still capture ────────────────────────────────────────────────────

#[test]
fn stills_from_producer_thread() {
    let still = Arc::new(SimulatedPort::new("still", 1));
    let source = start_still_source(still.clone(), 5000, 1024).unwrap();
    let controller = CaptureController::new(still.clone());

    let report = controller.capture(vec![0u8; 8000]).unwrap();
    assert_eq!(report.length, 5000);
    assert_eq!(report.outcome, CaptureOutcome::Success);
    let expected: Vec<u8> = still_image(5000, 1024)
        .iter()
        .flat_map(|c| c.data.to_vec())
        .collect();
    assert_eq!(report.image(), &expected[..]);

    let report = controller.capture(vec![0u8; 3000]).unwrap();
    assert_eq!(report.length, 3000);
    assert_eq!(report.outcome, CaptureOutcome::Overflow);
    assert_eq!(report.image(), &expected[..3000]);

    assert_eq!(source.stop(), 2);
}

#[test]
fn still_capture_while_recording() {
    let dir = tempdir().unwrap();
    let encoder = Arc::new(SimulatedPort::new("encoder", 3));
    let still = Arc::new(SimulatedPort::new("still", 1));

    let video_source = start_test_source(
        encoder.clone(),
        TestSourceConfig {
            fps: 200,
            frame_size: 500,
            keyframe_interval: 10,
            ..TestSourceConfig::default()
        },
    )
    .unwrap();
    let still_source = start_still_source(still.clone(), 2048, 512).unwrap();

    let video_path = dir.path().join("video.h264");
    let config = RecordingConfig {
        destination: Some(path_str(&video_path)),
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let mut session = RecordingSession::new(config, encoder.clone());
    session.start().unwrap();

    let controller = CaptureController::new(still.clone());
    let report = controller.capture(vec![0u8; 4096]).unwrap();
    assert_eq!(report.length, 2048);

    std::thread::sleep(Duration::from_millis(100));
    let summary = session.stop().unwrap();
    video_source.stop();
    still_source.stop();

    assert!(summary.chunks > 0);
    let recorded = std::fs::read(&video_path).unwrap();
    assert_eq!(recorded.len() as u64, summary.bytes);
    assert!(recorded.starts_with(&SyntheticStream::header().data));
}

// ── Driver loop ──────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn run_stops_on_timeout() {
    let dir = tempdir().unwrap();
    let encoder = Arc::new(SimulatedPort::new("encoder", 3));
    let source = start_test_source(
        encoder.clone(),
        TestSourceConfig {
            fps: 100,
            frame_size: 200,
            ..TestSourceConfig::default()
        },
    )
    .unwrap();

    let config = RecordingConfig {
        destination: Some(path_str(&dir.path().join("timed.h264"))),
        timeout_ms: 300,
        ..RecordingConfig::default()
    };
    let session = RecordingSession::new(config, encoder.clone());
    let (_stop_tx, stop_rx) = watch::channel(false);

    let (reason, summary) = session.run(stop_rx).await.unwrap();
    source.stop();

    assert_eq!(reason, StopReason::Timeout);
    assert!(summary.chunks > 0);
    assert!(!encoder.is_enabled());
}

#[tokio::test(flavor = "multi_thread")]
async fn run_stops_on_request() {
    let dir = tempdir().unwrap();
    let encoder = Arc::new(SimulatedPort::new("encoder", 3));
    let config = RecordingConfig {
        destination: Some(path_str(&dir.path().join("manual.h264"))),
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let session = RecordingSession::new(config, encoder.clone());
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop_tx.send(true).unwrap();
        // Keep the sender alive until the session has seen it
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let (reason, _) = session.run(stop_rx).await.unwrap();
    assert_eq!(reason, StopReason::Requested);
}

#[tokio::test]
async fn stop_while_waiting_for_client_cancels_start() {
    let free = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let encoder = Arc::new(SimulatedPort::new("encoder", 1));
    let config = RecordingConfig {
        destination: Some(format!("tcp://127.0.0.1:{}", free)),
        listen: true,
        timeout_ms: 0,
        ..RecordingConfig::default()
    };
    let session = RecordingSession::new(config, encoder.clone());
    let (stop_tx, stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let outcome = tokio::time::timeout(Duration::from_secs(3), session.run(stop_rx)).await;
    let (reason, summary) = outcome.expect("run kept waiting for a client").unwrap();
    assert_eq!(reason, StopReason::Requested);
    assert_eq!(summary.chunks, 0);
    assert!(!encoder.is_enabled());
}
