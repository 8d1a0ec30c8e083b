//! Farcam - camera output routing and capture
//!
//! Sits between an asynchronous hardware encoder and wherever its output
//! should go:
//!
//! - **Routing**: every delivered chunk goes through [`BufferRouter`], which
//!   writes it to the active sink or keeps it in a circular buffer
//! - **Circular replay**: [`CircularBuffer`] holds the most recent bytes plus
//!   an index of keyframes that are still intact, for dumping on demand
//! - **Segments**: recordings split by time or on request, always at a codec
//!   header so every segment decodes on its own
//! - **Sinks**: files, numbered or time-stamped file patterns, stdout, TCP
//!   (client or single-client listener) and UDP
//! - **Stills**: [`CaptureController`] takes one picture and blocks until it
//!   has fully arrived or has definitely failed
//!
//! The **`test-source`** feature adds an in-memory producer port and a
//! synthetic H.264 generator so everything runs without camera hardware.

pub mod capture;
pub mod chunk;
pub mod config;
pub mod control;
pub mod port;
pub mod raw;
pub mod ring;
pub mod router;
pub mod segment;
pub mod session;
pub mod sink;

#[cfg(feature = "test-source")]
pub mod source;

pub use capture::{image_buffer_size, CaptureController, CaptureOutcome, CaptureReport};
pub use chunk::{Chunk, ChunkFlags};
pub use config::{CaptureConfig, Config, RawConfig, RecordingConfig, ABORT_POLL_INTERVAL};
pub use control::{AbortFlag, CancelFlag, SplitFlag};
pub use port::{prime, recycle, ChunkHandler, ProducerPort};
pub use raw::{RawFormat, RawOutput};
pub use ring::{CircularBuffer, KeyframeIndex, RingBuffer};
pub use router::{BufferRouter, RouterAction, RouterMode, RouterOutputs};
pub use segment::{OutputStream, SegmentConfig, SegmentRotation, SegmentState};
pub use session::{pause_and_test_abort, RecordingSession, RecordingSummary, StopReason};
pub use sink::{SinkDescriptor, SinkHandle, SinkOpener, SinkResolver};

#[cfg(feature = "test-source")]
pub use port::SimulatedPort;
#[cfg(feature = "test-source")]
pub use source::{start_still_source, start_test_source, SyntheticStream, TestSource, TestSourceConfig};
