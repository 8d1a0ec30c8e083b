//! One-shot control flags shared between driver threads and the callback
//!
//! Each flag has a single writer and a single reader, so atomic visibility
//! is all the synchronisation they need.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Set by a failed write, polled by the driving loop.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Returns true only for the call that actually set it.
    pub fn raise(&self, reason: &str) -> bool {
        let first = !self.0.swap(true, Ordering::AcqRel);
        if first {
            error!("Aborting: {}", reason);
        }
        first
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Clear before a new run
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// External request to start a new segment at the next header chunk.
#[derive(Debug, Clone, Default)]
pub struct SplitFlag(Arc<AtomicBool>);

impl SplitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consume a pending request
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Asks a blocking open to give up, such as an accept waiting for a client.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
