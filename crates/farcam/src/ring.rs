//! Circular replay buffer
//!
//! Keeps the most recent `capacity` bytes of the encoded stream in memory
//! together with a bounded index of keyframe start positions, so the last
//! few seconds can be dumped starting at a decodable frame without parsing
//! the stream.
//!
//! Positions are tracked as absolute stream positions (total bytes appended
//! before that byte). A position `p` is still resident while
//! `p >= total_written - capacity`; its slot in the ring is `p % capacity`.
//! Eviction is therefore a single comparison and cannot drift at the wrap
//! point.

use anyhow::{ensure, Result};
use std::io::{self, Write};
use tracing::{debug, error, warn};

/// Annex B start code that must begin every indexed keyframe
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Size of the codec header accumulator
pub const HEADER_CAPACITY: usize = 29;

/// Default keyframe index depth
pub const DEFAULT_KEYFRAME_INDEX_CAPACITY: usize = 60 * 1000;

/// Fixed-capacity byte ring.
pub struct RingBuffer {
    buf: Box<[u8]>,
    total: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "ring buffer capacity must be non-zero");
        Ok(Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            total: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Slot the next byte will be written to
    pub fn write_pos(&self) -> usize {
        self.slot(self.total)
    }

    /// True once at least `capacity` bytes have been written
    pub fn wrapped(&self) -> bool {
        self.total >= self.capacity() as u64
    }

    pub fn total_written(&self) -> u64 {
        self.total
    }

    /// Valid bytes currently held: `min(total_written, capacity)`
    pub fn len(&self) -> usize {
        self.total.min(self.capacity() as u64) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Oldest stream position still resident
    pub fn oldest_position(&self) -> u64 {
        self.total.saturating_sub(self.capacity() as u64)
    }

    /// Whether the byte at stream position `pos` is still resident
    pub fn is_resident(&self, pos: u64) -> bool {
        pos >= self.oldest_position() && pos < self.total
    }

    /// Ring slot holding stream position `pos`
    pub fn slot(&self, pos: u64) -> usize {
        (pos % self.capacity() as u64) as usize
    }

    /// Append bytes, overwriting the oldest data once full.
    ///
    /// Writes that cross the end of the ring are split into a tail part and
    /// a head part.
    pub fn append(&mut self, data: &[u8]) {
        let cap = self.capacity();

        // Only the last `cap` bytes of an oversized write survive
        let skip = data.len().saturating_sub(cap);
        self.total += skip as u64;
        let data = &data[skip..];

        let start = self.write_pos();
        let to_end = data.len().min(cap - start);
        self.buf[start..start + to_end].copy_from_slice(&data[..to_end]);
        let rest = data.len() - to_end;
        self.buf[..rest].copy_from_slice(&data[to_end..]);

        self.total += data.len() as u64;
    }

    /// Whether a start code is resident at stream position `pos`
    pub fn has_start_code_at(&self, pos: u64) -> bool {
        if !self.is_resident(pos) || pos + START_CODE.len() as u64 > self.total {
            return false;
        }
        START_CODE
            .iter()
            .enumerate()
            .all(|(i, b)| self.buf[self.slot(pos + i as u64)] == *b)
    }

    /// Write resident bytes from stream position `from` up to the write cursor
    pub fn write_from<W: Write + ?Sized>(&self, from: u64, out: &mut W) -> io::Result<usize> {
        let from = from.max(self.oldest_position());
        if from >= self.total {
            return Ok(0);
        }
        let len = (self.total - from) as usize;
        let start = self.slot(from);
        let to_end = len.min(self.capacity() - start);
        out.write_all(&self.buf[start..start + to_end])?;
        out.write_all(&self.buf[..len - to_end])?;
        Ok(len)
    }
}

/// Bounded FIFO of keyframe stream positions.
///
/// The read pointer only moves forward. Entries are evicted before the ring
/// overwrites the bytes they point at, so every entry between read and write
/// pointers refers to resident data.
pub struct KeyframeIndex {
    entries: Box<[u64]>,
    read: usize,
    write: usize,
    len: usize,
}

impl KeyframeIndex {
    pub fn new(capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, "keyframe index capacity must be non-zero");
        Ok(Self {
            entries: vec![0u64; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Push a keyframe position at the write pointer.
    ///
    /// A full index means eviction has fallen behind; the oldest entry is
    /// overwritten and the inconsistency is logged.
    pub fn record(&mut self, pos: u64) {
        if self.len == self.capacity() {
            error!(
                "Keyframe index full ({} entries): overwriting oldest entry at {}",
                self.len, self.entries[self.read]
            );
            self.advance_read();
        }
        self.entries[self.write] = pos;
        self.write = (self.write + 1) % self.capacity();
        self.len += 1;
    }

    /// Oldest indexed position, if any
    pub fn oldest(&self) -> Option<u64> {
        (self.len > 0).then(|| self.entries[self.read])
    }

    /// Most recently recorded position, if any
    pub fn newest(&self) -> Option<u64> {
        (self.len > 0).then(|| {
            let last = (self.write + self.capacity() - 1) % self.capacity();
            self.entries[last]
        })
    }

    /// Advance the read pointer past every entry older than `oldest_kept`.
    ///
    /// Returns the number of entries evicted.
    pub fn evict_before(&mut self, oldest_kept: u64) -> usize {
        let mut evicted = 0;
        while let Some(pos) = self.oldest() {
            if pos >= oldest_kept {
                break;
            }
            self.advance_read();
            evicted += 1;
        }
        evicted
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).map(move |i| self.entries[(self.read + i) % self.capacity()])
    }

    fn advance_read(&mut self) {
        self.read = (self.read + 1) % self.capacity();
        self.len -= 1;
    }
}

/// Small accumulator for codec header chunks.
///
/// Consecutive header chunks form one header group; the first header chunk
/// after payload data starts a new group that replaces the previous one.
#[derive(Debug, Default)]
pub struct HeaderBytes {
    bytes: Vec<u8>,
    complete: bool,
}

impl HeaderBytes {
    /// Add a header chunk. Returns false (and keeps the current bytes) when
    /// the group would exceed [`HEADER_CAPACITY`].
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.complete {
            self.bytes.clear();
            self.complete = false;
        }
        if self.bytes.len() + data.len() > HEADER_CAPACITY {
            error!(
                "Error in header bytes: {} + {} exceeds {} byte accumulator",
                self.bytes.len(),
                data.len(),
                HEADER_CAPACITY
            );
            return false;
        }
        self.bytes.extend_from_slice(data);
        true
    }

    /// Mark the current group finished (payload has started)
    pub fn seal(&mut self) {
        if !self.bytes.is_empty() {
            self.complete = true;
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Ring buffer, keyframe index and header accumulator fed by the router.
pub struct CircularBuffer {
    ring: RingBuffer,
    keyframes: KeyframeIndex,
    header: HeaderBytes,
    /// Stream position where the current frame began
    frame_start: Option<u64>,
}

impl CircularBuffer {
    pub fn new(capacity: usize, keyframe_capacity: usize) -> Result<Self> {
        Ok(Self {
            ring: RingBuffer::new(capacity)?,
            keyframes: KeyframeIndex::new(keyframe_capacity)?,
            header: HeaderBytes::default(),
            frame_start: None,
        })
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn keyframes(&self) -> &KeyframeIndex {
        &self.keyframes
    }

    pub fn header(&self) -> &[u8] {
        self.header.as_slice()
    }

    /// Store a codec header chunk; header bytes never enter the ring
    pub fn push_header(&mut self, data: &[u8]) -> bool {
        self.header.push(data)
    }

    /// Append a payload chunk.
    ///
    /// Keyframe entries whose bytes this write will overwrite are evicted
    /// before the bytes are copied in.
    pub fn append(&mut self, data: &[u8], keyframe: bool, frame_end: bool) {
        self.header.seal();

        let frame_start = *self.frame_start.get_or_insert(self.ring.total_written());

        let after = self.ring.total_written() + data.len() as u64;
        let oldest_kept = after.saturating_sub(self.ring.capacity() as u64);
        let evicted = self.keyframes.evict_before(oldest_kept);
        if evicted > 0 {
            debug!("Evicted {} keyframe entries before overwrite", evicted);
        }

        self.ring.append(data);

        if keyframe {
            self.record_keyframe(frame_start);
        }
        if frame_end {
            self.frame_start = None;
        }
    }

    fn record_keyframe(&mut self, pos: u64) {
        if self.keyframes.newest() == Some(pos) {
            return;
        }
        if !self.ring.has_start_code_at(pos) {
            error!(
                "Error in keyframe list: no start code at stream position {} (slot {})",
                pos,
                self.ring.slot(pos)
            );
            return;
        }
        self.keyframes.record(pos);
    }

    /// Ring slot of the oldest keyframe that is still safe to replay from
    pub fn oldest_valid_keyframe(&self) -> Option<usize> {
        self.keyframes.oldest().map(|pos| self.ring.slot(pos))
    }

    /// Check every indexed keyframe still starts with a start code
    pub fn verify(&self) -> bool {
        self.keyframes.iter().all(|pos| self.ring.has_start_code_at(pos))
    }

    /// Write the header group followed by the ring contents from the oldest
    /// keyframe (or the oldest resident byte) to the write cursor.
    pub fn dump_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<usize> {
        let from = match self.keyframes.oldest() {
            Some(pos) => pos,
            None => {
                if !self.ring.is_empty() {
                    warn!("No keyframe in circular buffer, dumping from oldest byte");
                }
                self.ring.oldest_position()
            }
        };
        out.write_all(self.header.as_slice())?;
        let body = self.ring.write_from(from, out)?;
        out.flush()?;
        Ok(self.header.as_slice().len() + body)
    }
}
