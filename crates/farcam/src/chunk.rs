//! Encoded buffer deliveries from the producer

use bytes::Bytes;
use std::fmt;

/// Flag set carried by every delivered chunk.
///
/// Flags combine freely; an empty set is an ordinary payload chunk.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChunkFlags(pub u8);

impl ChunkFlags {
    /// Codec header / parameter sets (SPS, PPS)
    pub const CONFIG: u8 = 0b0000_0001;
    /// Chunk belongs to a self-decodable frame
    pub const KEYFRAME: u8 = 0b0000_0010;
    /// Last chunk of a frame
    pub const FRAME_END: u8 = 0b0000_0100;
    /// Codec side information (inline motion vectors)
    pub const SIDE_INFO: u8 = 0b0000_1000;
    /// Producer gave up on this frame
    pub const TRANSMISSION_FAILED: u8 = 0b0001_0000;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }

    pub fn contains(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn is_config(&self) -> bool {
        self.contains(Self::CONFIG)
    }

    pub fn is_keyframe(&self) -> bool {
        self.contains(Self::KEYFRAME)
    }

    pub fn is_frame_end(&self) -> bool {
        self.contains(Self::FRAME_END)
    }

    pub fn is_side_info(&self) -> bool {
        self.contains(Self::SIDE_INFO)
    }

    pub fn is_transmission_failed(&self) -> bool {
        self.contains(Self::TRANSMISSION_FAILED)
    }
}

impl fmt::Debug for ChunkFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::CONFIG, "CONFIG"),
            (Self::KEYFRAME, "KEYFRAME"),
            (Self::FRAME_END, "FRAME_END"),
            (Self::SIDE_INFO, "SIDE_INFO"),
            (Self::TRANSMISSION_FAILED, "TRANSMISSION_FAILED"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "ChunkFlags(NONE)")
        } else {
            write!(f, "ChunkFlags({})", set.join("|"))
        }
    }
}

/// One delivery unit of encoded bytes.
///
/// The producer owns the storage; consumers borrow the chunk for the duration
/// of a callback and hand it back through [`ProducerPort::release`].
///
/// [`ProducerPort::release`]: crate::port::ProducerPort::release
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Encoded bytes as delivered
    pub data: Bytes,
    /// Flag set
    pub flags: ChunkFlags,
    /// Presentation timestamp in microseconds, if the producer knows it
    pub pts: Option<i64>,
}

impl Chunk {
    pub fn new(data: Bytes, flags: ChunkFlags) -> Self {
        Self {
            data,
            flags,
            pts: None,
        }
    }

    /// Set the presentation timestamp and return self (builder pattern)
    pub fn with_pts(mut self, pts_us: i64) -> Self {
        self.pts = Some(pts_us);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
