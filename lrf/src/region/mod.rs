//! The region file substrate: header and slot table, shared per-file
//! resource, flush barrier, and the reader/writer pair operating on chunk
//! frames.
//!
//! A region file is a fixed 8 KiB header followed by chunk frames, each
//! aligned to 4 KiB. A frame is `length:u32 || ctype:u8 || payload ||
//! timestamp_ms:i64`, all little-endian, where `length` counts every byte of
//! the frame including itself.

pub mod header;
pub mod barrier;
pub mod resource;
pub mod reader;
pub mod writer;

pub use header::{RegionHeader, SlotEntry, HeaderError, HEADER_SIZE};
pub use barrier::FlushBarrier;
pub use resource::RegionResource;
pub use reader::RegionReader;
pub use writer::{RegionWriter, EncodedChunk};

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::CodecError;

/// Alignment of every chunk frame within the file, chosen to match the OS
/// page size so mmap reads never straddle a partially cached page pair.
pub const FRAME_ALIGN: u64 = 4096;

/// Bytes of the frame preceding the payload: `length:u32 || ctype:u8`.
pub const FRAME_HEAD_LEN: usize = 5;

/// Bytes of the trailing per-frame timestamp.
pub const FRAME_TAIL_LEN: usize = 8;

/// Largest encodable frame, bounded by the 24-bit slot size field.
pub const MAX_FRAME_LEN: usize = (1 << 24) - 1;

/// A parsed view over the raw bytes of one chunk frame.
pub struct FrameView<'a> {
    /// On-disk compression code of the payload.
    pub ctype: u8,
    /// The compressed payload bytes.
    pub payload: &'a [u8],
    /// Tail timestamp, absent for frames written by pre-tail tooling where
    /// the timestamp still sits inside the compressed payload.
    pub timestamp_ms: Option<i64>,
}

/// Parse a frame from the start of `buf`. `tail_in_frame` reflects the slot
/// flag recorded at write time: newer frames carry the timestamp after the
/// payload, older ones compressed it into the payload itself.
pub fn parse_frame(buf: &[u8], tail_in_frame: bool, offset: u64) -> Result<FrameView<'_>, RegionError> {
    if buf.len() < FRAME_HEAD_LEN {
        return Err(RegionError::FrameMalformed { offset, reason: "frame shorter than its fixed head" });
    }
    let length = LittleEndian::read_u32(&buf[0..4]) as usize;
    if length < FRAME_HEAD_LEN {
        return Err(RegionError::FrameMalformed { offset, reason: "declared length below minimum" });
    }
    if length > buf.len() {
        return Err(RegionError::FrameMalformed { offset, reason: "declared length exceeds slot size" });
    }
    let ctype = buf[4];
    if tail_in_frame {
        if length < FRAME_HEAD_LEN + FRAME_TAIL_LEN {
            return Err(RegionError::FrameMalformed { offset, reason: "declared length below minimum" });
        }
        let payload = &buf[FRAME_HEAD_LEN..length - FRAME_TAIL_LEN];
        let timestamp_ms = LittleEndian::read_i64(&buf[length - FRAME_TAIL_LEN..length]);
        Ok(FrameView { ctype, payload, timestamp_ms: Some(timestamp_ms) })
    } else {
        Ok(FrameView { ctype, payload: &buf[FRAME_HEAD_LEN..length], timestamp_ms: None })
    }
}

/// Error type shared by every operation on the region substrate.
#[derive(thiserror::Error, Debug)]
pub enum RegionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("header: {0}")]
    Header(#[from] HeaderError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("malformed frame at offset {offset}: {reason}")]
    FrameMalformed { offset: u64, reason: &'static str },
    #[error("payload checksum mismatch for chunk {cx}/{cz}")]
    CorruptedPayload { cx: i32, cz: i32 },
    #[error("frame of {0} bytes exceeds the maximum encodable size")]
    FrameTooLarge(usize),
    #[error("region resource {0}")]
    Unsupported(&'static str),
}
