//! Fixed-size region file header: magic, global compression code and the
//! 1024-entry slot table addressing every chunk frame in the file.

use byteorder::{ByteOrder, LittleEndian};

use crate::codec::CompressionKind;
use crate::coord::{chunk_index, REGION_CHUNKS};
use crate::util::align_up;

use super::FRAME_ALIGN;

/// Total size of the on-disk header. The first chunk frame starts right
/// after it, already aligned.
pub const HEADER_SIZE: usize = 8192;

/// Granularity of slot offsets. 24 bits of sector offset address 4 GiB.
pub const SECTOR: u64 = 256;

/// ASCII identifier of the format, followed by the one-byte version.
pub const MAGIC: [u8; 7] = *b"LRFREGN";

/// Current format version.
pub const VERSION: u8 = 1;

/// Slot flag: the frame carries its timestamp after the payload. Frames
/// written by pre-tail tooling compressed the timestamp into the payload and
/// leave this bit clear.
pub const FLAG_TAIL_TIMESTAMP: u8 = 0x01;

const SLOT_LEN: usize = 7;
const SLOTS_OFFSET: usize = 24;
const CRC_OFFSET: usize = HEADER_SIZE - 4;

/// One entry of the slot table: where the chunk frame lives, how many bytes
/// its slot spans, and per-slot flags. An all-zero entry is the empty
/// sentinel; a real frame can never sit at offset zero because the header
/// occupies it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotEntry {
    /// Offset of the frame in 256-byte sectors.
    pub offset_sectors: u32,
    /// Size of the slot in bytes. At least the frame's declared length, and
    /// possibly larger after an in-place overwrite.
    pub size: u32,
    /// Slot flags, see [`FLAG_TAIL_TIMESTAMP`].
    pub flags: u8,
}

impl SlotEntry {

    #[inline]
    pub fn is_empty(self) -> bool {
        self.offset_sectors == 0 && self.size == 0
    }

    /// Byte offset of the frame within the region file.
    #[inline]
    pub fn byte_offset(self) -> u64 {
        self.offset_sectors as u64 * SECTOR
    }

    #[inline]
    pub fn tail_timestamp(self) -> bool {
        self.flags & FLAG_TAIL_TIMESTAMP != 0
    }

}

/// In-memory form of the region header. Mutated by the writer under the
/// exclusive side of the flush barrier, then serialized back to offset 0.
#[derive(Clone)]
pub struct RegionHeader {
    /// Global compression code for new writes to this file.
    compression_code: u32,
    /// Number of non-empty slots.
    chunk_count: u32,
    slots: Box<[SlotEntry; REGION_CHUNKS]>,
}

impl RegionHeader {

    /// Create the header of an empty region file.
    pub fn new(compression: CompressionKind) -> Self {
        Self {
            compression_code: compression.code() as u32,
            chunk_count: 0,
            slots: Box::new([SlotEntry::default(); REGION_CHUNKS]),
        }
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of a region file.
    pub fn parse(bytes: &[u8]) -> Result<Self, HeaderError> {

        if bytes.len() < HEADER_SIZE {
            return Err(HeaderError::TruncatedHeader(bytes.len()));
        }
        if bytes[0..7] != MAGIC {
            return Err(HeaderError::InvalidMagic);
        }
        let version = bytes[7];
        if version != VERSION {
            return Err(HeaderError::UnsupportedVersion(version));
        }

        // A zero CRC marks a file written before the field existed.
        let stored_crc = LittleEndian::read_u32(&bytes[CRC_OFFSET..HEADER_SIZE]);
        if stored_crc != 0 {
            let computed = crc32c::crc32c(&bytes[..CRC_OFFSET]);
            if computed != stored_crc {
                return Err(HeaderError::CrcMismatch { stored: stored_crc, computed });
            }
        }

        let chunk_count = LittleEndian::read_u32(&bytes[16..20]);
        let compression_code = LittleEndian::read_u32(&bytes[20..24]);

        let mut slots = Box::new([SlotEntry::default(); REGION_CHUNKS]);
        for (i, slot) in slots.iter_mut().enumerate() {
            let at = SLOTS_OFFSET + i * SLOT_LEN;
            *slot = SlotEntry {
                offset_sectors: LittleEndian::read_u24(&bytes[at..at + 3]),
                size: LittleEndian::read_u24(&bytes[at + 3..at + 6]),
                flags: bytes[at + 6],
            };
            if !slot.is_empty() && slot.byte_offset() < HEADER_SIZE as u64 {
                return Err(HeaderError::IllegalSlot(i));
            }
        }

        Ok(Self { compression_code, chunk_count, slots })

    }

    /// Serialize to exactly [`HEADER_SIZE`] bytes, including the tail CRC.
    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..7].copy_from_slice(&MAGIC);
        bytes[7] = VERSION;
        LittleEndian::write_u32(&mut bytes[16..20], self.chunk_count);
        LittleEndian::write_u32(&mut bytes[20..24], self.compression_code);
        for (i, slot) in self.slots.iter().enumerate() {
            let at = SLOTS_OFFSET + i * SLOT_LEN;
            LittleEndian::write_u24(&mut bytes[at..at + 3], slot.offset_sectors);
            LittleEndian::write_u24(&mut bytes[at + 3..at + 6], slot.size);
            bytes[at + 6] = slot.flags;
        }
        let crc = crc32c::crc32c(&bytes[..CRC_OFFSET]);
        LittleEndian::write_u32(&mut bytes[CRC_OFFSET..HEADER_SIZE], crc);
        bytes
    }

    /// Global compression for new writes, falling back to fast when the code
    /// is unknown.
    pub fn compression(&self) -> CompressionKind {
        u8::try_from(self.compression_code).ok()
            .and_then(CompressionKind::from_code)
            .unwrap_or(CompressionKind::Fast)
    }

    #[inline]
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    #[inline]
    pub fn slot(&self, cx: i32, cz: i32) -> SlotEntry {
        self.slots[chunk_index(cx, cz)]
    }

    #[inline]
    pub fn slot_at(&self, index: usize) -> SlotEntry {
        self.slots[index]
    }

    #[inline]
    pub fn has_chunk(&self, cx: i32, cz: i32) -> bool {
        !self.slot(cx, cz).is_empty()
    }

    /// Install a slot entry, keeping the chunk count coherent.
    pub fn set_slot(&mut self, cx: i32, cz: i32, entry: SlotEntry) {
        let slot = &mut self.slots[chunk_index(cx, cz)];
        match (slot.is_empty(), entry.is_empty()) {
            (true, false) => self.chunk_count += 1,
            (false, true) => self.chunk_count -= 1,
            _ => {}
        }
        *slot = entry;
    }

    /// Choose the offset for a frame of `frame_len` bytes destined for the
    /// given chunk. The existing slot is reused in place when it is large
    /// enough, otherwise the frame goes to the next aligned offset at or
    /// past the current end of file. Append-only allocation keeps the format
    /// free of fragmentation bookkeeping; a defragmentation pass can rewrite
    /// the file wholesale if growth ever matters.
    pub fn allocate_slot(&self, cx: i32, cz: i32, frame_len: usize, file_len: u64) -> Result<Allocation, HeaderError> {
        let existing = self.slot(cx, cz);
        if !existing.is_empty() && existing.size as usize >= frame_len {
            return Ok(Allocation { offset: existing.byte_offset(), in_place: true });
        }
        let offset = align_up(file_len.max(HEADER_SIZE as u64), FRAME_ALIGN);
        if offset / SECTOR > 0xFF_FFFF {
            return Err(HeaderError::FileFull(offset));
        }
        Ok(Allocation { offset, in_place: false })
    }

}

/// Result of [`RegionHeader::allocate_slot`].
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// Byte offset the frame must be written at, always sector and frame
    /// aligned.
    pub offset: u64,
    /// True when the frame overwrites the existing slot in place.
    pub in_place: bool,
}

/// Error type for header parsing and slot allocation.
#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    #[error("the header magic does not identify an LRF region file")]
    InvalidMagic,
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("the header is truncated at {0} bytes")]
    TruncatedHeader(usize),
    #[error("header crc mismatch, stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },
    #[error("slot {0} points inside the header")]
    IllegalSlot(usize),
    #[error("the region file cannot address offset {0} with sector-granular slots")]
    FileFull(u64),
}
