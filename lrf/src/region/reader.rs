//! Random-access chunk reads against one region file, through the mapping
//! when it covers the slot and through the file channel otherwise. Reads
//! split into a fetch stage under the flush barrier and a decode stage that
//! holds no lock, so decompression never stalls writers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::codec::{self, CompressionKind};
use crate::coord::{chunk_index, region_of_chunk};
use crate::integrity::IntegrityValidator;
use crate::util::LogGate;

use super::resource::RegionResource;
use super::{parse_frame, RegionError, FRAME_TAIL_LEN};

/// Channel-read retry policy for transient failures while a file is being
/// extended underneath us.
const READ_ATTEMPTS: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

/// A decoded chunk payload together with its write timestamp.
pub struct ChunkPayload {
    pub data: Vec<u8>,
    pub timestamp_ms: i64,
}

/// The raw bytes of one chunk slot, fetched under the barrier and decoded
/// outside of it.
pub struct RawFrame {
    cx: i32,
    cz: i32,
    bytes: Vec<u8>,
    tail_in_frame: bool,
    offset: u64,
}

/// Reader over one shared region resource.
pub struct RegionReader {
    res: Arc<RegionResource>,
    pool: Arc<BufferPool>,
    integrity: Option<Arc<IntegrityValidator>>,
    log_gate: Option<Arc<LogGate>>,
}

impl RegionReader {

    pub fn new(res: Arc<RegionResource>, pool: Arc<BufferPool>) -> Self {
        Self { res, pool, integrity: None, log_gate: None }
    }

    /// Attach read-time checksum validation.
    pub fn with_integrity(mut self, integrity: Arc<IntegrityValidator>) -> Self {
        self.integrity = Some(integrity);
        self
    }

    /// Attach the shared gate that limits decode-failure logging to one
    /// line per error class, region and minute.
    pub fn with_log_gate(mut self, gate: Arc<LogGate>) -> Self {
        self.log_gate = Some(gate);
        self
    }

    /// Log a decode failure with enough coordinates and offsets for
    /// forensics, suppressing repeats within the gate window.
    fn report(&self, kind: &'static str, cx: i32, cz: i32, offset: u64, error: &RegionError) {
        let (rx, rz) = region_of_chunk(cx, cz);
        let open = self.log_gate.as_ref()
            .map(|gate| gate.should_log(kind, rx, rz))
            .unwrap_or(true);
        if open {
            warn!(
                "chunk {cx}/{cz} in {} at offset {offset}: {error}",
                self.res.path().display(),
            );
        }
    }

    #[inline]
    pub fn resource(&self) -> &Arc<RegionResource> {
        &self.res
    }

    pub fn has_chunk(&self, cx: i32, cz: i32) -> Result<bool, RegionError> {
        Ok(self.res.header()?.has_chunk(cx, cz))
    }

    /// Read and decode the chunk at the given coordinates, or none if its
    /// slot is empty.
    pub fn read_chunk(&self, cx: i32, cz: i32) -> Result<Option<Vec<u8>>, RegionError> {
        Ok(self.read_chunk_full(cx, cz)?.map(|p| p.data))
    }

    /// Timestamp of the last write to the chunk, in ms since the epoch.
    pub fn chunk_timestamp(&self, cx: i32, cz: i32) -> Result<Option<i64>, RegionError> {
        Ok(self.read_chunk_full(cx, cz)?.map(|p| p.timestamp_ms))
    }

    /// Fetch plus decode in one call.
    pub fn read_chunk_full(&self, cx: i32, cz: i32) -> Result<Option<ChunkPayload>, RegionError> {
        match self.fetch_frame(cx, cz)? {
            None => Ok(None),
            Some(raw) => self.decode_frame(raw).map(Some),
        }
    }

    /// Fetch the raw slot bytes for a chunk under the flush barrier,
    /// preferring a mmap slice over the channel. No decompression happens
    /// here.
    pub fn fetch_frame(&self, cx: i32, cz: i32) -> Result<Option<RawFrame>, RegionError> {

        let _pass = self.res.barrier().before_read();

        let header = self.res.header()?;
        let slot = header.slot(cx, cz);
        if slot.is_empty() {
            return Ok(None);
        }

        let offset = slot.byte_offset();
        let size = slot.size as usize;

        let mut bytes = self.pool.acquire(size);
        bytes.resize(size, 0);

        let end = offset + size as u64;
        if let Some(map) = self.res.mapped(end)? {
            bytes.copy_from_slice(&map[offset as usize..end as usize]);
        } else {
            self.channel_read(offset, &mut bytes)?;
        }

        Ok(Some(RawFrame { cx, cz, bytes, tail_in_frame: slot.tail_timestamp(), offset }))

    }

    /// Channel fallback with bounded retry; a reader can briefly race a
    /// file extension on some platforms.
    fn channel_read(&self, offset: u64, buf: &mut [u8]) -> Result<(), RegionError> {
        let mut attempt = 0;
        loop {
            match self.res.read_at(offset, buf) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= READ_ATTEMPTS {
                        return Err(RegionError::Io(e));
                    }
                    debug!("retrying channel read at {offset} after {e}");
                    thread::sleep(READ_RETRY_DELAY);
                }
            }
        }
    }

    /// Validate, decompress and split the timestamp off a fetched frame.
    /// Runs without any lock held.
    pub fn decode_frame(&self, raw: RawFrame) -> Result<ChunkPayload, RegionError> {
        let result = self.decode_inner(&raw);
        if let Err(e) = &result {
            let kind = match e {
                RegionError::CorruptedPayload { .. } => "corrupted-payload",
                RegionError::FrameMalformed { .. } => "frame-malformed",
                RegionError::Codec(_) => "decompress",
                _ => "read",
            };
            self.report(kind, raw.cx, raw.cz, raw.offset, e);
        }
        self.pool.release(raw.bytes);
        result
    }

    fn decode_inner(&self, raw: &RawFrame) -> Result<ChunkPayload, RegionError> {

        let view = parse_frame(&raw.bytes, raw.tail_in_frame, raw.offset)?;
        let frame_len = LittleEndian::read_u32(&raw.bytes[0..4]) as usize;

        if let Some(integrity) = &self.integrity {
            if !integrity.check(self.res.path(), chunk_index(raw.cx, raw.cz), &raw.bytes[..frame_len]) {
                return Err(RegionError::CorruptedPayload { cx: raw.cx, cz: raw.cz });
            }
        }

        let kind = CompressionKind::from_code(view.ctype)
            .ok_or(codec::CodecError::UnknownAlgorithm(view.ctype))?;
        let mut data = codec::decompress_lenient(view.payload, kind)?;

        let timestamp_ms = match view.timestamp_ms {
            Some(ts) => ts,
            None => {
                // Pre-tail layout: the timestamp rides at the end of the
                // raw payload, under the compression.
                if data.len() < FRAME_TAIL_LEN {
                    return Err(RegionError::FrameMalformed {
                        offset: raw.offset,
                        reason: "legacy frame too short for its embedded timestamp",
                    });
                }
                let at = data.len() - FRAME_TAIL_LEN;
                let ts = LittleEndian::read_i64(&data[at..]);
                data.truncate(at);
                ts
            }
        };

        Ok(ChunkPayload { data, timestamp_ms })

    }

    /// Touch the first byte of the chunk's frame so the OS pulls the page
    /// into cache, without decompressing anything. Skipped entirely when a
    /// writer holds the barrier.
    pub fn warm_touch(&self, cx: i32, cz: i32) -> Result<(), RegionError> {
        let Some(_pass) = self.res.barrier().try_before_read() else {
            return Ok(());
        };
        let header = self.res.header()?;
        let slot = header.slot(cx, cz);
        if slot.is_empty() {
            return Ok(());
        }
        let offset = slot.byte_offset();
        if let Some(map) = self.res.mapped(offset + 1)? {
            std::hint::black_box(map[offset as usize]);
        } else {
            let mut byte = [0u8; 1];
            self.res.read_at(offset, &mut byte)?;
        }
        Ok(())
    }

}
