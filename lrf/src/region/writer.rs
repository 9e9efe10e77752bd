//! Append-oriented chunk writer: aligned frame placement, explicit zero
//! padding of gaps, in-place header update and the smart force policy.

use std::fs::File;
use std::io::{IoSlice, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::codec::{self, CompressionKind};
use crate::coord::chunk_index;

use super::header::{SlotEntry, FLAG_TAIL_TIMESTAMP, SECTOR};
use super::resource::RegionResource;
use super::{RegionError, FRAME_HEAD_LEN, FRAME_TAIL_LEN, MAX_FRAME_LEN};

/// Interval after which a completing batch forces to disk regardless of its
/// size. Bounds post-crash data loss to this window.
const FORCE_INTERVAL: Duration = Duration::from_secs(2);

/// A zeroed page for explicit gap padding. Seeking past the end of file is
/// not guaranteed to read back as zeros everywhere, so gaps are written out.
const ZERO_PAGE: &[u8; 4096] = &[0; 4096];

/// A chunk compressed and framed, ready for an aligned append. The tail
/// timestamp is kept separate so the frame can go out as one gathering
/// write.
pub struct EncodedChunk {
    pub cx: i32,
    pub cz: i32,
    /// `length:u32 || ctype:u8 || compressed payload`.
    body: Vec<u8>,
    /// `timestamp_ms:i64` little-endian.
    tail: [u8; 8],
}

impl EncodedChunk {

    /// Compress and frame a payload. Compression that does not strictly
    /// shrink the payload is discarded for a none-tagged frame.
    pub fn encode(
        cx: i32,
        cz: i32,
        payload: &[u8],
        kind: CompressionKind,
        level: u32,
        timestamp_ms: i64,
    ) -> Result<Self, RegionError> {

        let compressed = codec::compress(payload, kind, level)?;
        let (kind, data) = if kind != CompressionKind::None && compressed.len() >= payload.len() {
            (CompressionKind::None, payload.to_vec())
        } else {
            (kind, compressed)
        };

        let frame_len = FRAME_HEAD_LEN + data.len() + FRAME_TAIL_LEN;
        if frame_len > MAX_FRAME_LEN {
            return Err(RegionError::FrameTooLarge(frame_len));
        }

        let mut body = Vec::with_capacity(FRAME_HEAD_LEN + data.len());
        body.extend_from_slice(&(frame_len as u32).to_le_bytes());
        body.push(kind.code());
        body.extend_from_slice(&data);

        let mut tail = [0u8; 8];
        LittleEndian::write_i64(&mut tail, timestamp_ms);

        Ok(Self { cx, cz, body, tail })

    }

    /// Total on-disk length of the frame.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        self.body.len() + FRAME_TAIL_LEN
    }

    /// CRC32C over the full frame bytes, the value the integrity ledger
    /// records.
    pub fn frame_crc(&self) -> u32 {
        crc32c::crc32c_append(crc32c::crc32c(&self.body), &self.tail)
    }

}

/// Result of one appended chunk, reported to post-flush hooks.
#[derive(Debug, Clone, Copy)]
pub struct WrittenChunk {
    pub cx: i32,
    pub cz: i32,
    pub offset: u64,
    pub frame_len: usize,
    pub index: usize,
}

/// Outcome of a batch append.
pub struct BatchOutcome {
    pub written: Vec<WrittenChunk>,
    /// Whether this batch was forced to disk.
    pub forced: bool,
}

/// Writer over one shared region resource. All methods serialize through
/// the resource's flush barrier; the storage layer additionally guarantees
/// one batch in flight per region.
pub struct RegionWriter {
    res: Arc<RegionResource>,
    compression: CompressionKind,
    level: u32,
    /// Batch size threshold of the enclosing batch writer, for the force
    /// policy.
    batch_threshold: usize,
}

impl RegionWriter {

    pub fn new(res: Arc<RegionResource>, compression: CompressionKind, level: u32, batch_threshold: usize) -> Self {
        Self { res, compression, level, batch_threshold }
    }

    #[inline]
    pub fn resource(&self) -> &Arc<RegionResource> {
        &self.res
    }

    #[inline]
    pub fn compression(&self) -> CompressionKind {
        self.compression
    }

    /// Compress and append a single chunk, forcing per the usual policy.
    pub fn append_chunk(&self, cx: i32, cz: i32, payload: &[u8], timestamp_ms: i64) -> Result<(), RegionError> {
        let chunk = EncodedChunk::encode(cx, cz, payload, self.compression, self.level, timestamp_ms)?;
        self.append_batch(vec![chunk])?;
        Ok(())
    }

    /// Append a batch of pre-encoded frames under one exclusive barrier
    /// pass: place each frame, rewrite the header, apply the force policy
    /// and publish the new header before releasing.
    pub fn append_batch(&self, chunks: Vec<EncodedChunk>) -> Result<BatchOutcome, RegionError> {

        if chunks.is_empty() {
            return Ok(BatchOutcome { written: Vec::new(), forced: false });
        }

        let pass = self.res.barrier().before_flush();

        let mut header = (*self.res.header()?).clone();
        let mut written = Vec::with_capacity(chunks.len());

        {
            let mut file = self.res.file();
            let mut file_len = file.metadata()?.len();

            for chunk in &chunks {

                let frame_len = chunk.encoded_len();
                let alloc = header.allocate_slot(chunk.cx, chunk.cz, frame_len, file_len)?;

                if !alloc.in_place && alloc.offset > file_len {
                    pad_zeros(&mut file, file_len, alloc.offset)?;
                }

                file.seek(SeekFrom::Start(alloc.offset))?;
                write_gathered(&mut file, &chunk.body, &chunk.tail)?;

                let existing = header.slot(chunk.cx, chunk.cz);
                let size = if alloc.in_place { existing.size } else { frame_len as u32 };
                header.set_slot(chunk.cx, chunk.cz, SlotEntry {
                    offset_sectors: (alloc.offset / SECTOR) as u32,
                    size,
                    flags: FLAG_TAIL_TIMESTAMP,
                });

                file_len = file_len.max(alloc.offset + frame_len as u64);
                written.push(WrittenChunk {
                    cx: chunk.cx,
                    cz: chunk.cz,
                    offset: alloc.offset,
                    frame_len,
                    index: chunk_index(chunk.cx, chunk.cz),
                });

            }

            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.serialize())?;

            let forced = self.res.force_due(FORCE_INTERVAL)
                || chunks.len() * 2 >= self.batch_threshold.max(1);
            if forced {
                pass.force(&file)?;
                self.res.note_forced();
            }

            self.res.publish_header(header);
            trace!("appended {} frames to {}", written.len(), self.res.path().display());

            drop(file);
            drop(pass);

            Ok(BatchOutcome { written, forced })
        }

    }

}

/// Explicitly write zeros over `[from, to)`.
fn pad_zeros(file: &mut File, from: u64, to: u64) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(from))?;
    let mut remaining = (to - from) as usize;
    while remaining > 0 {
        let n = remaining.min(ZERO_PAGE.len());
        file.write_all(&ZERO_PAGE[..n])?;
        remaining -= n;
    }
    Ok(())
}

/// Write `body` then `tail` as a single gathering write where the platform
/// allows, falling back to sequential writes for any partially written
/// remainder.
fn write_gathered(file: &mut File, body: &[u8], tail: &[u8]) -> std::io::Result<()> {
    let total = body.len() + tail.len();
    let mut done = match file.write_vectored(&[IoSlice::new(body), IoSlice::new(tail)]) {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => 0,
        Err(e) => return Err(e),
    };
    while done < total {
        if done < body.len() {
            file.write_all(&body[done..])?;
            done = body.len();
        } else {
            file.write_all(&tail[done - body.len()..])?;
            done = total;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {

    use crate::buffer::BufferPool;
    use crate::region::reader::RegionReader;
    use crate::region::header::HEADER_SIZE;
    use crate::region::FRAME_ALIGN;

    use super::*;

    fn open_pair(dir: &std::path::Path, name: &str) -> (RegionWriter, RegionReader) {
        let path = dir.join(name);
        let res = RegionResource::open(&path, true, true, CompressionKind::Fast).unwrap();
        let writer = RegionWriter::new(Arc::clone(&res), CompressionKind::Fast, 6, 64);
        let reader = RegionReader::new(res, Arc::new(BufferPool::new()));
        (writer, reader)
    }

    use super::super::resource::RegionResource;

    #[test]
    fn fresh_region_single_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_pair(dir.path(), "r.0.0.lrf");

        let payload: Vec<u8> = [0xAB, 0xCD].repeat(1024);
        writer.append_chunk(5, 7, &payload, 1234).unwrap();

        // First frame lands right after the header.
        let header = writer.resource().header().unwrap();
        assert_eq!(header.slot(5, 7).byte_offset(), HEADER_SIZE as u64);
        assert_eq!(header.chunk_count(), 1);

        // A fresh reader over the same file observes the payload.
        assert_eq!(reader.read_chunk(5, 7).unwrap().unwrap(), payload);
        assert_eq!(reader.chunk_timestamp(5, 7).unwrap(), Some(1234));
        assert!(reader.read_chunk(6, 7).unwrap().is_none());
    }

    #[test]
    fn overwrite_in_place_or_append() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_pair(dir.path(), "r.0.0.lrf");

        let big: Vec<u8> = (0u8..=255).cycle().take(8192).collect();
        writer.append_chunk(5, 7, &big, 1).unwrap();
        let first = writer.resource().header().unwrap().slot(5, 7);

        // A small overwrite fits in place.
        let small = vec![0u8; 16];
        writer.append_chunk(5, 7, &small, 2).unwrap();
        let second = writer.resource().header().unwrap().slot(5, 7);
        assert_eq!(second.byte_offset(), first.byte_offset());
        assert_eq!(second.size, first.size);
        assert_eq!(reader.read_chunk(5, 7).unwrap().unwrap(), small);

        // An incompressible overwrite larger than the slot is appended at
        // the next aligned offset, and the old contents are unreachable.
        let mut huge = vec![0u8; first.size as usize * 4];
        for (i, b) in huge.iter_mut().enumerate() {
            *b = (i as u32).wrapping_mul(2654435761).to_le_bytes()[0] ^ (i >> 3) as u8;
        }
        writer.append_chunk(5, 7, &huge, 3).unwrap();
        let third = writer.resource().header().unwrap().slot(5, 7);
        assert_ne!(third.byte_offset(), first.byte_offset());
        assert_eq!(third.byte_offset() % FRAME_ALIGN, 0);
        assert_eq!(reader.read_chunk(5, 7).unwrap().unwrap(), huge);
    }

    #[test]
    fn every_frame_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = open_pair(dir.path(), "r.0.0.lrf");

        for i in 0..20 {
            let payload = vec![i as u8; 100 + i * 371];
            writer.append_chunk(i as i32, 0, &payload, i as i64).unwrap();
        }

        let header = writer.resource().header().unwrap();
        for i in 0..20 {
            let slot = header.slot(i, 0);
            assert!(!slot.is_empty());
            assert_eq!(slot.byte_offset() % FRAME_ALIGN, 0);
        }
        assert_eq!(header.chunk_count(), 20);
    }

    #[test]
    fn zero_length_payload() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_pair(dir.path(), "r.0.0.lrf");
        writer.append_chunk(0, 0, &[], 77).unwrap();
        assert_eq!(reader.read_chunk(0, 0).unwrap().unwrap(), Vec::<u8>::new());
        assert_eq!(reader.chunk_timestamp(0, 0).unwrap(), Some(77));
    }

    #[test]
    fn incompressible_payload_stored_verbatim() {
        let payload: Vec<u8> = (0..4096u32)
            .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
            .collect();
        let chunk = EncodedChunk::encode(0, 0, &payload, CompressionKind::Fast, 6, 0).unwrap();
        // A none-tagged frame is exactly head + payload + tail.
        assert_eq!(chunk.encoded_len(), FRAME_HEAD_LEN + payload.len() + FRAME_TAIL_LEN);
        assert_eq!(chunk.body[4], CompressionKind::None.code());
    }

    #[test]
    fn batch_append_reports_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_pair(dir.path(), "r.0.0.lrf");

        let chunks = (0..4)
            .map(|i| EncodedChunk::encode(i, 1, &vec![i as u8 + 1; 2000], CompressionKind::Fast, 6, 50 + i as i64).unwrap())
            .collect();
        let outcome = writer.append_batch(chunks).unwrap();
        assert_eq!(outcome.written.len(), 4);

        let header = writer.resource().header().unwrap();
        for w in &outcome.written {
            let slot = header.slot(w.cx, w.cz);
            assert_eq!(slot.byte_offset(), w.offset);
            assert!(slot.size as usize >= w.frame_len);
            assert_eq!(reader.read_chunk(w.cx, w.cz).unwrap().unwrap(), vec![w.cx as u8 + 1; 2000]);
        }
    }

    #[test]
    fn max_payload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = open_pair(dir.path(), "r.0.0.lrf");
        let payload = vec![0x5A; 1 << 20];
        writer.append_chunk(9, 9, &payload, 0).unwrap();
        assert_eq!(reader.read_chunk(9, 9).unwrap().unwrap(), payload);
    }

}
