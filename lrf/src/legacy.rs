//! Read-only access to legacy sector-based region files. The legacy format
//! is a pair of 4 KiB header tables (sector ranges and timestamps, both
//! big-endian) followed by chunks padded to 4 KiB sectors, each tagged with
//! gzip or zlib compression. The engine never writes this format; the
//! migrator and the auto-format resolver read it.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::{GzDecoder, ZlibDecoder};

use crate::coord::chunk_index;

/// Sector granularity of the legacy format.
const LEGACY_SECTOR: u64 = 4096;

/// Cached metadata of one legacy chunk, decoded from the header tables.
#[derive(Debug, Clone, Copy, Default)]
struct LegacyChunk {
    /// Offset of the first sector, in sectors.
    offset: u32,
    /// Number of sectors used, zero for an absent chunk.
    count: u32,
    /// Last save time, epoch seconds.
    timestamp: u32,
}

impl LegacyChunk {

    fn is_empty(self) -> bool {
        self.count == 0
    }

}

/// A handle to one legacy region file.
pub struct LegacyRegion {
    file: File,
    chunks: Box<[LegacyChunk; 1024]>,
}

impl LegacyRegion {

    /// Open a legacy region file, validating its size and both header
    /// tables. Every reported inconsistency leaves the file untouched; it
    /// is up to the caller to decide whether to discard it.
    pub fn open(path: &Path) -> Result<Self, LegacyError> {

        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        // Two 4 KiB header sectors are the minimum valid file.
        if len < LEGACY_SECTOR * 2 {
            return Err(LegacyError::FileTooSmall(len));
        }
        if len % LEGACY_SECTOR != 0 {
            return Err(LegacyError::FileNotPadded(len));
        }

        let total_sectors = len / LEGACY_SECTOR;
        let mut chunks = Box::new([LegacyChunk::default(); 1024]);

        file.seek(SeekFrom::Start(0))?;
        for chunk in chunks.iter_mut() {
            let raw = file.read_u32::<BigEndian>()?;
            chunk.offset = raw >> 8;
            chunk.count = raw & 0xFF;
            if !chunk.is_empty() {
                if chunk.offset < 2 || (chunk.offset + chunk.count) as u64 > total_sectors {
                    return Err(LegacyError::IllegalRange);
                }
            }
        }
        for chunk in chunks.iter_mut() {
            chunk.timestamp = file.read_u32::<BigEndian>()?;
        }

        Ok(Self { file, chunks })

    }

    fn chunk(&self, cx: i32, cz: i32) -> LegacyChunk {
        self.chunks[chunk_index(cx, cz)]
    }

    /// Number of chunks present in the file.
    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| !c.is_empty()).count()
    }

    pub fn has_chunk(&self, cx: i32, cz: i32) -> bool {
        !self.chunk(cx, cz).is_empty()
    }

    /// Last save time of the chunk in epoch seconds, none when absent.
    pub fn timestamp(&self, cx: i32, cz: i32) -> Option<u32> {
        let chunk = self.chunk(cx, cz);
        (!chunk.is_empty()).then_some(chunk.timestamp)
    }

    /// Read and decompress the chunk at the given position, or none when
    /// its slots are unallocated.
    pub fn read_chunk(&mut self, cx: i32, cz: i32) -> Result<Option<Vec<u8>>, LegacyError> {

        let chunk = self.chunk(cx, cz);
        if chunk.is_empty() {
            return Ok(None);
        }

        self.file.seek(SeekFrom::Start(chunk.offset as u64 * LEGACY_SECTOR))?;

        let size = self.file.read_i32::<BigEndian>()?;
        if size <= 0 || size as u64 + 4 > chunk.count as u64 * LEGACY_SECTOR {
            return Err(LegacyError::IllegalRange);
        }

        let compression_id = self.file.read_u8()?;
        // The stored size counts the compression id byte.
        let data = Read::take(&mut self.file, size as u64 - 1);

        let mut payload = Vec::new();
        match compression_id {
            1 => decompress_into(GzDecoder::new(data), &mut payload)?,
            2 => decompress_into(ZlibDecoder::new(data), &mut payload)?,
            other => return Err(LegacyError::IllegalCompression(other)),
        }

        Ok(Some(payload))

    }

}

fn decompress_into<R: Read>(mut decoder: R, out: &mut Vec<u8>) -> Result<(), LegacyError> {
    decoder.read_to_end(out)
        .map(|_| ())
        .map_err(LegacyError::Corrupt)
}

/// Error type for legacy region access.
#[derive(thiserror::Error, Debug)]
pub enum LegacyError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("the file is too short ({0} bytes) for its two header sectors")]
    FileTooSmall(u64),
    #[error("the file size ({0}) is not a multiple of 4 KiB")]
    FileNotPadded(u64),
    #[error("a chunk's sector range is out of bounds or collides with the header")]
    IllegalRange,
    #[error("unknown legacy compression id {0}")]
    IllegalCompression(u8),
    #[error("corrupt legacy chunk stream: {0}")]
    Corrupt(io::Error),
}

#[cfg(test)]
pub(crate) mod testutil {

    use std::io::Write;
    use std::path::Path;

    use byteorder::{BigEndian, ByteOrder};
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use crate::coord::chunk_index;

    /// Write a minimal legacy region file containing the given chunks,
    /// zlib-compressed, with sequentially allocated sectors.
    pub fn write_legacy_region(path: &Path, chunks: &[(i32, i32, Vec<u8>, u32)]) {

        let mut offsets = [0u8; 4096];
        let mut timestamps = [0u8; 4096];
        let mut body: Vec<u8> = Vec::new();
        let mut next_sector = 2u32;

        for (cx, cz, payload, timestamp) in chunks {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload).unwrap();
            let compressed = encoder.finish().unwrap();

            let chunk_len = compressed.len() + 5;
            let sectors = (chunk_len as u32).div_ceil(4096);

            let mut sector_bytes = vec![0u8; (sectors * 4096) as usize];
            BigEndian::write_i32(&mut sector_bytes[0..4], compressed.len() as i32 + 1);
            sector_bytes[4] = 2;
            sector_bytes[5..5 + compressed.len()].copy_from_slice(&compressed);
            body.extend_from_slice(&sector_bytes);

            let index = chunk_index(*cx, *cz);
            BigEndian::write_u32(
                &mut offsets[index * 4..index * 4 + 4],
                next_sector << 8 | sectors,
            );
            BigEndian::write_u32(&mut timestamps[index * 4..index * 4 + 4], *timestamp);
            next_sector += sectors;
        }

        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&offsets).unwrap();
        file.write_all(&timestamps).unwrap();
        file.write_all(&body).unwrap();

    }

}
