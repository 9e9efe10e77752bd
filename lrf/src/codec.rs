//! Payload compression pipeline. Frames tag their payload with one of the
//! algorithms below; the codec is the single boundary where the tag is
//! interpreted.

use std::io::{self, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Compression algorithms understood by the engine. The numeric codes are
/// part of the on-disk format, both in the file header (global code) and in
/// each chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionKind {
    /// Payload stored verbatim, used when compression did not shrink it.
    None = 0,
    /// LZ4 block with the decompressed size prepended, the default for the
    /// hot write path.
    Fast = 1,
    /// Zlib (deflate), slower but denser, for cold data and migration.
    HighRatio = 2,
    /// LZ4 frame format, self-describing with its own magic and checksums.
    AltFast = 3,
}

impl CompressionKind {

    /// Decode an on-disk compression code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Fast),
            2 => Some(Self::HighRatio),
            3 => Some(Self::AltFast),
            _ => None,
        }
    }

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

}

/// Magic prefix of the LZ4 frame format, little-endian 0x184D2204.
const LZ4_FRAME_MAGIC: [u8; 4] = [0x04, 0x22, 0x4D, 0x18];

/// Try to recognize the algorithm from a magic prefix. LZ4 blocks carry no
/// magic so only zlib and LZ4 frames are detectable; the caller supplies the
/// tag for everything else.
pub fn detect(data: &[u8]) -> Option<CompressionKind> {
    match data {
        [0x78, 0x01 | 0x5E | 0x9C | 0xDA, ..] => Some(CompressionKind::HighRatio),
        _ if data.len() >= 4 && data[..4] == LZ4_FRAME_MAGIC => Some(CompressionKind::AltFast),
        _ => None,
    }
}

/// Compress `data` with the given algorithm. The output may be larger than
/// the input for incompressible data; callers that care compare lengths and
/// fall back to [`CompressionKind::None`].
pub fn compress(data: &[u8], kind: CompressionKind, level: u32) -> Result<Vec<u8>, CodecError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Fast => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::AltFast => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
            encoder.write_all(data)?;
            encoder.finish().map_err(CodecError::from_lz4_frame)
        }
        CompressionKind::HighRatio => {
            let level = level.clamp(1, 9);
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level));
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
    }
}

/// Decompress `data` previously produced by [`compress`] with `kind`.
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, CodecError> {
    match kind {
        CompressionKind::None => Ok(data.to_vec()),
        CompressionKind::Fast => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::Corrupt(e.to_string())),
        CompressionKind::AltFast => {
            let mut decoder = lz4_flex::frame::FrameDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)
                .map_err(|e| CodecError::Corrupt(e.to_string()))?;
            Ok(out)
        }
        CompressionKind::HighRatio => {
            let mut decoder = ZlibDecoder::new(data);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)
                .map_err(|e| CodecError::Corrupt(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Decompress with the tagged algorithm, retrying once with the high-ratio
/// decoder when a fast-tagged stream fails. Region files converted from
/// older tools occasionally mislabel deflate payloads as fast.
pub fn decompress_lenient(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, CodecError> {
    match decompress(data, kind) {
        Ok(out) => Ok(out),
        Err(err) if kind == CompressionKind::Fast => {
            if detect(data) == Some(CompressionKind::HighRatio) {
                decompress(data, CompressionKind::HighRatio)
            } else {
                match decompress(data, CompressionKind::HighRatio) {
                    Ok(out) => Ok(out),
                    Err(_) => Err(err),
                }
            }
        }
        Err(err) => Err(err),
    }
}

/// Error type for every codec operation.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt compressed stream: {0}")]
    Corrupt(String),
    #[error("unknown compression code: {0}")]
    UnknownAlgorithm(u8),
}

impl CodecError {

    fn from_lz4_frame(err: lz4_flex::frame::Error) -> Self {
        match err {
            lz4_flex::frame::Error::IoError(e) => Self::Io(e),
            other => Self::Corrupt(other.to_string()),
        }
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    fn sample() -> Vec<u8> {
        // Compressible data with some structure.
        (0u32..2048).flat_map(|i| (i % 97).to_le_bytes()).collect()
    }

    #[test]
    fn round_trip_all_kinds() {
        let data = sample();
        for kind in [
            CompressionKind::None,
            CompressionKind::Fast,
            CompressionKind::HighRatio,
            CompressionKind::AltFast,
        ] {
            let compressed = compress(&data, kind, 6).unwrap();
            let restored = decompress(&compressed, kind).unwrap();
            assert_eq!(restored, data, "round trip failed for {kind:?}");
        }
    }

    #[test]
    fn empty_payload() {
        for kind in [CompressionKind::Fast, CompressionKind::HighRatio] {
            let compressed = compress(&[], kind, 6).unwrap();
            assert_eq!(decompress(&compressed, kind).unwrap(), Vec::<u8>::new());
        }
    }

    #[test]
    fn detection() {
        let data = sample();
        let zlib = compress(&data, CompressionKind::HighRatio, 6).unwrap();
        assert_eq!(detect(&zlib), Some(CompressionKind::HighRatio));
        let frame = compress(&data, CompressionKind::AltFast, 6).unwrap();
        assert_eq!(detect(&frame), Some(CompressionKind::AltFast));
        // LZ4 blocks carry no magic.
        let block = compress(&data, CompressionKind::Fast, 6).unwrap();
        assert_eq!(detect(&block), None);
    }

    #[test]
    fn lenient_recovers_mislabeled_deflate() {
        let data = sample();
        let zlib = compress(&data, CompressionKind::HighRatio, 6).unwrap();
        // Tagged fast on disk but actually deflate.
        let restored = decompress_lenient(&zlib, CompressionKind::Fast).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn corrupt_stream_fails() {
        let data = sample();
        let mut compressed = compress(&data, CompressionKind::Fast, 6).unwrap();
        let last = compressed.len() - 1;
        compressed.truncate(last);
        assert!(matches!(
            decompress(&compressed, CompressionKind::Fast),
            Err(CodecError::Corrupt(_))
        ));
    }

    #[test]
    fn unknown_code() {
        assert!(CompressionKind::from_code(7).is_none());
        assert_eq!(CompressionKind::from_code(2), Some(CompressionKind::HighRatio));
    }

}
