//! Conversion of legacy sector-based region files into LRF files, one
//! region at a time, with atomic replacement. Chunks are decompressed from
//! the legacy file and recompressed through the codec into a fresh LRF
//! file; the legacy file is only removed once the replacement is fully in
//! place.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::CompressionKind;
use crate::coord::{chunk_of_index, LEGACY_EXTENSION, LRF_EXTENSION, REGION_CHUNKS};
use crate::legacy::{LegacyError, LegacyRegion};
use crate::region::resource::{is_lrf_file, RegionResource};
use crate::region::writer::RegionWriter;
use crate::region::RegionError;

/// Options of a migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Move legacy files into a `backup_mca/` sibling directory instead of
    /// deleting them.
    pub backup: bool,
    pub compression: CompressionKind,
    pub compression_level: u32,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            backup: false,
            compression: CompressionKind::Fast,
            compression_level: 6,
        }
    }
}

/// Summary of a whole-directory migration.
#[derive(Debug, Default, Clone, Copy)]
pub struct MigrationReport {
    pub converted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub chunks: u64,
}

/// Convert one legacy region file into an LRF file at `lrf_path`,
/// returning the number of chunks carried over.
///
/// The new file is assembled under a temporary name and renamed into place,
/// so at no instant do a populated legacy file and a populated LRF file
/// both claim authority: a crash leaves either the legacy file alone or
/// the finished LRF file. Converting a file that is already LRF is a
/// successful no-op.
pub fn convert(legacy_path: &Path, lrf_path: &Path, options: &MigrationOptions) -> Result<u32, MigrateError> {

    if is_lrf_file(legacy_path)? {
        return Ok(0);
    }

    let mut legacy = LegacyRegion::open(legacy_path)?;

    let tmp_path = temp_path(lrf_path);
    if tmp_path.exists() {
        fs::remove_file(&tmp_path)?;
    }

    let count = match copy_chunks(&mut legacy, &tmp_path, options) {
        Ok(count) => count,
        Err(e) => {
            // The partial file must not survive; the legacy file remains
            // authoritative.
            if let Err(cleanup) = fs::remove_file(&tmp_path) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove partial {}: {cleanup}", tmp_path.display());
                }
            }
            return Err(e);
        }
    };

    if count == 0 {
        // Nothing to carry over; keep the legacy file and produce nothing.
        let _ = fs::remove_file(&tmp_path);
        return Ok(0);
    }

    fs::rename(&tmp_path, lrf_path)?;

    if options.backup {
        let backup_dir = legacy_path.parent()
            .map(|p| p.join("backup_mca"))
            .ok_or_else(|| MigrateError::Io(io::Error::other("legacy path has no parent directory")))?;
        fs::create_dir_all(&backup_dir)?;
        let target = backup_dir.join(
            legacy_path.file_name()
                .ok_or_else(|| MigrateError::Io(io::Error::other("legacy path has no file name")))?,
        );
        fs::rename(legacy_path, target)?;
    } else {
        fs::remove_file(legacy_path)?;
    }

    info!("converted {} ({count} chunks)", legacy_path.display());
    Ok(count)

}

/// Copy every present chunk of the legacy region into a fresh LRF file.
fn copy_chunks(legacy: &mut LegacyRegion, target: &Path, options: &MigrationOptions) -> Result<u32, MigrateError> {

    let res = RegionResource::open(target, true, false, options.compression)?;
    let writer = RegionWriter::new(
        Arc::clone(&res),
        options.compression,
        options.compression_level,
        usize::MAX,
    );

    let mut count = 0u32;
    for index in 0..REGION_CHUNKS {
        let (cx, cz) = chunk_of_index(index);
        if let Some(payload) = legacy.read_chunk(cx, cz)? {
            let timestamp_ms = legacy.timestamp(cx, cz).unwrap_or(0) as i64 * 1000;
            writer.append_chunk(cx, cz, &payload, timestamp_ms)?;
            count += 1;
        }
    }

    res.file().sync_all().map_err(RegionError::Io)?;
    // Unmap before the rename; some platforms hold locks through mappings.
    res.drop_mapping();
    Ok(count)

}

fn temp_path(lrf_path: &Path) -> PathBuf {
    let mut name = lrf_path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Convert every legacy region file under `region_dir`. A failed region is
/// reported and skipped; the remaining files are still attempted.
pub fn migrate_world(region_dir: &Path, options: &MigrationOptions) -> io::Result<MigrationReport> {

    let mut report = MigrationReport::default();

    for entry in fs::read_dir(region_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(LEGACY_EXTENSION) {
            continue;
        }

        let lrf_path = path.with_extension(LRF_EXTENSION);
        if lrf_path.exists() {
            // A finished LRF file already shadows this legacy file.
            report.skipped += 1;
            continue;
        }

        match convert(&path, &lrf_path, options) {
            Ok(chunks) => {
                report.converted += 1;
                report.chunks += chunks as u64;
            }
            Err(e) => {
                report.failed += 1;
                warn!("migration of {} failed: {e}", path.display());
            }
        }
    }

    info!(
        "migration finished: {} converted, {} skipped, {} failed, {} chunks",
        report.converted, report.skipped, report.failed, report.chunks,
    );
    Ok(report)

}

/// Error type for single-region conversions.
#[derive(thiserror::Error, Debug)]
pub enum MigrateError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("legacy region: {0}")]
    Legacy(#[from] LegacyError),
    #[error("region: {0}")]
    Region(#[from] RegionError),
}

#[cfg(test)]
mod tests {

    use crate::buffer::BufferPool;
    use crate::legacy::testutil::write_legacy_region;
    use crate::region::reader::RegionReader;

    use super::*;

    fn read_back(path: &Path, cx: i32, cz: i32) -> Option<Vec<u8>> {
        let res = RegionResource::open(path, false, false, CompressionKind::Fast).unwrap();
        let reader = RegionReader::new(res, Arc::new(BufferPool::new()));
        reader.read_chunk(cx, cz).unwrap()
    }

    #[test]
    fn converts_and_removes_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("r.0.0.mca");
        let lrf = dir.path().join("r.0.0.lrf");

        let chunks: Vec<(i32, i32, Vec<u8>, u32)> = (0..10)
            .map(|i| (i, 2 * i, vec![i as u8 + 1; 500 + i as usize * 37], 1600000000 + i as u32))
            .collect();
        write_legacy_region(&legacy, &chunks);

        let count = convert(&legacy, &lrf, &MigrationOptions::default()).unwrap();
        assert_eq!(count, 10);
        assert!(lrf.exists());
        assert!(!legacy.exists());

        for (cx, cz, payload, _) in &chunks {
            assert_eq!(read_back(&lrf, *cx, *cz).unwrap(), *payload);
        }
    }

    #[test]
    fn carries_legacy_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("r.0.0.mca");
        let lrf = dir.path().join("r.0.0.lrf");
        write_legacy_region(&legacy, &[(1, 1, vec![5; 100], 1650000000)]);

        convert(&legacy, &lrf, &MigrationOptions::default()).unwrap();

        let res = RegionResource::open(&lrf, false, false, CompressionKind::Fast).unwrap();
        let reader = RegionReader::new(res, Arc::new(BufferPool::new()));
        assert_eq!(reader.chunk_timestamp(1, 1).unwrap(), Some(1650000000i64 * 1000));
    }

    #[test]
    fn already_lrf_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let lrf = dir.path().join("r.0.0.lrf");
        drop(RegionResource::open(&lrf, true, false, CompressionKind::Fast).unwrap());

        assert_eq!(convert(&lrf, &lrf, &MigrationOptions::default()).unwrap(), 0);
        assert!(lrf.exists());
    }

    #[test]
    fn failure_leaves_legacy_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("r.0.0.mca");
        let lrf = dir.path().join("r.0.0.lrf");

        // A header claiming a chunk beyond EOF fails at open time; a
        // truncated chunk body fails during the copy. Exercise the latter.
        write_legacy_region(&legacy, &[(0, 0, vec![9; 5000], 1)]);
        let good = std::fs::read(&legacy).unwrap();
        // Corrupt the compressed body so decompression fails mid-copy.
        let mut bad = good.clone();
        for b in &mut bad[8200..8300] {
            *b ^= 0xFF;
        }
        std::fs::write(&legacy, &bad).unwrap();

        assert!(convert(&legacy, &lrf, &MigrationOptions::default()).is_err());
        assert!(legacy.exists());
        assert!(!lrf.exists());
        assert!(!temp_path(&lrf).exists());
    }

    #[test]
    fn backup_moves_instead_of_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("r.3.4.mca");
        let lrf = dir.path().join("r.3.4.lrf");
        write_legacy_region(&legacy, &[(0, 0, vec![7; 256], 1)]);

        let options = MigrationOptions { backup: true, ..MigrationOptions::default() };
        convert(&legacy, &lrf, &options).unwrap();

        assert!(!legacy.exists());
        assert!(dir.path().join("backup_mca").join("r.3.4.mca").exists());
        assert_eq!(read_back(&lrf, 0, 0).unwrap(), vec![7; 256]);
    }

    #[test]
    fn empty_legacy_keeps_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("r.0.0.mca");
        write_legacy_region(&legacy, &[]);

        let lrf = dir.path().join("r.0.0.lrf");
        assert_eq!(convert(&legacy, &lrf, &MigrationOptions::default()).unwrap(), 0);
        assert!(legacy.exists());
        assert!(!lrf.exists());
    }

    #[test]
    fn migrate_world_converts_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy_region(&dir.path().join("r.0.0.mca"), &[(0, 0, vec![1; 100], 1)]);
        write_legacy_region(&dir.path().join("r.1.0.mca"), &[(33, 0, vec![2; 100], 1)]);
        // An unrelated file is ignored.
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let report = migrate_world(dir.path(), &MigrationOptions::default()).unwrap();
        assert_eq!(report.converted, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(report.chunks, 2);
        assert!(dir.path().join("r.0.0.lrf").exists());
        assert!(dir.path().join("r.1.0.lrf").exists());
        assert!(!dir.path().join("r.0.0.mca").exists());
    }

    #[test]
    fn migrate_world_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        write_legacy_region(&dir.path().join("r.0.0.mca"), &[(0, 0, vec![1; 100], 1)]);
        // A bogus legacy file that fails to open.
        std::fs::write(dir.path().join("r.9.9.mca"), vec![0u8; 123]).unwrap();

        let report = migrate_world(dir.path(), &MigrationOptions::default()).unwrap();
        assert_eq!(report.converted, 1);
        assert_eq!(report.failed, 1);
        assert!(dir.path().join("r.9.9.mca").exists());
    }

}
