//! Per-payload checksum verification. Every successful write records a
//! CRC32C of the compressed frame in a sidecar ledger keyed by region path
//! and slot index; reads validate against it under a sampling policy that
//! escalates to 100% when the previous process did not shut down cleanly.
//! The ledger is persisted next to the crash marker so checksums recorded
//! in one session still convict tampered frames in the next.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, warn};

/// Name of the sentinel file whose presence at startup indicates the
/// previous process crashed.
pub const CRASH_MARKER: &str = "crash_marker";

/// Name of the persisted checksum ledger in the data directory.
pub const CHECKSUM_FILE: &str = "chunk_checksums";

/// The validator, shared by every reader and batch writer of a storage
/// manager.
pub struct IntegrityValidator {
    /// Recorded checksums keyed by region path and slot index.
    ledger: Mutex<HashMap<(PathBuf, u16), u32>>,
    /// Configured sampling probability, stored as f64 bits.
    sampling: AtomicU64,
    /// True until the first clean shutdown after a detected crash; forces
    /// every read to validate.
    crash_mode: AtomicBool,
    marker_path: PathBuf,
    ledger_path: PathBuf,
    dirty: AtomicBool,
}

impl IntegrityValidator {

    /// Set up validation for a data directory. Creates the crash marker if
    /// absent; a marker already present means the last run died without
    /// [`Self::mark_clean_shutdown`] and escalates validation to 100%.
    /// Checksums persisted by earlier sessions are loaded back.
    pub fn new(data_dir: &Path, sampling_probability: f64) -> io::Result<Self> {

        fs::create_dir_all(data_dir)?;
        let marker_path = data_dir.join(CRASH_MARKER);
        let crashed = marker_path.exists();
        if crashed {
            warn!("crash marker found at {}, escalating integrity validation to 100%", marker_path.display());
        } else {
            fs::write(&marker_path, b"")?;
        }

        let ledger_path = data_dir.join(CHECKSUM_FILE);

        Ok(Self {
            ledger: Mutex::new(load_ledger(&ledger_path)),
            sampling: AtomicU64::new(sampling_probability.clamp(0.0, 1.0).to_bits()),
            crash_mode: AtomicBool::new(crashed),
            marker_path,
            ledger_path,
            dirty: AtomicBool::new(false),
        })
    }

    /// Validator without any on-disk marker or ledger handling, for tools
    /// that only need the in-memory ledger.
    pub fn detached(sampling_probability: f64) -> Self {
        Self {
            ledger: Mutex::new(HashMap::new()),
            sampling: AtomicU64::new(sampling_probability.clamp(0.0, 1.0).to_bits()),
            crash_mode: AtomicBool::new(false),
            marker_path: PathBuf::new(),
            ledger_path: PathBuf::new(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Record the checksum of a frame that was just written.
    pub fn record(&self, region: &Path, index: usize, frame: &[u8]) {
        self.record_crc(region, index, crc32c::crc32c(frame));
    }

    /// Record a checksum computed elsewhere, e.g. by the batch writer while
    /// the frame bytes were still in hand.
    pub fn record_crc(&self, region: &Path, index: usize, crc: u32) {
        self.ledger.lock().insert((region.to_path_buf(), index as u16), crc);
        self.dirty.store(true, Ordering::Release);
    }

    /// Effective validation probability, 1.0 while in crash mode.
    pub fn effective_probability(&self) -> f64 {
        if self.crash_mode.load(Ordering::Relaxed) {
            1.0
        } else {
            f64::from_bits(self.sampling.load(Ordering::Relaxed))
        }
    }

    pub fn in_crash_mode(&self) -> bool {
        self.crash_mode.load(Ordering::Relaxed)
    }

    /// Validate a frame read from disk. Returns false only when a recorded
    /// checksum exists and differs; unknown frames pass, and the sampling
    /// policy decides whether the comparison happens at all.
    pub fn check(&self, region: &Path, index: usize, frame: &[u8]) -> bool {
        let p = self.effective_probability();
        if p <= 0.0 {
            return true;
        }
        if p < 1.0 && rand::thread_rng().gen::<f64>() >= p {
            return true;
        }
        let recorded = self.ledger.lock()
            .get(&(region.to_path_buf(), index as u16))
            .copied();
        match recorded {
            None => true,
            Some(crc) => crc == crc32c::crc32c(frame),
        }
    }

    /// Persist the ledger if anything changed since the last flush. The
    /// file is rewritten wholesale through a temporary name so a crash can
    /// only lose recent records, never corrupt the ledger.
    pub fn flush(&self) -> io::Result<()> {

        if self.ledger_path.as_os_str().is_empty() {
            return Ok(());
        }
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let mut grouped: HashMap<PathBuf, Vec<(u16, u32)>> = HashMap::new();
        {
            let ledger = self.ledger.lock();
            for ((region, index), crc) in ledger.iter() {
                grouped.entry(region.clone()).or_default().push((*index, *crc));
            }
        }

        let tmp = self.ledger_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for (region, entries) in &grouped {
                let name = region.to_string_lossy();
                let bytes = name.as_bytes();
                if bytes.len() > u16::MAX as usize {
                    warn!("region path too long for the checksum ledger: {}", region.display());
                    continue;
                }
                file.write_u16::<LittleEndian>(bytes.len() as u16)?;
                io::Write::write_all(&mut file, bytes)?;
                file.write_u32::<LittleEndian>(entries.len() as u32)?;
                for (index, crc) in entries {
                    file.write_u16::<LittleEndian>(*index)?;
                    file.write_u32::<LittleEndian>(*crc)?;
                }
            }
            file.sync_data()?;
        }
        fs::rename(&tmp, &self.ledger_path)

    }

    /// Persist the ledger, remove the crash marker and leave crash mode.
    /// Called by the storage manager at the end of a clean shutdown.
    pub fn mark_clean_shutdown(&self) {
        if let Err(e) = self.flush() {
            warn!("failed to persist the checksum ledger: {e}");
        }
        if !self.marker_path.as_os_str().is_empty() {
            if let Err(e) = fs::remove_file(&self.marker_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove crash marker: {e}");
                    return;
                }
            }
            info!("clean shutdown, crash marker removed");
        }
        self.crash_mode.store(false, Ordering::Relaxed);
    }

}

/// Parse a persisted ledger, tolerating a missing or truncated file. Each
/// record is `path_len:u16 || path || count:u32 || (index:u16 || crc:u32)*`.
fn load_ledger(path: &Path) -> HashMap<(PathBuf, u16), u32> {

    let mut ledger = HashMap::new();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => return ledger,
    };
    let mut reader = BufReader::new(file);

    loop {
        // A clean end of file lands exactly on a record boundary.
        let path_len = match reader.read_u16::<LittleEndian>() {
            Ok(n) => n as usize,
            Err(_) => break,
        };
        let mut name = vec![0u8; path_len];
        if reader.read_exact(&mut name).is_err() {
            warn!("checksum ledger {} is truncated, dropping the tail", path.display());
            break;
        }
        let region = match String::from_utf8(name) {
            Ok(name) => PathBuf::from(name),
            Err(_) => {
                warn!("checksum ledger {} is garbled, dropping the tail", path.display());
                break;
            }
        };
        let count = match reader.read_u32::<LittleEndian>() {
            Ok(n) => n,
            Err(_) => {
                warn!("checksum ledger {} is truncated, dropping the tail", path.display());
                break;
            }
        };
        for _ in 0..count {
            match (reader.read_u16::<LittleEndian>(), reader.read_u32::<LittleEndian>()) {
                (Ok(index), Ok(crc)) => {
                    ledger.insert((region.clone(), index), crc);
                }
                _ => {
                    warn!("checksum ledger {} is truncated, dropping the tail", path.display());
                    return ledger;
                }
            }
        }
    }

    ledger

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();

        let validator = IntegrityValidator::new(dir.path(), 0.01).unwrap();
        assert!(!validator.in_crash_mode());
        assert!(dir.path().join(CRASH_MARKER).exists());

        // Simulate a crash: the marker survives into the next startup.
        drop(validator);
        let validator = IntegrityValidator::new(dir.path(), 0.01).unwrap();
        assert!(validator.in_crash_mode());
        assert_eq!(validator.effective_probability(), 1.0);

        validator.mark_clean_shutdown();
        assert!(!validator.in_crash_mode());
        assert!(!dir.path().join(CRASH_MARKER).exists());

        // Next startup is clean again, with the configured probability.
        let validator = IntegrityValidator::new(dir.path(), 0.25).unwrap();
        assert!(!validator.in_crash_mode());
        assert_eq!(validator.effective_probability(), 0.25);
    }

    #[test]
    fn detects_tampered_frame() {
        let validator = IntegrityValidator::detached(1.0);
        let region = Path::new("r.0.0.lrf");
        let frame = vec![1u8, 2, 3, 4, 5];
        validator.record(region, 7, &frame);

        assert!(validator.check(region, 7, &frame));
        let mut tampered = frame.clone();
        tampered[2] ^= 0xFF;
        assert!(!validator.check(region, 7, &tampered));
        // A slot without a record passes.
        assert!(validator.check(region, 8, &tampered));
    }

    #[test]
    fn zero_probability_never_validates() {
        let validator = IntegrityValidator::detached(0.0);
        let region = Path::new("r.0.0.lrf");
        validator.record(region, 1, &[1, 2, 3]);
        assert!(validator.check(region, 1, &[9, 9, 9]));
    }

    #[test]
    fn ledger_survives_an_unclean_restart() {
        let dir = tempfile::tempdir().unwrap();
        let region = dir.path().join("r.0.0.lrf");
        let frame = vec![0xABu8; 64];

        let validator = IntegrityValidator::new(dir.path(), 0.0).unwrap();
        validator.record(&region, 42, &frame);
        validator.record(&region, 7, &[1, 2, 3]);
        validator.flush().unwrap();
        // No clean shutdown: the marker stays and the next run escalates.
        drop(validator);

        let validator = IntegrityValidator::new(dir.path(), 0.0).unwrap();
        assert!(validator.in_crash_mode());
        assert!(validator.check(&region, 42, &frame));
        let mut tampered = frame.clone();
        tampered[10] ^= 0xFF;
        // The record from the previous session convicts the tampered frame.
        assert!(!validator.check(&region, 42, &tampered));
    }

    #[test]
    fn clean_shutdown_persists_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let region = dir.path().join("r.1.1.lrf");

        let validator = IntegrityValidator::new(dir.path(), 1.0).unwrap();
        validator.record(&region, 3, &[9, 9, 9]);
        validator.mark_clean_shutdown();
        assert!(dir.path().join(CHECKSUM_FILE).exists());

        let validator = IntegrityValidator::new(dir.path(), 1.0).unwrap();
        assert!(!validator.in_crash_mode());
        assert!(validator.check(&region, 3, &[9, 9, 9]));
        assert!(!validator.check(&region, 3, &[9, 9, 8]));
    }

    #[test]
    fn truncated_ledger_degrades_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let region = dir.path().join("r.0.0.lrf");

        let validator = IntegrityValidator::new(dir.path(), 1.0).unwrap();
        validator.record(&region, 1, &[1]);
        validator.record(&region, 2, &[2]);
        validator.flush().unwrap();
        validator.mark_clean_shutdown();

        // Chop the tail off the ledger file.
        let bytes = fs::read(dir.path().join(CHECKSUM_FILE)).unwrap();
        fs::write(dir.path().join(CHECKSUM_FILE), &bytes[..bytes.len() - 3]).unwrap();

        let validator = IntegrityValidator::new(dir.path(), 1.0).unwrap();
        // Whatever survived still validates; the lost tail just passes.
        assert!(validator.check(&region, 1, &[1]));
        assert!(validator.check(&region, 2, &[2]));
    }

    #[test]
    fn flush_without_changes_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let validator = IntegrityValidator::new(dir.path(), 0.5).unwrap();
        validator.flush().unwrap();
        assert!(!dir.path().join(CHECKSUM_FILE).exists());
    }

}
