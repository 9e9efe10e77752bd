//! Region directory resolver: maps chunk coordinates to region files,
//! applies the format and conversion policies, converts legacy files on
//! demand and keeps the world index sidecar current. When an LRF file and
//! a legacy file both exist the LRF file wins, which protects reads from
//! half-finished migrations.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::batch::WriteTicket;
use crate::config::{ConversionMode, FormatPolicy};
use crate::coord::{legacy_file_path, region_file_path, region_of_chunk};
use crate::index::WorldIndex;
use crate::legacy::LegacyRegion;
use crate::migrate::{self, MigrationOptions, MigrationReport};
use crate::queue::TaskPriority;
use crate::storage::{RegionHandle, StorageError, StorageManager};

/// A resolver over one region directory.
pub struct RegionDir {
    dir: PathBuf,
    manager: Arc<StorageManager>,
    index: Arc<WorldIndex>,
    /// Open legacy files, kept for worlds served without conversion.
    legacy_cache: Mutex<HashMap<(i32, i32), LegacyRegion>>,
}

impl RegionDir {

    /// Open a resolver, kicking off the configured startup migration.
    pub fn new(dir: impl Into<PathBuf>, manager: Arc<StorageManager>) -> io::Result<Self> {

        let dir: PathBuf = dir.into();
        std::fs::create_dir_all(&dir)?;
        let index = Arc::new(WorldIndex::load(&dir));

        match manager.config().conversion_mode {
            ConversionMode::Full => {
                let report = migrate::migrate_world(&dir, &Self::migration_options(&manager))?;
                if report.failed > 0 {
                    warn!("{} regions failed to convert and stay legacy", report.failed);
                }
            }
            ConversionMode::Background => {
                let job_dir = dir.clone();
                let options = Self::migration_options(&manager);
                let submitted = manager.submit(TaskPriority::Low, Box::new(move || {
                    if let Err(e) = migrate::migrate_world(&job_dir, &options) {
                        warn!("background migration of {} failed: {e}", job_dir.display());
                    }
                }));
                if submitted.is_err() {
                    warn!("background migration not scheduled, storage is stopping");
                }
            }
            ConversionMode::OnDemand | ConversionMode::Manual => {}
        }

        Ok(Self {
            dir,
            manager,
            index,
            legacy_cache: Mutex::new(HashMap::new()),
        })

    }

    fn migration_options(manager: &StorageManager) -> MigrationOptions {
        MigrationOptions {
            backup: false,
            compression: manager.config().compression_algorithm,
            compression_level: manager.config().compression_level,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn index(&self) -> &Arc<WorldIndex> {
        &self.index
    }

    /// The LRF handle for the region containing a chunk, converting a
    /// legacy file first when one would otherwise be shadowed.
    pub fn region_for_chunk(&self, cx: i32, cz: i32, create: bool) -> Result<RegionHandle, StorageError> {

        let (rx, rz) = region_of_chunk(cx, cz);
        let lrf = region_file_path(&self.dir, rx, rz);
        let legacy = legacy_file_path(&self.dir, rx, rz);

        if !lrf.exists() && legacy.exists() {
            match self.manager.config().conversion_mode {
                ConversionMode::Manual => {
                    // Writing a fresh LRF file next to an unconverted
                    // legacy file would shadow its chunks.
                    if create && self.manager.log_gate().should_log("shadowing", rx, rz) {
                        warn!("region {rx}/{rz} has unconverted legacy data; new writes will shadow it");
                    }
                }
                _ => self.convert_region(rx, rz)?,
            }
        }

        self.manager.get_region(&lrf, create)

    }

    /// Read a chunk under the configured format policy.
    pub fn read_chunk(&self, cx: i32, cz: i32) -> Result<Option<Arc<Vec<u8>>>, StorageError> {

        let (rx, rz) = region_of_chunk(cx, cz);
        let lrf = region_file_path(&self.dir, rx, rz);
        let legacy = legacy_file_path(&self.dir, rx, rz);

        match self.manager.config().format {
            FormatPolicy::Legacy => self.read_legacy(rx, rz, cx, cz),
            FormatPolicy::Lrf => self.read_lrf(&lrf, cx, cz),
            FormatPolicy::Auto => {
                if lrf.exists() {
                    self.read_lrf(&lrf, cx, cz)
                } else if legacy.exists() {
                    if self.manager.config().conversion_mode == ConversionMode::OnDemand {
                        self.convert_region(rx, rz)?;
                        self.read_lrf(&lrf, cx, cz)
                    } else {
                        self.read_legacy(rx, rz, cx, cz)
                    }
                } else {
                    Ok(None)
                }
            }
        }

    }

    /// Queue a chunk write, always into the LRF format.
    pub fn queue_write(&self, cx: i32, cz: i32, payload: Vec<u8>) -> Result<WriteTicket, StorageError> {
        if self.manager.config().format == FormatPolicy::Legacy {
            return Err(StorageError::Region(
                crate::region::RegionError::Unsupported("is read-only under the legacy format policy"),
            ));
        }
        let region = self.region_for_chunk(cx, cz, true)?;
        self.index.mark_generated(cx, cz);
        Ok(region.queue_write(cx, cz, payload))
    }

    /// Explicit migration trigger, used with the manual conversion mode.
    pub fn migrate_now(&self, backup: bool) -> io::Result<MigrationReport> {
        let options = MigrationOptions {
            backup,
            ..Self::migration_options(&self.manager)
        };
        let report = migrate::migrate_world(&self.dir, &options)?;
        self.legacy_cache.lock().clear();
        Ok(report)
    }

    /// Persist the world index sidecar.
    pub fn flush_index(&self) -> io::Result<()> {
        self.index.flush()
    }

    fn convert_region(&self, rx: i32, rz: i32) -> Result<(), StorageError> {
        let legacy = legacy_file_path(&self.dir, rx, rz);
        let lrf = region_file_path(&self.dir, rx, rz);
        let chunks = migrate::convert(&legacy, &lrf, &Self::migration_options(&self.manager))?;
        self.legacy_cache.lock().remove(&(rx, rz));
        info!("converted region {rx}/{rz} on demand ({chunks} chunks)");
        Ok(())
    }

    fn read_lrf(&self, lrf: &Path, cx: i32, cz: i32) -> Result<Option<Arc<Vec<u8>>>, StorageError> {
        match self.manager.get_region(lrf, false) {
            Ok(region) => region.read_chunk(cx, cz),
            Err(StorageError::Region(crate::region::RegionError::Io(e)))
                if e.kind() == io::ErrorKind::NotFound =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn read_legacy(&self, rx: i32, rz: i32, cx: i32, cz: i32) -> Result<Option<Arc<Vec<u8>>>, StorageError> {
        let mut cache = self.legacy_cache.lock();
        let region = match cache.entry((rx, rz)) {
            std::collections::hash_map::Entry::Occupied(o) => o.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                let path = legacy_file_path(&self.dir, rx, rz);
                match LegacyRegion::open(&path) {
                    Ok(region) => v.insert(region),
                    Err(crate::legacy::LegacyError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                        return Ok(None);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Ok(region.read_chunk(cx, cz)?.map(Arc::new))
    }

}
