//! Shared per-file region resource: the single owner of the file handle,
//! the optional memory mapping, the cached header and the flush barrier.
//! Readers, writers and prefetch engines all hold the same resource through
//! an `Arc`; the file closes and the mapping unmaps when the last holder
//! releases it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::trace;

use crate::codec::CompressionKind;

use super::barrier::FlushBarrier;
use super::header::{RegionHeader, HEADER_SIZE, MAGIC};
use super::RegionError;

struct CachedHeader {
    header: Arc<RegionHeader>,
    /// Version token the cached copy reflects; stale when it lags
    /// `header_version`.
    version: u64,
}

/// The shared resource for one region file path.
pub struct RegionResource {
    path: PathBuf,
    file: Mutex<File>,
    mmap_enabled: bool,
    mmap: RwLock<Option<Arc<Mmap>>>,
    barrier: FlushBarrier,
    /// Bumped by the writer whenever the on-disk header changes.
    header_version: AtomicU64,
    cached: Mutex<CachedHeader>,
    last_force: Mutex<Instant>,
}

impl RegionResource {

    /// Open or create the region file at `path`. A newly created file gets a
    /// fresh empty header before this returns, so a concurrent reader can
    /// never observe a headerless file.
    pub fn open(
        path: &Path,
        create: bool,
        mmap_enabled: bool,
        compression: CompressionKind,
    ) -> Result<Arc<Self>, RegionError> {

        if create {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;

        let len = file.metadata()?.len();
        let header;

        if len == 0 && create {
            let fresh = RegionHeader::new(compression);
            io::Write::write_all(&mut file, &fresh.serialize())?;
            header = fresh;
        } else {
            let mut bytes = vec![0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut bytes)
                .map_err(|_| super::header::HeaderError::TruncatedHeader(len.min(usize::MAX as u64) as usize))?;
            header = RegionHeader::parse(&bytes)?;
        }

        trace!("opened region resource {}", path.display());

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            mmap_enabled,
            mmap: RwLock::new(None),
            barrier: FlushBarrier::new(),
            header_version: AtomicU64::new(0),
            cached: Mutex::new(CachedHeader { header: Arc::new(header), version: 0 }),
            last_force: Mutex::new(Instant::now()),
        }))

    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn barrier(&self) -> &FlushBarrier {
        &self.barrier
    }

    /// Lock the underlying file for direct positioned I/O. The writer holds
    /// this across a whole batch append; readers take it only for the
    /// channel fallback path.
    pub fn file(&self) -> MutexGuard<'_, File> {
        self.file.lock()
    }

    pub fn file_len(&self) -> io::Result<u64> {
        self.file.lock().metadata().map(|m| m.len())
    }

    /// Positioned read through the file channel.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    /// Return the cached header, re-parsing from disk when a writer has
    /// published a newer version.
    pub fn header(&self) -> Result<Arc<RegionHeader>, RegionError> {
        let current = self.header_version.load(Ordering::Acquire);
        let mut cached = self.cached.lock();
        if cached.version != current {
            let mut bytes = vec![0u8; HEADER_SIZE];
            self.read_at(0, &mut bytes)?;
            cached.header = Arc::new(RegionHeader::parse(&bytes)?);
            cached.version = current;
        }
        Ok(Arc::clone(&cached.header))
    }

    /// Install the header the writer just put on disk, advancing the
    /// version token so other holders pick it up without a re-parse.
    pub fn publish_header(&self, header: RegionHeader) {
        let mut cached = self.cached.lock();
        let version = self.header_version.fetch_add(1, Ordering::AcqRel) + 1;
        cached.header = Arc::new(header);
        cached.version = version;
    }

    /// Drop the cached header, forcing the next [`Self::header`] call to
    /// re-parse from disk.
    pub fn invalidate_header(&self) {
        self.header_version.fetch_add(1, Ordering::AcqRel);
    }

    /// Get a mapping that covers at least `min_len` bytes of the file,
    /// remapping if the file has grown past the current mapping. Returns
    /// none when mapping is disabled or the file cannot cover the request.
    pub fn mapped(&self, min_len: u64) -> io::Result<Option<Arc<Mmap>>> {

        if !self.mmap_enabled {
            return Ok(None);
        }

        {
            let slot = self.mmap.read();
            if let Some(map) = slot.as_ref() {
                if map.len() as u64 >= min_len {
                    return Ok(Some(Arc::clone(map)));
                }
            }
        }

        let mut slot = self.mmap.write();
        // Another thread may have remapped while we waited for the lock.
        if let Some(map) = slot.as_ref() {
            if map.len() as u64 >= min_len {
                return Ok(Some(Arc::clone(map)));
            }
        }

        let file = self.file.lock();
        let len = file.metadata()?.len();
        if len < min_len {
            return Ok(None);
        }

        // SAFETY: the mapping is read-only and the flush barrier fences it
        // against in-progress writes; stale bytes are never observed past a
        // writer's release.
        let map = Arc::new(unsafe { MmapOptions::new().map(&*file)? });
        trace!("mapped {} bytes of {}", map.len(), self.path.display());
        *slot = Some(Arc::clone(&map));
        Ok(Some(map))

    }

    /// Explicitly unmap. Required before deleting or renaming the file;
    /// some platforms hold file locks for the lifetime of a mapping.
    pub fn drop_mapping(&self) {
        self.mmap.write().take();
    }

    /// True when the force interval has elapsed since the last disk force.
    pub fn force_due(&self, interval: Duration) -> bool {
        self.last_force.lock().elapsed() >= interval
    }

    pub fn note_forced(&self) {
        *self.last_force.lock() = Instant::now();
    }

}

impl Drop for RegionResource {
    fn drop(&mut self) {
        // Unmap before the file handle closes.
        self.mmap.write().take();
        trace!("closed region resource {}", self.path.display());
    }
}

/// Check whether the file at `path` starts with the LRF magic.
pub fn is_lrf_file(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 7];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {

    use std::io::Write;

    use super::*;

    #[test]
    fn create_writes_fresh_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let res = RegionResource::open(&path, true, true, CompressionKind::Fast).unwrap();
        assert_eq!(res.file_len().unwrap(), HEADER_SIZE as u64);
        assert_eq!(res.header().unwrap().chunk_count(), 0);
        assert!(is_lrf_file(&path).unwrap());
    }

    #[test]
    fn reopen_parses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.1.2.lrf");
        drop(RegionResource::open(&path, true, false, CompressionKind::HighRatio).unwrap());
        let res = RegionResource::open(&path, false, false, CompressionKind::Fast).unwrap();
        assert_eq!(res.header().unwrap().compression(), CompressionKind::HighRatio);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.9.9.lrf");
        assert!(matches!(
            RegionResource::open(&path, false, true, CompressionKind::Fast),
            Err(RegionError::Io(_))
        ));
    }

    #[test]
    fn mapping_tracks_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let res = RegionResource::open(&path, true, true, CompressionKind::Fast).unwrap();

        let map = res.mapped(HEADER_SIZE as u64).unwrap().unwrap();
        assert_eq!(map.len(), HEADER_SIZE);
        // A request past EOF cannot be served.
        assert!(res.mapped(HEADER_SIZE as u64 + 1).unwrap().is_none());

        // Grow the file and ask again: the resource remaps transparently.
        res.file().write_all(&[0u8; 4096]).unwrap();
        let map = res.mapped(HEADER_SIZE as u64 + 4096).unwrap().unwrap();
        assert_eq!(map.len(), HEADER_SIZE + 4096);
    }

    #[test]
    fn header_cache_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let res = RegionResource::open(&path, true, false, CompressionKind::Fast).unwrap();

        let mut header = (*res.header().unwrap()).clone();
        header.set_slot(4, 4, super::super::header::SlotEntry {
            offset_sectors: 32,
            size: 64,
            flags: 0,
        });

        // Publishing installs the cache without touching disk.
        res.publish_header(header);
        assert!(res.header().unwrap().has_chunk(4, 4));

        // Invalidation forces a re-parse, the disk copy never changed.
        res.invalidate_header();
        assert!(!res.header().unwrap().has_chunk(4, 4));
    }

}
