//! The storage manager: four shared executor pools plus a background pool,
//! a registry of shared region resources, and the shutdown protocol that
//! drains writers, forces every mapped region and joins the pools. Pooling
//! is global on purpose; one pool set per region multiplies threads with
//! the view distance and grinds the process into context-switch soup.

use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::batch::{BatchReader, BatchWriter, LoadTicket, WriteTicket};
use crate::buffer::BufferPool;
use crate::config::StorageConfig;
use crate::integrity::IntegrityValidator;
use crate::prefetch::{CacheStats, PrefetchEngine};
use crate::queue::{Job, TaskPriority, TaskQueue};
use crate::region::reader::RegionReader;
use crate::region::resource::RegionResource;
use crate::region::writer::RegionWriter;
use crate::region::RegionError;
use crate::util::LogGate;

/// Join deadline applied to the whole shutdown sequence.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Pool sizing ratios and ceilings, applied to the CPU count when a pool is
/// configured as `auto`.
const LOAD_RATIO: (f64, usize) = (0.5, 8);
const WRITE_RATIO: (f64, usize) = (0.25, 4);
const COMPRESS_RATIO: (f64, usize) = (0.75, 8);
const DECOMPRESS_RATIO: (f64, usize) = (0.5, 8);
const BACKGROUND_THREADS: usize = 2;

/// Error type for storage-level operations, wrapping the region substrate.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("region: {0}")]
    Region(#[from] RegionError),
    #[error("legacy region: {0}")]
    Legacy(#[from] crate::legacy::LegacyError),
    #[error("migration: {0}")]
    Migration(#[from] crate::migrate::MigrateError),
    /// A failure fate-shared across the waiters of one batch or one
    /// deduplicated load.
    #[error("{0}")]
    Shared(Arc<StorageError>),
    #[error("cancelled by shutdown or timeout")]
    Cancelled,
}

/// A fixed pool of named worker threads draining one priority queue.
pub struct Executor {
    name: &'static str,
    queue: Arc<TaskQueue>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {

    fn new(name: &'static str, threads: usize) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new());
        let handles = (0..threads)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::Builder::new()
                    .name(format!("LRF {name} Worker #{i}"))
                    .spawn(move || {
                        while let Some(job) = queue.pop() {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                warn!("a {name} task panicked");
                            }
                        }
                    })
                    .unwrap()
            })
            .collect();
        Arc::new(Self { name, queue, handles: Mutex::new(handles) })
    }

    #[inline]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn execute(&self, priority: TaskPriority, job: Job) -> Result<(), Job> {
        self.queue.push(priority, job)
    }

    /// Close the queue and join workers until the deadline. Workers stuck
    /// past it are left detached; Rust offers no sane way to interrupt
    /// them.
    fn shutdown(&self, deadline: Instant) -> bool {
        self.queue.close();
        let mut clean = true;
        for handle in self.handles.lock().drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("{} worker did not stop before the shutdown deadline", self.name);
                clean = false;
            }
        }
        clean
    }

}

struct RegionEntry {
    res: Weak<RegionResource>,
    engine: Weak<PrefetchEngine>,
    writer: Weak<BatchWriter>,
    reader: Weak<BatchReader>,
}

/// Process-wide storage state. Components receive it by handle; the only
/// global is the optional lazily initialized default instance.
pub struct StorageManager {
    config: StorageConfig,
    buffer_pool: Arc<BufferPool>,
    integrity: Arc<IntegrityValidator>,
    load_exec: Arc<Executor>,
    write_exec: Arc<Executor>,
    compress_exec: Arc<Executor>,
    decompress_exec: Arc<Executor>,
    background_exec: Arc<Executor>,
    /// Lookup-only registry; it never pins a resource alive, handles do.
    registry: Mutex<HashMap<PathBuf, RegionEntry>>,
    log_gate: Arc<LogGate>,
    stopping: AtomicBool,
}

impl StorageManager {

    /// Create a manager rooted at a data directory. The directory receives
    /// the crash marker; its presence from a previous run escalates
    /// integrity validation until this manager shuts down cleanly.
    pub fn new(data_dir: &Path, config: StorageConfig) -> io::Result<Arc<Self>> {

        let integrity = Arc::new(IntegrityValidator::new(
            data_dir,
            config.integrity_sampling_probability,
        )?);

        let load = config.load_threads.resolve(LOAD_RATIO.0, LOAD_RATIO.1);
        let write = config.write_threads.resolve(WRITE_RATIO.0, WRITE_RATIO.1);
        let compress = config.compress_threads.resolve(COMPRESS_RATIO.0, COMPRESS_RATIO.1);
        let decompress = config.decompress_threads.resolve(DECOMPRESS_RATIO.0, DECOMPRESS_RATIO.1);
        info!("storage pools: load={load}, write={write}, compress={compress}, decompress={decompress}");

        Ok(Arc::new(Self {
            config,
            buffer_pool: Arc::new(BufferPool::new()),
            integrity,
            load_exec: Executor::new("Load", load),
            write_exec: Executor::new("Write", write),
            compress_exec: Executor::new("Compress", compress),
            decompress_exec: Executor::new("Decompress", decompress),
            background_exec: Executor::new("Background", BACKGROUND_THREADS),
            registry: Mutex::new(HashMap::new()),
            log_gate: Arc::new(LogGate::default()),
            stopping: AtomicBool::new(false),
        }))

    }

    #[inline]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    #[inline]
    pub fn integrity(&self) -> &Arc<IntegrityValidator> {
        &self.integrity
    }

    #[inline]
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    #[inline]
    pub fn log_gate(&self) -> &Arc<LogGate> {
        &self.log_gate
    }

    /// Submit a chunk task into the unified background queue.
    pub fn submit(&self, priority: TaskPriority, job: Job) -> Result<(), Job> {
        self.background_exec.execute(priority, job)
    }

    /// Acquire or create the shared resource stack for one region file,
    /// returning a handle that pins it alive.
    pub fn get_region(self: &Arc<Self>, path: &Path, create: bool) -> Result<RegionHandle, StorageError> {

        if self.stopping.load(Ordering::SeqCst) {
            return Err(StorageError::Cancelled);
        }

        let mut registry = self.registry.lock();

        if let Some(entry) = registry.get(path) {
            if let (Some(res), Some(engine), Some(writer), Some(reader)) = (
                entry.res.upgrade(),
                entry.engine.upgrade(),
                entry.writer.upgrade(),
                entry.reader.upgrade(),
            ) {
                return Ok(RegionHandle { res, engine, writer, reader });
            }
        }

        let res = RegionResource::open(
            path,
            create,
            self.config.mmap_enabled,
            self.config.compression_algorithm,
        )?;

        let reader = RegionReader::new(Arc::clone(&res), Arc::clone(&self.buffer_pool))
            .with_integrity(Arc::clone(&self.integrity))
            .with_log_gate(Arc::clone(&self.log_gate));

        let engine = PrefetchEngine::new(
            reader,
            Arc::clone(self.background_exec.queue()),
            self.config.batch_size,
            self.config.prefetch_distance,
            self.config.prediction_scale,
            self.config.max_cache_size_bytes,
            self.config.max_cache_entries,
            self.config.ultra_scan_enabled,
        );

        let region_writer = RegionWriter::new(
            Arc::clone(&res),
            self.config.compression_algorithm,
            self.config.compression_level,
            self.config.batch_size,
        );

        let batch_writer = BatchWriter::new(
            region_writer,
            self.config.compression_algorithm,
            self.config.compression_level,
            self.config.batch_size,
            self.config.auto_flush_delay,
            Arc::clone(self.compress_exec.queue()),
            Arc::clone(self.write_exec.queue()),
            Arc::clone(self.background_exec.queue()),
        );

        // Committed batches feed the checksum ledger and evict stale cache
        // entries before any waiter observes completion. The ledger is
        // persisted per batch so a crash loses at most the final batch's
        // records.
        {
            let integrity = Arc::clone(&self.integrity);
            let engine = Arc::clone(&engine);
            let region_path = path.to_path_buf();
            batch_writer.add_post_flush(Box::new(move |flushed| {
                for chunk in flushed {
                    integrity.record_crc(&region_path, chunk.index, chunk.crc);
                    engine.invalidate(chunk.cx, chunk.cz);
                }
                if let Err(e) = integrity.flush() {
                    warn!("failed to persist the checksum ledger: {e}");
                }
            }));
        }

        let batch_reader = BatchReader::new(
            Arc::clone(&engine),
            Arc::clone(self.load_exec.queue()),
            Arc::clone(self.decompress_exec.queue()),
            Arc::clone(self.background_exec.queue()),
            self.config.max_concurrent_loads,
        );

        registry.insert(path.to_path_buf(), RegionEntry {
            res: Arc::downgrade(&res),
            engine: Arc::downgrade(&engine),
            writer: Arc::downgrade(&batch_writer),
            reader: Arc::downgrade(&batch_reader),
        });

        debug!("registered region resource {}", path.display());

        Ok(RegionHandle { res, engine, writer: batch_writer, reader: batch_reader })

    }

    /// Force every live region's written bytes to disk under its barrier.
    pub fn force_all(&self) {
        let live: Vec<Arc<RegionResource>> = self.registry.lock()
            .values()
            .filter_map(|entry| entry.res.upgrade())
            .collect();
        for res in live {
            let pass = res.barrier().before_flush();
            if let Err(e) = pass.force(&res.file()) {
                warn!("force of {} failed: {e}", res.path().display());
            } else {
                res.note_forced();
            }
        }
    }

    /// Drain batch writers, force all regions, join the pools and remove
    /// the crash marker. Must be called before process exit; the join is
    /// bounded by a 30 second deadline.
    pub fn shutdown(&self) {

        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + SHUTDOWN_DEADLINE;
        info!("storage shutdown started");

        let writers: Vec<Arc<BatchWriter>> = self.registry.lock()
            .values()
            .filter_map(|entry| entry.writer.upgrade())
            .collect();
        for writer in &writers {
            if !writer.drain(deadline) {
                warn!("a batch writer still had {} writes at the deadline", writer.outstanding());
            }
        }

        self.force_all();

        // Persist the ledger even if the join deadline ends up missed.
        if let Err(e) = self.integrity.flush() {
            warn!("failed to persist the checksum ledger: {e}");
        }

        // Compression first so no new write-lane work appears, then the
        // write lane itself, then the read-side pools.
        let mut clean = self.compress_exec.shutdown(deadline);
        clean &= self.write_exec.shutdown(deadline);
        clean &= self.load_exec.shutdown(deadline);
        clean &= self.decompress_exec.shutdown(deadline);
        clean &= self.background_exec.shutdown(deadline);

        if clean {
            self.integrity.mark_clean_shutdown();
            info!("storage shutdown complete");
        } else {
            // Leave the crash marker in place; the next startup validates
            // everything.
            warn!("storage shutdown passed its deadline, crash marker kept");
        }

    }

}

/// A reference-counted handle over one region's resource stack. Holding it
/// pins the file handle, the mapping and the caches; dropping the last
/// handle tears them down.
#[derive(Clone)]
pub struct RegionHandle {
    res: Arc<RegionResource>,
    engine: Arc<PrefetchEngine>,
    writer: Arc<BatchWriter>,
    reader: Arc<BatchReader>,
}

impl RegionHandle {

    #[inline]
    pub fn path(&self) -> &Path {
        self.res.path()
    }

    #[inline]
    pub fn resource(&self) -> &Arc<RegionResource> {
        &self.res
    }

    #[inline]
    pub fn engine(&self) -> &Arc<PrefetchEngine> {
        &self.engine
    }

    pub fn has_chunk(&self, cx: i32, cz: i32) -> Result<bool, StorageError> {
        Ok(self.res.header()?.has_chunk(cx, cz))
    }

    /// Synchronous cached read. Uncommitted writes are served from the
    /// in-flight map so a writer always reads its own writes.
    pub fn read_chunk(&self, cx: i32, cz: i32) -> Result<Option<Arc<Vec<u8>>>, StorageError> {
        if let Some(pending) = self.writer.get_pending(cx, cz) {
            return Ok(Some(pending));
        }
        Ok(self.engine.read(cx, cz)?)
    }

    /// Asynchronous read through the load pool.
    pub fn load_chunk(&self, cx: i32, cz: i32) -> LoadTicket {
        if let Some(pending) = self.writer.get_pending(cx, cz) {
            return LoadTicket::ready(Ok(Some(pending)));
        }
        self.reader.load(cx, cz)
    }

    /// Queue an asynchronous write.
    pub fn queue_write(&self, cx: i32, cz: i32, payload: Vec<u8>) -> WriteTicket {
        self.writer.save(cx, cz, payload)
    }

    pub fn has_pending(&self, cx: i32, cz: i32) -> bool {
        self.writer.has_pending(cx, cz)
    }

    pub fn get_pending(&self, cx: i32, cz: i32) -> Option<Arc<Vec<u8>>> {
        self.writer.get_pending(cx, cz)
    }

    /// Flush any partially filled batch immediately.
    pub fn flush(&self) {
        self.writer.flush();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.engine.stats()
    }

    /// Opportunity hook for the page-cache warmup sweep.
    pub fn ultra_scan(&self, mover_in_range: bool) {
        self.engine.ultra_scan(mover_in_range);
    }

}

static GLOBAL: OnceCell<Arc<StorageManager>> = OnceCell::new();

/// Install the process-wide default manager. Fails if one is already set.
pub fn init_global(manager: Arc<StorageManager>) -> Result<(), Arc<StorageManager>> {
    GLOBAL.set(manager)
}

/// The process-wide default manager, if one was installed.
pub fn global() -> Option<&'static Arc<StorageManager>> {
    GLOBAL.get()
}

#[cfg(test)]
mod tests {

    use crate::config::PoolSize;

    use super::*;

    fn test_config() -> StorageConfig {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        StorageConfig {
            load_threads: PoolSize::Fixed(2),
            write_threads: PoolSize::Fixed(1),
            compress_threads: PoolSize::Fixed(2),
            decompress_threads: PoolSize::Fixed(1),
            auto_flush_delay: Duration::from_millis(10),
            ..StorageConfig::default()
        }
    }

    #[test]
    fn write_read_through_handle() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(dir.path(), test_config()).unwrap();
        let region = manager.get_region(&dir.path().join("r.0.0.lrf"), true).unwrap();

        let payload = vec![7u8; 3000];
        let ticket = region.queue_write(3, 4, payload.clone());
        ticket.wait().unwrap();

        assert!(region.has_chunk(3, 4).unwrap());
        assert_eq!(*region.read_chunk(3, 4).unwrap().unwrap(), payload);

        manager.shutdown();
    }

    #[test]
    fn read_your_writes_before_commit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(dir.path(), test_config()).unwrap();
        let region = manager.get_region(&dir.path().join("r.0.0.lrf"), true).unwrap();

        let payload = vec![9u8; 100];
        let ticket = region.queue_write(1, 1, payload.clone());

        // Until the batch commits the in-flight map serves the bytes; after
        // commit the durable path serves the same bytes.
        assert_eq!(*region.read_chunk(1, 1).unwrap().unwrap(), payload);
        ticket.wait().unwrap();
        assert!(!region.has_pending(1, 1));
        assert_eq!(*region.read_chunk(1, 1).unwrap().unwrap(), payload);

        manager.shutdown();
    }

    #[test]
    fn async_load_ticket() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(dir.path(), test_config()).unwrap();
        let region = manager.get_region(&dir.path().join("r.0.0.lrf"), true).unwrap();

        region.queue_write(8, 8, b"hello".to_vec()).wait().unwrap();
        let loaded = region.load_chunk(8, 8).wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(loaded.unwrap().as_slice(), b"hello");

        // Loading an absent chunk completes with none.
        let missing = region.load_chunk(20, 20).wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(missing.is_none());

        manager.shutdown();
    }

    #[test]
    fn registry_shares_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(dir.path(), test_config()).unwrap();
        let path = dir.path().join("r.0.0.lrf");

        let a = manager.get_region(&path, true).unwrap();
        let b = manager.get_region(&path, true).unwrap();
        assert!(Arc::ptr_eq(a.resource(), b.resource()));

        let weak = Arc::downgrade(a.resource());
        drop(a);
        assert!(weak.upgrade().is_some());
        drop(b);
        // The registry holds only weak references; the resource is gone.
        assert!(weak.upgrade().is_none());

        manager.shutdown();
    }

    #[test]
    fn concurrent_readers_during_writes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(dir.path(), test_config()).unwrap();
        let region = manager.get_region(&dir.path().join("r.0.0.lrf"), true).unwrap();

        for i in 0..8 {
            region.queue_write(i, 0, vec![i as u8; 512]).wait().unwrap();
        }

        let mut readers = Vec::new();
        for t in 0..8 {
            let region = region.clone();
            readers.push(thread::spawn(move || {
                for _ in 0..50 {
                    let i = t as i32 % 8;
                    let data = region.read_chunk(i, 0).unwrap().unwrap();
                    assert_eq!(*data, vec![i as u8; 512]);
                }
            }));
        }

        let writer = {
            let region = region.clone();
            thread::spawn(move || {
                for round in 0..10 {
                    region.queue_write(8, 0, vec![round as u8; 256]).wait().unwrap();
                }
            })
        };

        for handle in readers {
            handle.join().unwrap();
        }
        writer.join().unwrap();
        manager.shutdown();
    }

    #[test]
    fn tampered_frame_fails_under_full_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.integrity_sampling_probability = 1.0;
        let manager = StorageManager::new(dir.path(), config).unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let region = manager.get_region(&path, true).unwrap();

        region.queue_write(0, 0, vec![0xAA; 2048]).wait().unwrap();
        region.queue_write(1, 0, vec![0xBB; 2048]).wait().unwrap();

        // Flip a payload byte of the first frame behind the engine's back.
        let offset = region.resource().header().unwrap().slot(0, 0).byte_offset();
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(offset + 10)).unwrap();
            file.write_all(&[0xFF]).unwrap();
            file.sync_all().unwrap();
        }
        region.engine().invalidate(0, 0);

        match region.read_chunk(0, 0) {
            Err(StorageError::Region(RegionError::CorruptedPayload { cx: 0, cz: 0 })) => {}
            other => panic!("expected a corrupted payload error, got {other:?}"),
        }
        // The untouched neighbor still reads normally.
        assert_eq!(*region.read_chunk(1, 0).unwrap().unwrap(), vec![0xBB; 2048]);

        manager.shutdown();
    }

    #[test]
    fn crash_escalation_convicts_prior_session_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.0.0.lrf");
        let mut config = test_config();
        config.integrity_sampling_probability = 0.0;

        // Session one writes two chunks and shuts down cleanly, persisting
        // the checksum ledger.
        {
            let manager = StorageManager::new(dir.path(), config.clone()).unwrap();
            let region = manager.get_region(&path, true).unwrap();
            region.queue_write(0, 0, vec![0xAA; 2048]).wait().unwrap();
            region.queue_write(1, 0, vec![0xBB; 2048]).wait().unwrap();
            drop(region);
            manager.shutdown();
        }
        assert!(dir.path().join(crate::integrity::CHECKSUM_FILE).exists());

        // The next run starts from a crash, with a chunk tampered on disk
        // in between.
        std::fs::write(dir.path().join(crate::integrity::CRASH_MARKER), b"").unwrap();
        let offset = {
            let bytes = std::fs::read(&path).unwrap();
            let header = crate::region::RegionHeader::parse(&bytes[..crate::region::HEADER_SIZE]).unwrap();
            header.slot(0, 0).byte_offset()
        };
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.seek(SeekFrom::Start(offset + 10)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        let manager = StorageManager::new(dir.path(), config).unwrap();
        assert!(manager.integrity().in_crash_mode());
        let region = manager.get_region(&path, false).unwrap();

        // The ledger from the previous session convicts the tampered chunk
        // even though the configured sampling probability is zero.
        assert!(matches!(
            region.read_chunk(0, 0),
            Err(StorageError::Region(RegionError::CorruptedPayload { cx: 0, cz: 0 }))
        ));
        assert_eq!(*region.read_chunk(1, 0).unwrap().unwrap(), vec![0xBB; 2048]);

        manager.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StorageManager::new(dir.path(), test_config()).unwrap();
        manager.shutdown();
        manager.shutdown();
        assert!(matches!(
            manager.get_region(&dir.path().join("r.0.0.lrf"), true),
            Err(StorageError::Cancelled)
        ));
        // A clean shutdown removed the crash marker.
        assert!(!dir.path().join(crate::integrity::CRASH_MARKER).exists());
    }

}
