//! Reader/writer synchronization around a region file's mmap and disk
//! forces. Readers share the barrier; a flushing writer holds it
//! exclusively and forces buffers before releasing, so a reader that starts
//! after the release always observes the flushed bytes. Ordering alone is
//! not enough here, mmap reads and channel writes can race at the OS level
//! without an explicit force between them.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The synchronization object coordinating readers, writers and disk forces
/// for one region file.
pub struct FlushBarrier {
    lock: RwLock<()>,
    forces: AtomicU64,
}

/// Shared access held for the duration of one chunk read.
pub struct ReadPass<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive access held for the duration of one batch flush. Dropping the
/// pass releases the barrier; call [`FlushPass::force`] first when the write
/// policy requires durability.
pub struct FlushPass<'a> {
    barrier: &'a FlushBarrier,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl FlushBarrier {

    pub fn new() -> Self {
        Self {
            lock: RwLock::new(()),
            forces: AtomicU64::new(0),
        }
    }

    /// Enter the barrier in shared mode. Blocks while a flush is in
    /// progress.
    pub fn before_read(&self) -> ReadPass<'_> {
        ReadPass { _guard: self.lock.read() }
    }

    /// Enter the barrier in exclusive mode, waiting out every in-flight
    /// reader.
    pub fn before_flush(&self) -> FlushPass<'_> {
        FlushPass { barrier: self, _guard: self.lock.write() }
    }

    /// Attempt shared entry without blocking, used by opportunistic paths
    /// like cache warm-touching that must never stall behind a writer.
    pub fn try_before_read(&self) -> Option<ReadPass<'_>> {
        self.lock.try_read().map(|guard| ReadPass { _guard: guard })
    }

    /// Number of disk forces issued through this barrier.
    pub fn force_count(&self) -> u64 {
        self.forces.load(Ordering::Relaxed)
    }

}

impl Default for FlushBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushPass<'_> {

    /// Force written data to disk while still holding the barrier
    /// exclusively.
    pub fn force(&self, file: &File) -> io::Result<()> {
        file.sync_data()?;
        self.barrier.forces.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

}

#[cfg(test)]
mod tests {

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn readers_share() {
        let barrier = FlushBarrier::new();
        let _a = barrier.before_read();
        let _b = barrier.before_read();
        assert!(barrier.try_before_read().is_some());
    }

    #[test]
    fn flush_excludes_readers() {
        let barrier = Arc::new(FlushBarrier::new());
        let pass = barrier.before_flush();
        assert!(barrier.try_before_read().is_none());
        drop(pass);
        assert!(barrier.try_before_read().is_some());
    }

    #[test]
    fn flush_waits_for_readers() {
        let barrier = Arc::new(FlushBarrier::new());
        let read = barrier.before_read();

        let flusher = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let _pass = barrier.before_flush();
            })
        };

        // The flusher cannot proceed while the read pass is alive.
        thread::sleep(Duration::from_millis(20));
        assert!(!flusher.is_finished());
        drop(read);
        flusher.join().unwrap();
    }

}
