//! Per-region read-ahead: an LRU chunk cache fed by momentum and
//! intent-driven background prefetch, with an adaptive lookahead controller
//! and an optional rate-limited page-cache warmup sweep.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::coord::{chunk_index, same_region, SpiralIter, REGION_CHUNKS};
use crate::intent::IntentPredictor;
use crate::queue::{TaskPriority, TaskQueue};
use crate::region::reader::RegionReader;
use crate::region::RegionError;

/// A resident entry expires this long after its last access.
const ENTRY_TTL: Duration = Duration::from_secs(300);

/// Minimum accesses in the sampling window before the lookahead adapts.
const ADAPT_WINDOW: u64 = 10;

/// A second trigger from the same origin chunk within this interval is
/// dropped.
const TRIGGER_THROTTLE: Duration = Duration::from_secs(1);

/// A previous access farther away than this is a teleport, not movement.
const MOMENTUM_RANGE: i32 = 12;

/// Manhattan speed at or above which the spiral prunes candidates behind
/// the mover.
const HIGH_SPEED: i32 = 2;

/// Interval between page-cache warmup sweeps.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Warmup sweep sub-batch size and spacing.
const SCAN_BATCH: usize = 8;
const SCAN_SPACING: Duration = Duration::from_millis(50);

/// The common surface of a cache layer, so hot/warm/cold tiers compose
/// behind one interface.
pub trait CacheLayer {
    /// Fetch and refresh an entry.
    fn get(&self, index: usize) -> Option<Arc<Vec<u8>>>;
    /// Insert an entry, evicting per the layer's policy.
    fn put(&self, index: usize, data: Arc<Vec<u8>>);
    /// Refresh an entry's position without reading it, used when a lower
    /// tier re-confirms residency.
    fn promote(&self, index: usize);
}

struct CacheEntry {
    data: Arc<Vec<u8>>,
    last_access: Instant,
    prefetched: bool,
}

struct CacheState {
    lru: LruCache<usize, CacheEntry>,
    bytes: usize,
}

/// The in-memory hot tier: LRU-ordered, bounded by both a byte quota and an
/// entry count.
pub struct LruLayer {
    state: Mutex<CacheState>,
    max_bytes: usize,
}

impl LruLayer {

    fn new(max_bytes: usize, max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap();
        Self {
            state: Mutex::new(CacheState { lru: LruCache::new(cap), bytes: 0 }),
            max_bytes,
        }
    }

    /// Fetch at an explicit clock, expiring on TTL.
    fn get_at(&self, index: usize, now: Instant) -> Option<(Arc<Vec<u8>>, bool)> {
        let mut state = self.state.lock();
        let expired = match state.lru.peek(&index) {
            None => return None,
            Some(entry) => now.duration_since(entry.last_access) > ENTRY_TTL,
        };
        if expired {
            if let Some(dead) = state.lru.pop(&index) {
                state.bytes -= dead.data.len();
            }
            return None;
        }
        let entry = state.lru.get_mut(&index)?;
        entry.last_access = now;
        Some((Arc::clone(&entry.data), entry.prefetched))
    }

    /// Insert at an explicit clock. A prefetched entry never clobbers a
    /// resident one.
    fn put_at(&self, index: usize, data: Arc<Vec<u8>>, prefetched: bool, now: Instant) {
        let mut state = self.state.lock();
        if prefetched && state.lru.contains(&index) {
            return;
        }
        if let Some(old) = state.lru.pop(&index) {
            state.bytes -= old.data.len();
        }
        state.bytes += data.len();
        // The entry-count cap can evict the tail on push; account for it.
        if let Some((_, evicted)) = state.lru.push(index, CacheEntry { data, last_access: now, prefetched }) {
            state.bytes -= evicted.data.len();
        }
        while state.bytes > self.max_bytes {
            match state.lru.pop_lru() {
                Some((_, evicted)) => state.bytes -= evicted.data.len(),
                None => break,
            }
        }
    }

    fn remove(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(old) = state.lru.pop(&index) {
            state.bytes -= old.data.len();
        }
    }

    fn contains(&self, index: usize) -> bool {
        self.state.lock().lru.contains(&index)
    }

    fn len(&self) -> usize {
        self.state.lock().lru.len()
    }

    fn bytes(&self) -> usize {
        self.state.lock().bytes
    }

}

impl CacheLayer for LruLayer {

    fn get(&self, index: usize) -> Option<Arc<Vec<u8>>> {
        self.get_at(index, Instant::now()).map(|(data, _)| data)
    }

    fn put(&self, index: usize, data: Arc<Vec<u8>>) {
        self.put_at(index, data, false, Instant::now());
    }

    fn promote(&self, index: usize) {
        let mut state = self.state.lock();
        if let Some(entry) = state.lru.get_mut(&index) {
            entry.last_access = Instant::now();
        }
    }

}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    prefetched_hits: AtomicU64,
    prefetches: AtomicU64,
    prefetch_errors: AtomicU64,
    window_hits: AtomicU64,
    window_misses: AtomicU64,
    window_prefetched_hits: AtomicU64,
}

/// Snapshot of the engine's counters.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub prefetched_hits: u64,
    pub prefetches: u64,
    pub prefetch_errors: u64,
    pub lookahead: usize,
    pub entries: usize,
    pub bytes: usize,
}

#[derive(Clone, Copy)]
struct LastAccess {
    cx: i32,
    cz: i32,
}

/// The prefetch engine of one region. Holds the region resource through its
/// reader for as long as the engine lives.
pub struct PrefetchEngine {
    reader: RegionReader,
    cache: LruLayer,
    tasks: Arc<TaskQueue>,
    batch_size: usize,
    prefetch_distance: i32,
    base_scale: usize,
    lookahead: AtomicUsize,
    intent: Mutex<IntentPredictor>,
    last: Mutex<Option<LastAccess>>,
    /// Origin chunks that triggered recently, for the trigger throttle.
    recent: Mutex<HashMap<usize, Instant>>,
    /// Slots with a background read in flight.
    filling: Mutex<HashSet<usize>>,
    pending: AtomicUsize,
    counters: Counters,
    ultra_scan_enabled: bool,
    last_scan: Mutex<Option<Instant>>,
}

impl PrefetchEngine {

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        reader: RegionReader,
        tasks: Arc<TaskQueue>,
        batch_size: usize,
        prefetch_distance: i32,
        base_scale: usize,
        max_cache_bytes: usize,
        max_cache_entries: usize,
        ultra_scan_enabled: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            reader,
            cache: LruLayer::new(max_cache_bytes, max_cache_entries),
            tasks,
            batch_size: batch_size.max(1),
            prefetch_distance,
            base_scale: base_scale.max(2),
            lookahead: AtomicUsize::new(base_scale.max(2)),
            intent: Mutex::new(IntentPredictor::new()),
            last: Mutex::new(None),
            recent: Mutex::new(HashMap::new()),
            filling: Mutex::new(HashSet::new()),
            pending: AtomicUsize::new(0),
            counters: Counters::default(),
            ultra_scan_enabled,
            last_scan: Mutex::new(None),
        })
    }

    #[inline]
    pub fn reader(&self) -> &RegionReader {
        &self.reader
    }

    /// Read a chunk through the cache. A hit returns immediately and still
    /// nudges the predictive machinery; a miss reads through the region
    /// reader and caches the result.
    pub fn read(self: &Arc<Self>, cx: i32, cz: i32) -> Result<Option<Arc<Vec<u8>>>, RegionError> {
        if let Some(data) = self.cached_read(cx, cz) {
            return Ok(Some(data));
        }
        let payload = self.reader.read_chunk(cx, cz)?;
        Ok(self.insert_loaded(cx, cz, payload))
    }

    /// Cache-only read with full hit bookkeeping and prefetch nudging.
    /// Returns none on a miss without accounting it; the caller is expected
    /// to follow up with [`Self::insert_loaded`].
    pub fn cached_read(self: &Arc<Self>, cx: i32, cz: i32) -> Option<Arc<Vec<u8>>> {

        let index = chunk_index(cx, cz);
        let now = Instant::now();
        let prev = *self.last.lock();

        let (data, prefetched) = self.cache.get_at(index, now)?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.counters.window_hits.fetch_add(1, Ordering::Relaxed);
        if prefetched {
            self.counters.prefetched_hits.fetch_add(1, Ordering::Relaxed);
            self.counters.window_prefetched_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.note_access(cx, cz);
        self.trigger_prefetch(cx, cz, prev, now);
        self.maybe_adapt();
        Some(data)

    }

    /// Account a cache miss and install the payload a lower stage just
    /// decoded for this chunk.
    pub fn insert_loaded(self: &Arc<Self>, cx: i32, cz: i32, payload: Option<Vec<u8>>) -> Option<Arc<Vec<u8>>> {

        let index = chunk_index(cx, cz);
        let now = Instant::now();
        let prev = *self.last.lock();

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters.window_misses.fetch_add(1, Ordering::Relaxed);

        let data = payload.map(|p| {
            let data = Arc::new(p);
            self.cache.put_at(index, Arc::clone(&data), false, now);
            data
        });

        self.note_access(cx, cz);
        self.trigger_prefetch(cx, cz, prev, now);
        self.maybe_adapt();
        data

    }

    /// Drop a cached entry, called when a writer commits new bytes for the
    /// chunk.
    pub fn invalidate(&self, cx: i32, cz: i32) {
        self.cache.remove(chunk_index(cx, cz));
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            prefetched_hits: self.counters.prefetched_hits.load(Ordering::Relaxed),
            prefetches: self.counters.prefetches.load(Ordering::Relaxed),
            prefetch_errors: self.counters.prefetch_errors.load(Ordering::Relaxed),
            lookahead: self.lookahead.load(Ordering::Relaxed),
            entries: self.cache.len(),
            bytes: self.cache.bytes(),
        }
    }

    fn note_access(&self, cx: i32, cz: i32) {
        self.intent.lock().record(cx, cz);
        *self.last.lock() = Some(LastAccess { cx, cz });
    }

    /// Momentum of the current access relative to the previous one, or none
    /// on the first access and on teleports.
    fn momentum(prev: Option<LastAccess>, cx: i32, cz: i32) -> Option<(i32, i32)> {
        let prev = prev?;
        let (vx, vz) = (cx - prev.cx, cz - prev.cz);
        if vx.abs() > MOMENTUM_RANGE || vz.abs() > MOMENTUM_RANGE {
            return None;
        }
        Some((vx, vz))
    }

    fn trigger_prefetch(self: &Arc<Self>, cx: i32, cz: i32, prev: Option<LastAccess>, now: Instant) {

        let origin = chunk_index(cx, cz);
        {
            let mut recent = self.recent.lock();
            if let Some(at) = recent.get(&origin) {
                if now.duration_since(*at) < TRIGGER_THROTTLE {
                    return;
                }
            }
            recent.insert(origin, now);
            recent.retain(|_, at| now.duration_since(*at) < TRIGGER_THROTTLE * 4);
        }

        let momentum = Self::momentum(prev, cx, cz);
        let speed = momentum.map(|(vx, vz)| vx.abs() + vz.abs()).unwrap_or(0);

        if self.pending.load(Ordering::Relaxed) > self.batch_size * 4 && speed < HIGH_SPEED {
            return;
        }

        let lookahead = self.lookahead.load(Ordering::Relaxed);
        let mut candidates = Vec::with_capacity(self.batch_size);
        let mut seen = HashSet::new();

        // Intent-predicted cone first, it carries direction probability.
        for (px, pz) in self.intent.lock().predict(cx, cz, lookahead) {
            if seen.insert((px, pz)) {
                candidates.push((px, pz));
            }
        }

        // Then the spatial spiral, pruned behind the mover at speed. The
        // immediate 3x3 neighborhood is always kept.
        for (sx, sz) in SpiralIter::new(cx, cz, self.prefetch_distance) {
            if candidates.len() >= self.batch_size {
                break;
            }
            if (sx, sz) == (cx, cz) || !seen.insert((sx, sz)) {
                continue;
            }
            let (dx, dz) = (sx - cx, sz - cz);
            let near = dx.abs() <= 1 && dz.abs() <= 1;
            if let Some((vx, vz)) = momentum {
                // At speed, drop candidates behind the mover; the immediate
                // 3x3 neighborhood is always kept.
                if !near && speed >= HIGH_SPEED && dx * vx + dz * vz < 0 {
                    continue;
                }
            }
            candidates.push((sx, sz));
        }
        candidates.truncate(self.batch_size);

        for (px, pz) in candidates {
            // Candidates in a neighboring region belong to that region's
            // engine; the storage layer dispatches those.
            if !same_region(px, pz, cx, cz) {
                continue;
            }
            self.spawn_fill(px, pz);
        }

    }

    /// Queue a background read of one chunk into the cache.
    fn spawn_fill(self: &Arc<Self>, cx: i32, cz: i32) {

        let index = chunk_index(cx, cz);
        {
            let mut filling = self.filling.lock();
            if filling.contains(&index) || self.cache.contains(index) {
                return;
            }
            filling.insert(index);
        }

        self.pending.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::clone(self);

        let queued = self.tasks.push(TaskPriority::Background, Box::new(move || {
            let result = engine.reader.read_chunk(cx, cz);
            engine.filling.lock().remove(&index);
            engine.pending.fetch_sub(1, Ordering::Relaxed);
            match result {
                Ok(Some(payload)) => {
                    engine.cache.put_at(index, Arc::new(payload), true, Instant::now());
                    engine.counters.prefetches.fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(e) => {
                    // Prefetch never fails a foreground read; count and move on.
                    engine.counters.prefetch_errors.fetch_add(1, Ordering::Relaxed);
                    debug!("prefetch of {cx}/{cz} failed: {e}");
                }
            }
        }));

        if queued.is_err() {
            self.filling.lock().remove(&index);
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }

    }

    /// Adjust the lookahead once enough samples accumulated: widen while
    /// the hit rate is poor, narrow when hits are plentiful but prefetches
    /// rarely earn them.
    fn maybe_adapt(&self) {

        let hits = self.counters.window_hits.load(Ordering::Relaxed);
        let misses = self.counters.window_misses.load(Ordering::Relaxed);
        if hits + misses < ADAPT_WINDOW {
            return;
        }

        let prefetched_hits = self.counters.window_prefetched_hits.load(Ordering::Relaxed);
        self.counters.window_hits.store(0, Ordering::Relaxed);
        self.counters.window_misses.store(0, Ordering::Relaxed);
        self.counters.window_prefetched_hits.store(0, Ordering::Relaxed);

        let hit_rate = hits as f64 / (hits + misses) as f64;
        let lookahead = self.lookahead.load(Ordering::Relaxed);

        if hit_rate < 0.80 && lookahead < self.base_scale * 2 {
            self.lookahead.store(lookahead + 1, Ordering::Relaxed);
        } else if hit_rate > 0.95 {
            let efficiency = if hits == 0 { 0.0 } else { prefetched_hits as f64 / hits as f64 };
            let floor = (self.base_scale / 2).max(2);
            if efficiency < 0.40 && lookahead > floor {
                self.lookahead.store(lookahead - 1, Ordering::Relaxed);
            }
        }

    }

    /// Schedule a low-priority sweep warm-touching every occupied slot, to
    /// pre-populate the OS page cache without decompressing anything. Rate
    /// limited and gated on the mover actually being inside this region's
    /// influence.
    pub fn ultra_scan(self: &Arc<Self>, mover_in_range: bool) {

        if !self.ultra_scan_enabled || !mover_in_range {
            return;
        }

        {
            let mut last = self.last_scan.lock();
            let now = Instant::now();
            if let Some(at) = *last {
                if now.duration_since(at) < SCAN_INTERVAL {
                    return;
                }
            }
            *last = Some(now);
        }

        let engine = Arc::clone(self);
        let _ = self.tasks.push(TaskPriority::Background, Box::new(move || {
            let Ok(header) = engine.reader.resource().header() else { return };
            let mut touched = 0usize;
            for index in 0..REGION_CHUNKS {
                if header.slot_at(index).is_empty() {
                    continue;
                }
                let (cx, cz) = crate::coord::chunk_of_index(index);
                if let Err(e) = engine.reader.warm_touch(cx, cz) {
                    debug!("warm touch of {cx}/{cz} failed: {e}");
                }
                touched += 1;
                if touched % SCAN_BATCH == 0 {
                    thread::sleep(SCAN_SPACING);
                }
            }
        }));

    }

}

#[cfg(test)]
mod tests {

    use crate::buffer::BufferPool;
    use crate::codec::CompressionKind;
    use crate::region::resource::RegionResource;
    use crate::region::writer::RegionWriter;

    use super::*;

    fn engine_over(dir: &std::path::Path) -> (Arc<PrefetchEngine>, RegionWriter, Arc<TaskQueue>) {
        let path = dir.join("r.0.0.lrf");
        let res = RegionResource::open(&path, true, true, CompressionKind::Fast).unwrap();
        let writer = RegionWriter::new(Arc::clone(&res), CompressionKind::Fast, 6, 64);
        let reader = RegionReader::new(res, Arc::new(BufferPool::new()));
        let tasks = Arc::new(TaskQueue::new());
        let engine = PrefetchEngine::new(reader, Arc::clone(&tasks), 16, 3, 8, 1 << 20, 64, false);
        (engine, writer, tasks)
    }

    /// Run queued background tasks inline.
    fn drain(tasks: &TaskQueue) {
        while !tasks.is_empty() {
            if let Some(job) = tasks.pop() {
                job();
            }
        }
    }

    #[test]
    fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, writer, _tasks) = engine_over(dir.path());
        writer.append_chunk(2, 2, b"payload", 1).unwrap();

        assert_eq!(engine.read(2, 2).unwrap().unwrap().as_slice(), b"payload");
        assert_eq!(engine.read(2, 2).unwrap().unwrap().as_slice(), b"payload");

        let stats = engine.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn cached_value_matches_reader() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, writer, tasks) = engine_over(dir.path());
        for i in 0..6 {
            writer.append_chunk(i, 0, &[i as u8; 128], i as i64).unwrap();
        }
        for i in 0..6 {
            let via_cache = engine.read(i, 0).unwrap().unwrap();
            let direct = engine.reader().read_chunk(i, 0).unwrap().unwrap();
            assert_eq!(*via_cache, direct);
        }
        drain(&tasks);
    }

    #[test]
    fn movement_prefetches_ahead() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, writer, tasks) = engine_over(dir.path());
        for i in 0..10 {
            writer.append_chunk(i, 0, &[i as u8; 64], i as i64).unwrap();
        }

        // Walk east; the predictor needs a few samples to find direction.
        for i in 0..3 {
            engine.read(i, 0).unwrap();
            drain(&tasks);
        }

        // The chunk ahead must now be resident and flagged prefetched.
        let index = chunk_index(3, 0);
        assert!(engine.cache.contains(index));
        let before = engine.stats().prefetched_hits;
        engine.read(3, 0).unwrap();
        assert_eq!(engine.stats().prefetched_hits, before + 1);
        drain(&tasks);
    }

    #[test]
    fn prefetch_errors_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, writer, tasks) = engine_over(dir.path());
        for i in 0..4 {
            writer.append_chunk(i, 0, &[1; 32], 0).unwrap();
        }
        for i in 0..4 {
            assert!(engine.read(i, 0).is_ok());
            drain(&tasks);
        }
        // Foreground reads stayed healthy regardless of background outcomes.
        assert_eq!(engine.stats().misses + engine.stats().hits, 4);
    }

    #[test]
    fn invalidation_forces_reread() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, writer, tasks) = engine_over(dir.path());
        writer.append_chunk(1, 1, b"old", 1).unwrap();
        assert_eq!(engine.read(1, 1).unwrap().unwrap().as_slice(), b"old");

        writer.append_chunk(1, 1, b"new", 2).unwrap();
        engine.invalidate(1, 1);
        assert_eq!(engine.read(1, 1).unwrap().unwrap().as_slice(), b"new");
        drain(&tasks);
    }

    #[test]
    fn byte_quota_evicts_lru() {
        let layer = LruLayer::new(1024, 64);
        let now = Instant::now();
        layer.put_at(0, Arc::new(vec![0; 600]), false, now);
        layer.put_at(1, Arc::new(vec![1; 600]), false, now);
        // Entry 0 was least recently used and fell to the quota.
        assert!(!layer.contains(0));
        assert!(layer.contains(1));
        assert!(layer.bytes() <= 1024);
    }

    #[test]
    fn prefetched_entry_does_not_clobber_resident() {
        let layer = LruLayer::new(1 << 20, 8);
        let now = Instant::now();
        layer.put_at(5, Arc::new(b"resident".to_vec()), false, now);
        layer.put_at(5, Arc::new(b"stale".to_vec()), true, now);
        assert_eq!(layer.get_at(5, now).unwrap().0.as_slice(), b"resident");
    }

    #[test]
    fn layers_compose_behind_the_trait() {
        let layer = LruLayer::new(1 << 20, 8);
        let tier: &dyn CacheLayer = &layer;
        assert!(tier.get(2).is_none());
        tier.put(2, Arc::new(vec![1, 2, 3]));
        assert_eq!(tier.get(2).unwrap().as_slice(), &[1, 2, 3]);
        tier.promote(2);
        assert!(layer.contains(2));
    }

    #[test]
    fn ttl_expires_entries() {
        let layer = LruLayer::new(1 << 20, 8);
        let now = Instant::now();
        layer.put_at(3, Arc::new(vec![1, 2, 3]), false, now);
        assert!(layer.get_at(3, now + Duration::from_secs(1)).is_some());
        assert!(layer.get_at(3, now + ENTRY_TTL + Duration::from_secs(1)).is_none());
    }

}
