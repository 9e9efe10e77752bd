//! Batched asynchronous pipelines over one region: the batch writer
//! (compress on the compression pool, append on the per-region write lane)
//! and the batch reader (bounded-concurrency loads with dedup and
//! admission queueing).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::CompressionKind;
use crate::prefetch::PrefetchEngine;
use crate::queue::{TaskPriority, TaskQueue};
use crate::region::writer::{EncodedChunk, RegionWriter, WrittenChunk};
use crate::storage::StorageError;
use crate::util::epoch_ms;

/// Queued loads give up after this long without an execution slot.
const LOAD_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval of the admission-queue sweeper. The queue is also polled on
/// every load completion; the sweeper only exists so timeouts still fire
/// when no load completes at all.
const LOAD_QUEUE_SWEEP: Duration = Duration::from_millis(500);

/// One chunk of a committed batch, as reported to post-flush hooks.
#[derive(Debug, Clone, Copy)]
pub struct FlushedChunk {
    pub cx: i32,
    pub cz: i32,
    /// Slot index within the region.
    pub index: usize,
    pub offset: u64,
    pub frame_len: usize,
    /// CRC32C of the frame as written, for the integrity ledger.
    pub crc: u32,
}

/// Hook invoked after every committed batch with the written chunk list.
pub type PostFlushHook = Box<dyn Fn(&[FlushedChunk]) + Send + Sync>;

/// Completion signal of one queued write.
pub struct WriteTicket {
    rx: Receiver<Result<(), StorageError>>,
}

impl WriteTicket {

    /// Block until the write commits or fails.
    pub fn wait(&self) -> Result<(), StorageError> {
        self.rx.recv().unwrap_or(Err(StorageError::Cancelled))
    }

    /// Block with a timeout; false means the caller decides whether to keep
    /// waiting or surrender.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Ok(Ok(())))
    }

}

/// Completion signal of one queued load.
pub struct LoadTicket {
    rx: Receiver<Result<Option<Arc<Vec<u8>>>, StorageError>>,
}

impl LoadTicket {

    /// A ticket that is already complete, used for read-your-writes hits
    /// against the in-flight map.
    pub(crate) fn ready(result: Result<Option<Arc<Vec<u8>>>, StorageError>) -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    pub fn wait(&self) -> Result<Option<Arc<Vec<u8>>>, StorageError> {
        self.rx.recv().unwrap_or(Err(StorageError::Cancelled))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Arc<Vec<u8>>>, StorageError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                Err(StorageError::Cancelled)
            }
        }
    }

}

type DoneSender = Sender<Result<(), StorageError>>;

struct PendingWrite {
    cx: i32,
    cz: i32,
    payload: Arc<Vec<u8>>,
    timestamp_ms: i64,
    done: DoneSender,
}

struct ReadyItem {
    chunk: EncodedChunk,
    cx: i32,
    cz: i32,
    crc: u32,
    /// The payload this batch committed, compared by pointer against the
    /// in-flight map so a newer uncommitted write is never evicted.
    payload: Arc<Vec<u8>>,
    done: DoneSender,
}

struct Completion {
    cx: i32,
    cz: i32,
    crc: u32,
    payload: Arc<Vec<u8>>,
    done: DoneSender,
}

/// A batch past its compression stage, waiting for the write lane. Items
/// may be empty when every chunk failed to compress; the batch still
/// occupies its sequence slot so later batches are not held up.
struct ReadyBatch {
    items: Vec<ReadyItem>,
}

/// Per-region write lane: batches commit strictly in snapshot order, one at
/// a time, regardless of which compression job finishes first.
struct WriteLane {
    ready: BTreeMap<u64, ReadyBatch>,
    next: u64,
    active: bool,
}

struct CompressState {
    seq: u64,
    slots: Mutex<Vec<Option<ReadyItem>>>,
    remaining: AtomicUsize,
}

/// The asynchronous writer of one region.
pub struct BatchWriter {
    writer: RegionWriter,
    compression: CompressionKind,
    level: u32,
    batch_size: usize,
    auto_flush_delay: Duration,
    compress_queue: Arc<TaskQueue>,
    write_queue: Arc<TaskQueue>,
    timer_queue: Arc<TaskQueue>,
    pending: Mutex<Vec<PendingWrite>>,
    flush_scheduled: AtomicBool,
    next_seq: AtomicU64,
    lane: Mutex<WriteLane>,
    /// Chunks accepted but not yet committed, for read-your-writes.
    in_flight: Mutex<HashMap<(i32, i32), Arc<Vec<u8>>>>,
    outstanding: AtomicUsize,
    post_flush: Mutex<Vec<PostFlushHook>>,
}

impl BatchWriter {

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        writer: RegionWriter,
        compression: CompressionKind,
        level: u32,
        batch_size: usize,
        auto_flush_delay: Duration,
        compress_queue: Arc<TaskQueue>,
        write_queue: Arc<TaskQueue>,
        timer_queue: Arc<TaskQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            writer,
            compression,
            level,
            batch_size: batch_size.max(1),
            auto_flush_delay,
            compress_queue,
            write_queue,
            timer_queue,
            pending: Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            lane: Mutex::new(WriteLane { ready: BTreeMap::new(), next: 0, active: false }),
            in_flight: Mutex::new(HashMap::new()),
            outstanding: AtomicUsize::new(0),
            post_flush: Mutex::new(Vec::new()),
        })
    }

    /// Add a hook run after each committed batch. The integrity ledger,
    /// cache invalidation and the world index all ride on this.
    pub fn add_post_flush(&self, hook: PostFlushHook) {
        self.post_flush.lock().push(hook);
    }

    /// Queue a chunk write. The returned ticket completes when the frame is
    /// on disk, or exceptionally when its batch failed.
    pub fn save(self: &Arc<Self>, cx: i32, cz: i32, payload: Vec<u8>) -> WriteTicket {

        let payload = Arc::new(payload);
        let (tx, rx) = bounded(1);

        self.in_flight.lock().insert((cx, cz), Arc::clone(&payload));
        self.outstanding.fetch_add(1, Ordering::SeqCst);

        let flush_now = {
            let mut pending = self.pending.lock();
            pending.push(PendingWrite { cx, cz, payload, timestamp_ms: epoch_ms(), done: tx });
            pending.len() >= self.batch_size
        };

        if flush_now {
            self.flush();
        } else if !self.flush_scheduled.swap(true, Ordering::SeqCst) {
            let this = Arc::clone(self);
            let delay = self.auto_flush_delay;
            let timer = self.timer_queue.push(TaskPriority::Low, Box::new(move || {
                thread::sleep(delay);
                this.flush_scheduled.store(false, Ordering::SeqCst);
                this.flush();
            }));
            if timer.is_err() {
                // Shutting down; flush synchronously rather than dropping
                // the partial batch on the floor.
                self.flush_scheduled.store(false, Ordering::SeqCst);
                self.flush();
            }
        }

        WriteTicket { rx }

    }

    /// True while a write for the chunk is accepted but not yet committed.
    pub fn has_pending(&self, cx: i32, cz: i32) -> bool {
        self.in_flight.lock().contains_key(&(cx, cz))
    }

    /// The uncommitted payload for the chunk, for read-your-writes.
    pub fn get_pending(&self, cx: i32, cz: i32) -> Option<Arc<Vec<u8>>> {
        self.in_flight.lock().get(&(cx, cz)).cloned()
    }

    /// Snapshot the pending list and run it through the pipeline.
    pub fn flush(self: &Arc<Self>) {

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(CompressState {
            seq,
            slots: Mutex::new((0..batch.len()).map(|_| None).collect()),
            remaining: AtomicUsize::new(batch.len()),
        });

        for (slot, item) in batch.into_iter().enumerate() {
            let this = Arc::clone(self);
            let job_state = Arc::clone(&state);
            let queued = self.compress_queue.push(TaskPriority::Normal, Box::new(move || {
                this.compress_one(&job_state, slot, item);
            }));
            if let Err(job) = queued {
                // Executor closed, compress inline so the batch completes.
                job();
            }
        }

    }

    fn compress_one(self: &Arc<Self>, state: &Arc<CompressState>, slot: usize, item: PendingWrite) {
        match EncodedChunk::encode(
            item.cx,
            item.cz,
            &item.payload,
            self.compression,
            self.level,
            item.timestamp_ms,
        ) {
            Ok(chunk) => {
                let crc = chunk.frame_crc();
                state.slots.lock()[slot] = Some(ReadyItem {
                    chunk,
                    cx: item.cx,
                    cz: item.cz,
                    crc,
                    payload: item.payload,
                    done: item.done,
                });
            }
            Err(e) => {
                // Only this caller fails; the rest of the batch proceeds.
                debug!("compression of {}/{} failed: {e}", item.cx, item.cz);
                self.remove_in_flight(item.cx, item.cz, &item.payload);
                let _ = item.done.send(Err(StorageError::Region(e)));
                self.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.compress_done(state);
    }

    /// Count down the compression stage; the last finisher hands the batch
    /// to the write lane.
    fn compress_done(self: &Arc<Self>, state: &Arc<CompressState>) {
        if state.remaining.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let items: Vec<ReadyItem> = state.slots.lock().iter_mut()
            .filter_map(Option::take)
            .collect();
        self.enqueue_ready(state.seq, ReadyBatch { items });
    }

    fn enqueue_ready(self: &Arc<Self>, seq: u64, batch: ReadyBatch) {
        let mut lane = self.lane.lock();
        lane.ready.insert(seq, batch);
        if !lane.active && lane.ready.contains_key(&lane.next) {
            lane.active = true;
            drop(lane);
            let this = Arc::clone(self);
            if self.write_queue.push(TaskPriority::High, Box::new(move || this.drain_lane())).is_err() {
                self.drain_lane();
            }
        }
    }

    /// Commit ready batches strictly in sequence order. One drainer per
    /// region runs at a time.
    fn drain_lane(self: &Arc<Self>) {
        loop {

            let batch = {
                let mut lane = self.lane.lock();
                let next = lane.next;
                match lane.ready.remove(&next) {
                    Some(batch) => {
                        lane.next += 1;
                        batch
                    }
                    None => {
                        lane.active = false;
                        return;
                    }
                }
            };

            if batch.items.is_empty() {
                continue;
            }

            let mut chunks = Vec::with_capacity(batch.items.len());
            let mut completions = Vec::with_capacity(batch.items.len());
            for item in batch.items {
                chunks.push(item.chunk);
                completions.push(Completion {
                    cx: item.cx,
                    cz: item.cz,
                    crc: item.crc,
                    payload: item.payload,
                    done: item.done,
                });
            }

            match self.writer.append_batch(chunks) {
                Ok(outcome) => {
                    let flushed: Vec<FlushedChunk> = outcome.written.iter()
                        .zip(&completions)
                        .map(|(w, c)| FlushedChunk {
                            cx: w.cx,
                            cz: w.cz,
                            index: w.index,
                            offset: w.offset,
                            frame_len: w.frame_len,
                            crc: c.crc,
                        })
                        .collect();

                    self.settle(completions, &outcome.written, None);

                    for hook in self.post_flush.lock().iter() {
                        hook(&flushed);
                    }
                }
                Err(e) => {
                    // The batch's frames interleave into the same file, so
                    // every caller in it shares the failure.
                    warn!("batch write to {} failed: {e}", self.writer.resource().path().display());
                    let shared = Arc::new(StorageError::Region(e));
                    self.settle(completions, &[], Some(shared));
                }
            }

        }
    }

    /// Complete every waiter of a batch and clear its in-flight entries.
    fn settle(
        &self,
        completions: Vec<Completion>,
        written: &[WrittenChunk],
        error: Option<Arc<StorageError>>,
    ) {
        debug_assert!(error.is_some() || written.len() == completions.len());
        for completion in completions {
            self.remove_in_flight(completion.cx, completion.cz, &completion.payload);
            let result = match &error {
                None => Ok(()),
                Some(shared) => Err(StorageError::Shared(Arc::clone(shared))),
            };
            let _ = completion.done.send(result);
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Drop an in-flight entry, but only if it still holds this write's
    /// payload; a newer save to the same chunk must keep serving its bytes.
    fn remove_in_flight(&self, cx: i32, cz: i32, payload: &Arc<Vec<u8>>) {
        let mut in_flight = self.in_flight.lock();
        if let Some(current) = in_flight.get(&(cx, cz)) {
            if Arc::ptr_eq(current, payload) {
                in_flight.remove(&(cx, cz));
            }
        }
    }

    /// Flush everything and wait for the pipeline to empty, bounded by the
    /// deadline. Used at shutdown.
    pub fn drain(self: &Arc<Self>, deadline: Instant) -> bool {
        self.flush();
        while self.outstanding.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Writes accepted and not yet completed, success or failure.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

}

struct QueuedLoad {
    cx: i32,
    cz: i32,
    at: Instant,
}

type LoadWaiters = Vec<Sender<Result<Option<Arc<Vec<u8>>>, StorageError>>>;

/// The asynchronous reader of one region: deduplicates concurrent loads of
/// the same chunk and bounds how many run at once.
pub struct BatchReader {
    engine: Arc<PrefetchEngine>,
    load_queue: Arc<TaskQueue>,
    decompress_queue: Arc<TaskQueue>,
    timer_queue: Arc<TaskQueue>,
    max_concurrent: usize,
    queue_timeout: Duration,
    in_flight: Mutex<HashMap<(i32, i32), LoadWaiters>>,
    active: AtomicUsize,
    queued: Mutex<VecDeque<QueuedLoad>>,
    sweeper_active: AtomicBool,
    decompressed: AtomicU64,
    timed_out: AtomicU64,
}

impl BatchReader {

    pub fn new(
        engine: Arc<PrefetchEngine>,
        load_queue: Arc<TaskQueue>,
        decompress_queue: Arc<TaskQueue>,
        timer_queue: Arc<TaskQueue>,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Self::with_queue_timeout(
            engine,
            load_queue,
            decompress_queue,
            timer_queue,
            max_concurrent,
            LOAD_QUEUE_TIMEOUT,
        )
    }

    fn with_queue_timeout(
        engine: Arc<PrefetchEngine>,
        load_queue: Arc<TaskQueue>,
        decompress_queue: Arc<TaskQueue>,
        timer_queue: Arc<TaskQueue>,
        max_concurrent: usize,
        queue_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            load_queue,
            decompress_queue,
            timer_queue,
            max_concurrent: max_concurrent.max(1),
            queue_timeout,
            in_flight: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            queued: Mutex::new(VecDeque::new()),
            sweeper_active: AtomicBool::new(false),
            decompressed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        })
    }

    /// Queue a chunk load. A load already in flight for the same chunk is
    /// joined instead of duplicated.
    pub fn load(self: &Arc<Self>, cx: i32, cz: i32) -> LoadTicket {

        let (tx, rx) = bounded(1);

        {
            let mut in_flight = self.in_flight.lock();
            if let Some(waiters) = in_flight.get_mut(&(cx, cz)) {
                waiters.push(tx);
                return LoadTicket { rx };
            }
            in_flight.insert((cx, cz), vec![tx]);
        }

        if self.try_admit() {
            self.spawn_load(cx, cz);
        } else {
            self.queued.lock().push_back(QueuedLoad { cx, cz, at: Instant::now() });
            self.arm_sweeper();
        }

        LoadTicket { rx }

    }

    /// Chunks decompressed on behalf of batch loads, for observability.
    pub fn decompressed_count(&self) -> u64 {
        self.decompressed.load(Ordering::Relaxed)
    }

    pub fn timed_out_count(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    fn try_admit(&self) -> bool {
        self.active.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < self.max_concurrent).then_some(n + 1)
        }).is_ok()
    }

    fn spawn_load(self: &Arc<Self>, cx: i32, cz: i32) {
        let this = Arc::clone(self);
        if let Err(job) = self.load_queue.push(TaskPriority::Normal, Box::new(move || this.run_load(cx, cz))) {
            // Executor closed: run inline so the waiters still complete.
            job();
        }
    }

    /// Stage one, on the load pool: serve cache hits, otherwise fetch the
    /// raw frame and hand it to the decompression stage. The admission slot
    /// stays held until the load fully completes.
    fn run_load(self: &Arc<Self>, cx: i32, cz: i32) {

        if let Some(data) = self.engine.cached_read(cx, cz) {
            self.complete(cx, cz, Ok(Some(data)));
            return;
        }

        match self.engine.reader().fetch_frame(cx, cz) {
            Ok(None) => {
                let data = self.engine.insert_loaded(cx, cz, None);
                self.complete(cx, cz, Ok(data));
            }
            Ok(Some(raw)) => {
                let this = Arc::clone(self);
                let decode = self.decompress_queue.push(TaskPriority::Normal, Box::new(move || {
                    this.decode_load(cx, cz, raw);
                }));
                if let Err(job) = decode {
                    job();
                }
            }
            Err(e) => {
                self.complete(cx, cz, Err(Arc::new(StorageError::Region(e))));
            }
        }

    }

    /// Stage two, on the decompression pool: decode the fetched frame and
    /// install it in the cache.
    fn decode_load(self: &Arc<Self>, cx: i32, cz: i32, raw: crate::region::reader::RawFrame) {
        let result = match self.engine.reader().decode_frame(raw) {
            Ok(payload) => {
                self.decompressed.fetch_add(1, Ordering::Relaxed);
                Ok(self.engine.insert_loaded(cx, cz, Some(payload.data)))
            }
            Err(e) => Err(Arc::new(StorageError::Region(e))),
        };
        self.complete(cx, cz, result);
    }

    /// Finish the waiters, free the admission slot and admit queued loads.
    fn complete(self: &Arc<Self>, cx: i32, cz: i32, result: Result<Option<Arc<Vec<u8>>>, Arc<StorageError>>) {
        self.finish(cx, cz, result);
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.poll_queue();
    }

    fn finish(&self, cx: i32, cz: i32, result: Result<Option<Arc<Vec<u8>>>, Arc<StorageError>>) {
        let waiters = self.in_flight.lock().remove(&(cx, cz)).unwrap_or_default();
        for waiter in waiters {
            let each = match &result {
                Ok(data) => Ok(data.clone()),
                Err(shared) => Err(StorageError::Shared(Arc::clone(shared))),
            };
            let _ = waiter.send(each);
        }
    }

    /// Admit queued loads as slots free up, expiring the ones that waited
    /// too long with an empty completion.
    fn poll_queue(self: &Arc<Self>) {
        loop {
            let next = match self.queued.lock().pop_front() {
                None => return,
                Some(load) => load,
            };

            if next.at.elapsed() >= self.queue_timeout {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                debug!("queued load of {}/{} timed out", next.cx, next.cz);
                self.finish(next.cx, next.cz, Ok(None));
                continue;
            }

            if self.try_admit() {
                self.spawn_load(next.cx, next.cz);
            } else {
                self.queued.lock().push_front(next);
                return;
            }
        }
    }

    /// Keep a periodic sweep alive while loads sit in the admission queue,
    /// so their timeouts fire even when no other load ever completes. The
    /// sweep re-arms itself until the queue drains.
    fn arm_sweeper(self: &Arc<Self>) {
        if self.sweeper_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval = self.queue_timeout.min(LOAD_QUEUE_SWEEP);
        let weak = Arc::downgrade(self);
        let armed = self.timer_queue.push(TaskPriority::Low, Box::new(move || {
            thread::sleep(interval);
            let Some(reader) = weak.upgrade() else { return };
            reader.sweeper_active.store(false, Ordering::SeqCst);
            reader.poll_queue();
            if !reader.queued.lock().is_empty() {
                reader.arm_sweeper();
            }
        }));
        if armed.is_err() {
            // Storage is stopping; expire what we can right away.
            self.sweeper_active.store(false, Ordering::SeqCst);
            self.poll_queue();
        }
    }

}
