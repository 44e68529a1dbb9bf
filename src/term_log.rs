use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, warn};

use crate::cache::LCache;
use crate::config::LogConfig;
use crate::error::{LogError, LogResult};
use crate::reader::SegmentReader;
use crate::segment::Segment;
use crate::state_log::LogInfo;
use crate::worker::Worker;
use crate::writer::SegmentWriter;

/// Commit callbacks receive this when the log closes before their
/// threshold commits.
pub const CLOSED_SIGNAL: i64 = i64::MIN;

/// Commit callbacks receive this when the term ends below their threshold.
pub const TERM_END_SIGNAL: i64 = -1;

/// Result of a blocking commit wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The commit watermark reached at least the waited-for index; bytes
    /// below the returned index may be read without blocking.
    Committed(u64),
    /// The term ended below the waited-for index.
    TermEnd,
    /// The timeout elapsed first.
    TimedOut,
    /// The log, or the owning writer/reader, closed.
    Closed,
}

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// Allocates a park-key tag identifying a waiter owner (log, writer or
/// reader). Tag zero means unowned.
pub(crate) fn next_tag() -> u64 {
    NEXT_TAG.fetch_add(1, Ordering::Relaxed)
}

/// Reusable parked-thread continuation. One per thread and term log,
/// overwritten on reuse so the serving hot path never allocates.
struct DelayedWaiter {
    thread: Thread,
    tag: AtomicU64,
    actual: AtomicI64,
}

impl DelayedWaiter {
    fn signal(&self, index: i64) {
        self.tag.store(0, Ordering::Release);
        self.actual.store(index, Ordering::Release);
        self.thread.unpark();
    }
}

thread_local! {
    static LOCAL_WAITERS: RefCell<HashMap<u64, Arc<DelayedWaiter>>> =
        RefCell::new(HashMap::new());
}

fn local_waiter(log_tag: u64) -> Arc<DelayedWaiter> {
    LOCAL_WAITERS.with(|waiters| {
        waiters
            .borrow_mut()
            .entry(log_tag)
            .or_insert_with(|| {
                Arc::new(DelayedWaiter {
                    thread: thread::current(),
                    tag: AtomicU64::new(0),
                    actual: AtomicI64::new(0),
                })
            })
            .clone()
    })
}

enum CommitObserver {
    Waiter(Arc<DelayedWaiter>),
    Task(Box<dyn FnOnce(i64) + Send>),
}

// `Box<dyn FnOnce(i64) + Send>` is not `Sync`, but every `CommitObserver` lives
// behind `LogState`'s `RwLock`, which already serializes all access; no
// two threads ever touch a `CommitObserver` concurrently.
unsafe impl Sync for CommitObserver {}

impl CommitObserver {
    fn run(self, index: i64) {
        match self {
            CommitObserver::Waiter(waiter) => waiter.signal(index),
            CommitObserver::Task(task) => task(index),
        }
    }
}

/// Commit-threshold queue entry; min-ordered by threshold.
struct CommitEntry {
    counter: u64,
    observer: CommitObserver,
}

impl PartialEq for CommitEntry {
    fn eq(&self, other: &Self) -> bool {
        self.counter == other.counter
    }
}

impl Eq for CommitEntry {}

impl PartialOrd for CommitEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommitEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.counter.cmp(&self.counter)
    }
}

/// Non-contiguous writer queue entry; min-ordered by writer start index.
struct NonContigWriter(Arc<SegmentWriter>);

impl PartialEq for NonContigWriter {
    fn eq(&self, other: &Self) -> bool {
        self.0.start_index() == other.0.start_index()
    }
}

impl Eq for NonContigWriter {}

impl PartialOrd for NonContigWriter {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for NonContigWriter {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.start_index().cmp(&self.0.start_index())
    }
}

struct LogState {
    commit_index: u64,
    highest_index: u64,
    contig_index: u64,
    end_index: u64,
    closed: bool,
    segments: BTreeMap<u64, Arc<Segment>>,
    non_contig: BinaryHeap<NonContigWriter>,
    commit_tasks: BinaryHeap<CommitEntry>,
}

impl LogState {
    fn actual_commit(&self) -> u64 {
        self.commit_index.min(self.highest_index)
    }

    fn floor_segment(&self, index: u64) -> Option<&Arc<Segment>> {
        self.segments.range(..=index).next_back().map(|(_, seg)| seg)
    }

    fn higher_segment(&self, index: u64) -> Option<&Arc<Segment>> {
        self.segments
            .range((std::ops::Bound::Excluded(index), std::ops::Bound::Unbounded))
            .next()
            .map(|(_, seg)| seg)
    }
}

/// Append-only log for a single election term, stored in file segments.
///
/// All index fields, the segment set and both priority queues live behind
/// one read-write latch; the dirty FIFO has its own latch so writers are
/// not serialized against `sync`. Writers and readers hold counted segment
/// references; idle segments park in a small LRU whose evictions are
/// unmapped and closed on the shared background worker.
pub struct TermLog {
    weak_self: Weak<TermLog>,
    worker: Arc<Worker>,
    base: PathBuf,
    prev_term: u64,
    term: u64,
    start_index: u64,
    tag: u64,
    config: LogConfig,
    state: RwLock<LogState>,
    dirty: Mutex<VecDeque<Arc<Segment>>>,
    sync_lock: RwLock<()>,
    segment_cache: Mutex<LCache<Arc<Segment>>>,
    writer_cache: Mutex<LCache<Arc<SegmentWriter>>>,
    reader_cache: Mutex<LCache<Arc<SegmentReader>>>,
}

impl TermLog {
    /// Creates a brand new term starting (and committed) at `start_index`.
    pub fn create(
        worker: Arc<Worker>,
        base: &Path,
        prev_term: u64,
        term: u64,
        start_index: u64,
        commit_index: u64,
        config: LogConfig,
    ) -> LogResult<Arc<TermLog>> {
        Self::build(
            worker,
            base,
            prev_term,
            term,
            Some(start_index),
            commit_index,
            start_index,
            Some(Vec::new()),
            config,
        )
    }

    /// Opens an existing term from its on-disk segments.
    ///
    /// Pass `None` for `start_index` to adopt the lowest on-disk segment's
    /// start, and `None` for `segment_file_names` to discover files by
    /// matching `<base>.<term>.<digits>` in the base directory.
    pub fn open(
        worker: Arc<Worker>,
        base: &Path,
        prev_term: u64,
        term: u64,
        start_index: Option<u64>,
        commit_index: u64,
        highest_index: u64,
        segment_file_names: Option<Vec<String>>,
        config: LogConfig,
    ) -> LogResult<Arc<TermLog>> {
        Self::build(
            worker,
            base,
            prev_term,
            term,
            start_index,
            commit_index,
            highest_index,
            segment_file_names,
            config,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        worker: Arc<Worker>,
        base: &Path,
        prev_term: u64,
        term: u64,
        start_index: Option<u64>,
        commit_index: u64,
        highest_index: u64,
        segment_file_names: Option<Vec<String>>,
        config: LogConfig,
    ) -> LogResult<Arc<TermLog>> {
        config.validate()?;
        let base = check_base(base)?;

        if commit_index > highest_index {
            return Err(LogError::invalid_config(format!(
                "commit index is higher than highest index: {commit_index} > {highest_index}"
            )));
        }

        let names = match segment_file_names {
            Some(names) => names,
            None => discover_segment_files(&base, term)?,
        };

        let parent = base.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut segments: BTreeMap<u64, Arc<Segment>> = BTreeMap::new();

        for name in &names {
            let start = parse_start_index(name)?;
            let path = parent.join(name);
            let file_len = fs::metadata(&path)?.len();
            // Start with the desired max length; the second pass truncates.
            let max_length = config.segment_length(segments.len()).max(file_len);
            segments.insert(start, Arc::new(Segment::new(start, max_length, path)));
        }

        let start_index = match start_index {
            Some(start) => {
                if start < highest_index {
                    match segments.values().next() {
                        Some(first) if first.start_index() <= start => {}
                        _ => {
                            return Err(LogError::MissingSegment {
                                start_index: start,
                                term,
                            })
                        }
                    }
                }
                start
            }
            None => match segments.values().next() {
                Some(first) => first.start_index(),
                None => return Err(LogError::NoSegments(term)),
            },
        };

        // Contiguous segments must exist from start to highest.
        {
            let tail: Vec<&Arc<Segment>> = segments.range(start_index..).map(|(_, s)| s).collect();
            for pair in tail.windows(2) {
                let seg = pair[0];
                if seg.start_index() >= highest_index {
                    break;
                }
                let file_len = fs::metadata(seg.path())?.len();
                let seg_highest = seg.start_index() + file_len;
                if seg_highest < highest_index && seg_highest < pair[1].start_index() {
                    return Err(LogError::IncompleteSegment(seg.path().clone()));
                }
            }
        }

        // Shrink segments that overlap their successor, then shorten them
        // on disk.
        {
            let all: Vec<Arc<Segment>> = segments.values().cloned().collect();
            for pair in all.windows(2) {
                let (seg, next) = (&pair[0], &pair[1]);
                if seg.end_index() > next.start_index()
                    && seg.set_end_index(next.start_index())
                    && fs::metadata(seg.path())?.len() > seg.max_length()
                {
                    seg.truncate()?;
                }
            }
        }

        // Delete segments which are out of bounds.
        let out_of_bounds: Vec<u64> = segments
            .values()
            .filter(|seg| seg.end_index() <= start_index || seg.start_index() >= highest_index)
            .map(|seg| seg.start_index())
            .collect();
        for start in out_of_bounds {
            if let Some(seg) = segments.remove(&start) {
                debug!(term, start_index = start, "removing out-of-bounds segment");
                let _ = fs::remove_file(seg.path());
            }
        }

        Ok(Arc::new_cyclic(|weak_self| TermLog {
            weak_self: weak_self.clone(),
            worker,
            base,
            prev_term,
            term,
            start_index,
            tag: next_tag(),
            segment_cache: Mutex::new(LCache::new(config.max_cached_segments)),
            writer_cache: Mutex::new(LCache::new(config.max_cached_writers)),
            reader_cache: Mutex::new(LCache::new(config.max_cached_readers)),
            config,
            state: RwLock::new(LogState {
                commit_index,
                highest_index,
                contig_index: highest_index,
                end_index: u64::MAX,
                closed: false,
                segments,
                non_contig: BinaryHeap::new(),
                commit_tasks: BinaryHeap::new(),
            }),
            dirty: Mutex::new(VecDeque::new()),
            sync_lock: RwLock::new(()),
        }))
    }

    #[inline]
    pub fn prev_term(&self) -> u64 {
        self.prev_term
    }

    #[inline]
    pub fn term(&self) -> u64 {
        self.term
    }

    #[inline]
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn end_index(&self) -> u64 {
        self.state.read().end_index
    }

    /// Snapshots the term, highest index and actual commit index.
    pub fn capture_highest(&self, info: &mut LogInfo) {
        info.term = self.term;
        let state = self.state.read();
        info.highest_index = state.highest_index;
        info.commit_index = state.actual_commit();
    }

    /// Permits the commit watermark to advance. Regressions are ignored;
    /// the new watermark is clamped to the end of the term.
    pub fn commit(&self, commit_index: u64) {
        let mut state = self.state.write();
        if commit_index > state.commit_index {
            state.commit_index = commit_index.min(state.end_index);
            let actual = state.actual_commit();
            self.notify_commit_tasks(state, actual);
        }
    }

    /// Blocks until the actual commit index reaches `index`, the term ends
    /// below it, the timeout elapses, or the log closes. `None` waits
    /// without bound.
    pub fn wait_for_commit(&self, index: u64, timeout: Option<Duration>) -> WaitOutcome {
        self.wait_for_commit_tagged(index, timeout, self.tag)
    }

    pub(crate) fn wait_for_commit_tagged(
        &self,
        index: u64,
        timeout: Option<Duration>,
        tag: u64,
    ) -> WaitOutcome {
        let waiter = {
            {
                let state = self.state.read();
                if let Some(outcome) = wait_fast_path(&state, index) {
                    return outcome;
                }
            }
            let mut state = self.state.write();
            if let Some(outcome) = wait_fast_path(&state, index) {
                return outcome;
            }
            let waiter = local_waiter(self.tag);
            waiter.tag.store(tag, Ordering::Release);
            waiter.actual.store(0, Ordering::Release);
            state.commit_tasks.push(CommitEntry {
                counter: index,
                observer: CommitObserver::Waiter(waiter.clone()),
            });
            waiter
        };

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now < deadline {
                        thread::park_timeout(deadline - now);
                    }
                }
                None => thread::park(),
            }

            let actual = waiter.actual.load(Ordering::Acquire);
            if actual == CLOSED_SIGNAL {
                return WaitOutcome::Closed;
            }
            if actual == TERM_END_SIGNAL {
                return WaitOutcome::TermEnd;
            }
            if actual > 0 && actual as u64 >= index {
                return WaitOutcome::Committed(actual as u64);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return WaitOutcome::TimedOut;
                }
            }
        }
    }

    /// Wakes any parked commit waiter owned by `tag` with the closed
    /// sentinel. Called when a writer or reader closes.
    pub(crate) fn signal_closed(&self, tag: u64) {
        let state = self.state.read();
        for entry in state.commit_tasks.iter() {
            if let CommitObserver::Waiter(waiter) = &entry.observer {
                if waiter.tag.load(Ordering::Acquire) == tag {
                    waiter.signal(CLOSED_SIGNAL);
                }
            }
        }
    }

    /// Runs `task` once the actual commit index reaches `threshold`.
    ///
    /// The task receives the commit index, or [`TERM_END_SIGNAL`] when the
    /// term ends below the threshold, or [`CLOSED_SIGNAL`] when the log
    /// closes first. Runs inline when the threshold is already resolved.
    pub fn upon_commit<F>(&self, threshold: u64, task: F)
    where
        F: FnOnce(i64) + Send + 'static,
    {
        {
            let state = self.state.read();
            match upon_commit_now(&state, threshold) {
                Some(value) => {
                    drop(state);
                    task(value);
                    return;
                }
                None => {}
            }
        }

        let mut state = self.state.write();
        if let Some(value) = upon_commit_now(&state, threshold) {
            drop(state);
            task(value);
            return;
        }
        state.commit_tasks.push(CommitEntry {
            counter: threshold,
            observer: CommitObserver::Task(Box::new(task)),
        });
    }

    /// Fixes the end of the term, clamping the watermarks down, shrinking
    /// out-of-range segments and failing waiters past the boundary.
    ///
    /// Idempotent for an equal end index; a lower end than the actual
    /// commit or a raise of an already finished term is rejected.
    pub fn finish_term(&self, end_index: u64) -> LogResult<()> {
        let mut state = self.state.write();

        let commit = state.actual_commit();
        if end_index < commit && commit > self.start_index {
            return Err(LogError::illegal_term_boundary(format!(
                "cannot finish term below commit index: {end_index} < {commit}"
            )));
        }
        if end_index == state.end_index {
            return Ok(());
        }
        if end_index > state.end_index {
            return Err(LogError::illegal_term_boundary(format!(
                "term is already finished: {} > {}",
                end_index, state.end_index
            )));
        }

        debug!(term = self.term, end_index, "finishing term");

        let closed = state.closed;
        for segment in state.segments.values() {
            if segment.set_end_index(end_index) && !closed {
                self.schedule_truncate(segment.clone());
            }
        }

        state.end_index = end_index;
        if end_index < state.contig_index {
            state.contig_index = end_index;
        }
        if end_index < state.highest_index {
            state.highest_index = end_index;
        }

        if !state.non_contig.is_empty() {
            let retained: Vec<NonContigWriter> = state
                .non_contig
                .drain()
                .filter(|writer| writer.0.start_index() < end_index)
                .collect();
            state.non_contig.extend(retained);
        }

        let retained: Vec<CommitEntry> = state
            .commit_tasks
            .drain()
            .filter_map(|entry| {
                if entry.counter > end_index {
                    entry.observer.run(TERM_END_SIGNAL);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        state.commit_tasks.extend(retained);

        Ok(())
    }

    /// Reports the gaps preventing the contiguous index from advancing.
    ///
    /// `contig_index` is the caller's snapshot from the previous call (or
    /// zero). Ranges are only reported when no progress was made since;
    /// the current contiguous index is returned for re-arming.
    pub fn check_for_missing_data(
        &self,
        contig_index: u64,
        results: &mut dyn FnMut(u64, u64),
    ) -> u64 {
        let state = self.state.read();

        if contig_index < self.start_index || state.contig_index == contig_index {
            let expected_index = if state.end_index == u64::MAX {
                state.commit_index
            } else {
                state.end_index
            };

            let mut missing_start = state.contig_index;

            if !state.non_contig.is_empty() {
                let mut writers: Vec<&Arc<SegmentWriter>> =
                    state.non_contig.iter().map(|w| &w.0).collect();
                writers.sort_by_key(|writer| writer.start_index());

                for writer in writers {
                    let missing_end = writer.start_index();
                    if missing_start != missing_end {
                        results(missing_start, missing_end);
                    }
                    missing_start = writer.index();
                }
            }

            if expected_index > missing_start {
                results(missing_start, expected_index);
            }
        }

        state.contig_index
    }

    /// Returns a new or recycled writer positioned at `start_index`.
    /// Never blocks.
    pub fn open_writer(&self, start_index: u64) -> LogResult<Arc<SegmentWriter>> {
        if let Some(writer) = self.writer_cache.lock().remove(start_index) {
            return Ok(writer);
        }

        let prev_term = if start_index == self.start_index {
            self.prev_term
        } else {
            self.term
        };
        let writer = Arc::new(SegmentWriter::new(
            self.weak_self.clone(),
            self.term,
            prev_term,
            start_index,
        ));

        let mut state = self.state.write();
        if start_index > state.contig_index && start_index < state.end_index {
            state.non_contig.push(NonContigWriter(writer.clone()));
        }
        drop(state);

        Ok(writer)
    }

    /// Returns a new or recycled reader positioned at `start_index`.
    /// Never blocks.
    pub fn open_reader(&self, start_index: u64) -> LogResult<Arc<SegmentReader>> {
        if let Some(reader) = self.reader_cache.lock().remove(start_index) {
            return Ok(reader);
        }

        let prev_term = if start_index <= self.start_index {
            self.prev_term
        } else {
            self.term
        };
        Ok(Arc::new(SegmentReader::new(
            self.weak_self.clone(),
            self.term,
            prev_term,
            start_index,
        )))
    }

    /// Flushes every segment dirtied before this call, in FIFO order.
    ///
    /// Concurrent syncs coalesce on the sync latch. A failed segment is
    /// re-marked dirty for the next pass; the first error is reported
    /// after the pass completes.
    pub fn sync(&self) -> LogResult<()> {
        let _sync = self.sync_lock.write();

        let (mut segment, last) = {
            let mut dirty = self.dirty.lock();
            match dirty.pop_front() {
                None => return Ok(()),
                Some(segment) => {
                    let last = dirty.back().cloned().unwrap_or_else(|| segment.clone());
                    (segment, last)
                }
            }
        };

        let mut first_err = None;

        loop {
            if let Err(err) = self.sync_segment(&segment) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            if Arc::ptr_eq(&segment, &last) {
                break;
            }
            segment = match self.dirty.lock().pop_front() {
                Some(segment) => segment,
                None => break,
            };
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Closes the log: joins pending background work, closes every
    /// segment, and fires all pending commit waiters with the closed
    /// sentinel.
    pub fn close(&self) -> LogResult<()> {
        let _sync = self.sync_lock.read();
        let mut state = self.state.write();

        // Pending truncate tasks must complete first; no new tasks can be
        // scheduled while the exclusive latch is held.
        self.worker.join(false);
        state.closed = true;

        for segment in state.segments.values() {
            segment.close(true);
        }

        let tasks = std::mem::take(&mut state.commit_tasks);
        for entry in tasks {
            entry.observer.run(CLOSED_SIGNAL);
        }

        Ok(())
    }

    // --- internal: segment management -----------------------------------

    fn segment_path(&self, start_index: u64) -> PathBuf {
        let mut name = self.base.clone().into_os_string();
        name.push(format!(".{}.{}", self.term, start_index));
        PathBuf::from(name)
    }

    fn index_check(&self, index: u64) -> LogResult<()> {
        if index < self.start_index {
            return Err(LogError::InvalidIndex {
                index,
                start_index: self.start_index,
            });
        }
        Ok(())
    }

    /// Finds or creates the segment holding `index`, pinned for writing.
    /// Returns `None` at or past the end of the term.
    pub(crate) fn segment_for_writing(&self, index: u64) -> LogResult<Option<Arc<Segment>>> {
        self.index_check(index)?;

        let mut state = self.state.write();

        if index >= state.end_index {
            return Ok(None);
        }

        if let Some(segment) = state.floor_segment(index).cloned() {
            if index < segment.end_index() {
                self.segment_cache.lock().remove(segment.start_index());
                segment.pin();
                return Ok(Some(segment));
            }
        }

        if state.closed {
            return Err(LogError::Closed);
        }

        let mut max_length = self.config.segment_length(state.segments.len());
        let mut start_index = index;
        if let Some(floor) = state.floor_segment(index) {
            let floor_end = floor.end_index();
            start_index = floor_end + ((index - floor_end) / max_length) * max_length;
        }

        // Do not encroach on the next segment or pass the end of the term.
        let bound = state
            .higher_segment(index)
            .map(|next| next.start_index())
            .unwrap_or(state.end_index);
        max_length = max_length.min(bound - start_index);

        let segment = Arc::new(Segment::new(
            start_index,
            max_length,
            self.segment_path(start_index),
        ));
        state.segments.insert(start_index, segment.clone());
        Ok(Some(segment))
    }

    /// Finds the segment holding `index`, pinned for reading, or `None`
    /// if no segment covers it.
    pub(crate) fn segment_for_reading(&self, index: u64) -> LogResult<Option<Arc<Segment>>> {
        self.index_check(index)?;

        let state = self.state.write();
        if let Some(segment) = state.floor_segment(index) {
            if index < segment.end_index() {
                segment.pin();
                return Ok(Some(segment.clone()));
            }
        }
        Ok(None)
    }

    /// Snapshot of the contiguous index and end index for readers.
    pub(crate) fn contig_and_end(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.contig_index, state.end_index)
    }

    pub(crate) fn add_to_dirty_list(&self, segment: Arc<Segment>) {
        self.dirty.lock().push_back(segment);
    }

    /// Drops a counted segment reference. An idle segment parks in the
    /// segment LRU; the background worker unmaps it and closes whatever
    /// the LRU evicted.
    pub(crate) fn unreferenced(&self, segment: Arc<Segment>) {
        if !segment.unpin() {
            return;
        }

        let to_close = self.segment_cache.lock().add(segment.clone());
        self.worker.enqueue(move || {
            segment.unmap_if_idle();
            if let Some(to_close) = to_close {
                to_close.close_or_unmap();
            }
        });
    }

    fn schedule_truncate(&self, segment: Arc<Segment>) {
        let log = self.weak_self.upgrade();
        self.worker.enqueue(move || {
            segment.pin();
            if let Err(err) = segment.truncate() {
                error!(
                    start_index = segment.start_index(),
                    error = %err,
                    "background truncate failed"
                );
            }
            if segment.unpin() {
                let to_close = log
                    .as_ref()
                    .and_then(|log| log.segment_cache.lock().add(segment.clone()));
                segment.unmap_if_idle();
                if let Some(to_close) = to_close {
                    to_close.close_or_unmap();
                }
            }
        });
    }

    fn sync_segment(&self, segment: &Arc<Segment>) -> LogResult<()> {
        if !segment.begin_sync() {
            return Ok(());
        }
        segment.pin();
        let result = segment.fsync();
        if let Err(ref err) = result {
            warn!(
                start_index = segment.start_index(),
                error = %err,
                "segment sync failed; re-marked dirty"
            );
            if segment.mark_dirty() {
                self.add_to_dirty_list(segment.clone());
            }
        }
        self.unreferenced(segment.clone());
        result
    }

    // --- internal: cursor management ------------------------------------

    /// Returns a released writer to its LRU; the evicted victim, if any,
    /// gives up its pinned segment.
    pub(crate) fn release_writer(&self, writer: Arc<SegmentWriter>) {
        if let Some(evicted) = self.writer_cache.lock().add(writer) {
            if let Some(segment) = evicted.take_segment() {
                self.unreferenced(segment);
            }
        }
    }

    pub(crate) fn release_reader(&self, reader: Arc<SegmentReader>) {
        if let Some(evicted) = self.reader_cache.lock().add(reader) {
            if let Some(segment) = evicted.take_segment() {
                self.unreferenced(segment);
            }
        }
    }

    /// Reports writer progress: clamps to the term end, advances the
    /// contiguous index, absorbs any non-contiguous writers that joined
    /// the contiguous region, applies the asserted highest index, and
    /// wakes commit waiters when the watermark moved.
    pub(crate) fn write_finished(
        &self,
        writer: &SegmentWriter,
        mut current_index: u64,
        mut highest_index: u64,
    ) {
        let mut state = self.state.write();

        let commit_index = state.commit_index;
        if highest_index < commit_index {
            let allowed = commit_index.min(state.contig_index);
            if highest_index < allowed {
                highest_index = allowed;
            }
        }

        let end_index = state.end_index;
        if current_index > end_index {
            current_index = end_index;
        }
        if highest_index > end_index {
            highest_index = end_index;
        }

        writer.set_index(current_index);
        if current_index > writer.start_index() {
            writer.set_prev_term(self.term);
        }
        if highest_index > writer.highest_index() {
            writer.set_highest_index(highest_index);
        }

        let mut contig_index = state.contig_index;
        if writer.start_index() <= contig_index {
            // The writer sits on the contiguous region; grow it.
            if current_index > contig_index {
                contig_index = current_index;

                while let Some(next) = state.non_contig.peek() {
                    if next.0.start_index() > contig_index {
                        break;
                    }
                    let next = match state.non_contig.pop() {
                        Some(next) => next.0,
                        None => break,
                    };
                    if next.index() > contig_index {
                        contig_index = next.index();
                    }
                    let next_highest = next.highest_index();
                    if next_highest > highest_index && highest_index <= contig_index {
                        highest_index = next_highest;
                    }
                }

                state.contig_index = contig_index;
            }

            let apply = if end_index < u64::MAX {
                // The term has ended, which is always at a valid highest
                // index; the contiguous index itself can serve as highest.
                highest_index = contig_index;
                true
            } else {
                highest_index > state.highest_index && highest_index <= contig_index
            };

            if apply {
                state.highest_index = highest_index;
                writer.capture(state.highest_index, state.actual_commit());
                let actual = state.actual_commit();
                self.notify_commit_tasks(state, actual);
                return;
            }
        }

        writer.capture(state.highest_index, state.actual_commit());
    }

    /// Pops and runs commit tasks whose threshold is at or below the
    /// commit index. The exclusive latch transfers in and is released
    /// while each task runs.
    fn notify_commit_tasks<'a>(&'a self, mut state: RwLockWriteGuard<'a, LogState>, mut commit: u64) {
        loop {
            let ready = state
                .commit_tasks
                .peek()
                .map_or(false, |entry| entry.counter <= commit);
            if !ready {
                return;
            }
            let entry = match state.commit_tasks.pop() {
                Some(entry) => entry,
                None => return,
            };
            let drained = state.commit_tasks.is_empty();
            drop(state);
            entry.observer.run(commit as i64);
            if drained {
                return;
            }
            // Callbacks may have moved the watermark (readers unblocking
            // and re-waiting); re-read before the next pop.
            state = self.state.write();
            commit = state.actual_commit();
        }
    }
}

fn wait_fast_path(state: &LogState, index: u64) -> Option<WaitOutcome> {
    let commit = state.actual_commit();
    if commit >= index {
        return Some(WaitOutcome::Committed(commit));
    }
    if index > state.end_index {
        return Some(WaitOutcome::TermEnd);
    }
    if state.closed {
        return Some(WaitOutcome::Closed);
    }
    None
}

fn upon_commit_now(state: &LogState, threshold: u64) -> Option<i64> {
    let commit = state.actual_commit();
    if commit >= threshold {
        return Some(commit as i64);
    }
    if state.closed {
        return Some(CLOSED_SIGNAL);
    }
    if threshold > state.end_index {
        return Some(TERM_END_SIGNAL);
    }
    None
}

fn check_base(base: &Path) -> LogResult<PathBuf> {
    if base.is_dir() {
        return Err(LogError::invalid_config(format!(
            "base file is a directory: {}",
            base.display()
        )));
    }
    match base.parent() {
        Some(parent) if parent.as_os_str().is_empty() || parent.exists() => {}
        _ => {
            return Err(LogError::invalid_config(format!(
                "parent directory doesn't exist: {}",
                base.display()
            )))
        }
    }
    Ok(base.to_path_buf())
}

fn discover_segment_files(base: &Path, term: u64) -> LogResult<Vec<String>> {
    let parent = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let base_name = match base.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => {
            return Err(LogError::invalid_config(format!(
                "base file has no name: {}",
                base.display()
            )))
        }
    };

    let prefix = format!("{base_name}.{term}.");
    let mut names = Vec::new();
    for entry in fs::read_dir(&parent)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(suffix) = name.strip_prefix(&prefix) {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                names.push(name);
            }
        }
    }
    Ok(names)
}

fn parse_start_index(name: &str) -> LogResult<u64> {
    let suffix = name.rsplit('.').next().unwrap_or_default();
    suffix.parse::<u64>().map_err(|_| {
        LogError::invalid_config(format!("segment file name has no start index: {name}"))
    })
}
