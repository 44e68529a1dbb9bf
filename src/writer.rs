use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cache::CacheEntry;
use crate::error::{LogError, LogResult};
use crate::segment::Segment;
use crate::state_log::LogInfo;
use crate::term_log::{next_tag, TermLog, WaitOutcome};

/// Append cursor over a term log.
///
/// The start index is fixed when the writer opens; `write` advances the
/// current index through as many segments as the data spans and then
/// reports progress to the term log, which resolves out-of-order writers
/// into the contiguous prefix. A released writer parks in the term's
/// writer LRU, keyed by its current index, so a follow-up
/// `open_writer` at that index resumes the same cursor with its segment
/// still pinned.
pub struct SegmentWriter {
    log: Weak<TermLog>,
    term: u64,
    start_index: u64,
    tag: u64,
    prev_term: AtomicU64,
    index: AtomicU64,
    highest_index: AtomicU64,
    captured_highest: AtomicU64,
    captured_commit: AtomicU64,
    closed: AtomicBool,
    segment: Mutex<Option<Arc<Segment>>>,
}

impl CacheEntry for SegmentWriter {
    fn cache_key(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }
}

impl SegmentWriter {
    pub(crate) fn new(log: Weak<TermLog>, term: u64, prev_term: u64, start_index: u64) -> Self {
        Self {
            log,
            term,
            start_index,
            tag: next_tag(),
            prev_term: AtomicU64::new(prev_term),
            index: AtomicU64::new(start_index),
            highest_index: AtomicU64::new(0),
            captured_highest: AtomicU64::new(0),
            captured_commit: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            segment: Mutex::new(None),
        }
    }

    /// Term at the index immediately before this writer's first write.
    #[inline]
    pub fn prev_term(&self) -> u64 {
        self.prev_term.load(Ordering::Acquire)
    }

    #[inline]
    pub fn term(&self) -> u64 {
        self.term
    }

    #[inline]
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    /// Current append position.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    /// Watermark snapshot captured by the most recent `write`.
    pub fn captured(&self) -> LogInfo {
        LogInfo {
            term: self.term,
            highest_index: self.captured_highest.load(Ordering::Acquire),
            commit_index: self.captured_commit.load(Ordering::Acquire),
        }
    }

    /// Appends `data` at the current index.
    ///
    /// `highest_index` is the caller's assertion that bytes up to it form
    /// a valid prefix through this write. Returns the amount written,
    /// which is less than `data.len()` (possibly zero) when the term
    /// ends inside the write range.
    pub fn write(&self, data: &[u8], highest_index: u64) -> LogResult<usize> {
        let log = self.log.upgrade().ok_or(LogError::Closed)?;

        let mut index = self.index.load(Ordering::Acquire);
        let mut segment = match self.segment.lock().take() {
            Some(segment) => segment,
            None => match self.segment_for_writing(&log, index)? {
                Some(segment) => segment,
                None => return Ok(0),
            },
        };

        let mut remaining = data;
        let mut total = 0usize;

        loop {
            *self.segment.lock() = Some(segment.clone());
            let (amt, newly_dirty) = segment.write(index, remaining)?;
            if newly_dirty {
                log.add_to_dirty_list(segment.clone());
            }
            index += amt as u64;
            total += amt;
            remaining = &remaining[amt..];
            if remaining.is_empty() {
                break;
            }
            let _ = self.segment.lock().take();
            log.unreferenced(segment);
            segment = match self.segment_for_writing(&log, index)? {
                Some(segment) => segment,
                None => break,
            };
        }

        log.write_finished(self, index, highest_index);

        Ok(total)
    }

    /// Blocks until the commit watermark reaches `index`. A closed writer
    /// reports [`WaitOutcome::Closed`].
    pub fn wait_for_commit(&self, index: u64, timeout: Option<Duration>) -> WaitOutcome {
        let log = match self.log.upgrade() {
            Some(log) => log,
            None => return WaitOutcome::Closed,
        };
        match log.wait_for_commit_tagged(index, timeout, self.tag) {
            outcome @ (WaitOutcome::TermEnd | WaitOutcome::TimedOut) => {
                if self.closed.load(Ordering::Acquire) {
                    WaitOutcome::Closed
                } else {
                    outcome
                }
            }
            outcome => outcome,
        }
    }

    /// Runs `task` once the commit watermark reaches `threshold`.
    pub fn upon_commit<F>(&self, threshold: u64, task: F)
    where
        F: FnOnce(i64) + Send + 'static,
    {
        if let Some(log) = self.log.upgrade() {
            log.upon_commit(threshold, task);
        } else {
            task(crate::term_log::CLOSED_SIGNAL);
        }
    }

    /// Returns the writer to the term's writer LRU for reuse. The cursor
    /// must be reacquired through `open_writer`.
    pub fn release(self: Arc<Self>) {
        if let Some(log) = self.log.upgrade() {
            log.release_writer(self);
        }
    }

    /// Marks the writer closed, releases it, and wakes any commit wait it
    /// owns with the closed sentinel.
    pub fn close(self: Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        let tag = self.tag;
        let log = self.log.upgrade();
        self.release();
        if let Some(log) = log {
            log.signal_closed(tag);
        }
    }

    fn segment_for_writing(
        &self,
        log: &Arc<TermLog>,
        index: u64,
    ) -> LogResult<Option<Arc<Segment>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        log.segment_for_writing(index)
    }

    pub(crate) fn take_segment(&self) -> Option<Arc<Segment>> {
        self.segment.lock().take()
    }

    pub(crate) fn set_index(&self, index: u64) {
        self.index.store(index, Ordering::Release);
    }

    pub(crate) fn set_prev_term(&self, term: u64) {
        self.prev_term.store(term, Ordering::Release);
    }

    pub(crate) fn highest_index(&self) -> u64 {
        self.highest_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_highest_index(&self, highest_index: u64) {
        self.highest_index.store(highest_index, Ordering::Release);
    }

    pub(crate) fn capture(&self, highest_index: u64, commit_index: u64) {
        self.captured_highest.store(highest_index, Ordering::Release);
        self.captured_commit.store(commit_index, Ordering::Release);
    }
}
