use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::cache::CacheEntry;
use crate::error::{LogError, LogResult};
use crate::segment::Segment;
use crate::term_log::{TermLog, WaitOutcome};

/// Read cursor over a term log, following behind a watermark.
///
/// `read` trails the commit watermark and blocks for it; `read_any`
/// trails the contiguous watermark and never blocks. Within a segment a
/// read always returns the full clipped amount; a short or empty read
/// only happens at a segment boundary, and the cursor reacquires the next
/// segment transparently. A released reader parks in the term's reader
/// LRU keyed by its current index.
pub struct SegmentReader {
    log: Weak<TermLog>,
    term: u64,
    tag: u64,
    prev_term: AtomicU64,
    index: AtomicU64,
    commit_index: AtomicU64,
    contig_index: AtomicU64,
    closed: AtomicBool,
    segment: Mutex<Option<Arc<Segment>>>,
}

impl CacheEntry for SegmentReader {
    fn cache_key(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }
}

impl SegmentReader {
    pub(crate) fn new(log: Weak<TermLog>, term: u64, prev_term: u64, index: u64) -> Self {
        Self {
            log,
            term,
            tag: crate::term_log::next_tag(),
            prev_term: AtomicU64::new(prev_term),
            index: AtomicU64::new(index),
            commit_index: AtomicU64::new(0),
            contig_index: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            segment: Mutex::new(None),
        }
    }

    /// Term at the index immediately before this reader's position when
    /// it first produced data.
    #[inline]
    pub fn prev_term(&self) -> u64 {
        self.prev_term.load(Ordering::Acquire)
    }

    #[inline]
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Current read position.
    #[inline]
    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    /// Reads committed bytes, blocking until at least one is available.
    ///
    /// Returns `Ok(0)` when the term ends at the current index. A closed
    /// reader or log reports [`LogError::Closed`].
    pub fn read(&self, buf: &mut [u8]) -> LogResult<usize> {
        let log = self.log.upgrade().ok_or(LogError::Closed)?;

        let index = self.index.load(Ordering::Acquire);
        let mut commit_index = self.commit_index.load(Ordering::Acquire);
        let mut avail = commit_index.saturating_sub(index);

        if avail == 0 {
            match log.wait_for_commit_tagged(index + 1, None, self.tag) {
                WaitOutcome::Committed(commit) => {
                    self.commit_index.store(commit, Ordering::Release);
                    commit_index = commit;
                    avail = commit_index - index;
                }
                WaitOutcome::Closed => return Err(LogError::Closed),
                WaitOutcome::TermEnd | WaitOutcome::TimedOut => {
                    if self.closed.load(Ordering::Acquire) {
                        return Err(LogError::Closed);
                    }
                    return Ok(0);
                }
            }
        }

        let length = buf.len().min(avail as usize);
        match self.read_segment(&log, index, &mut buf[..length])? {
            Some(amount) => Ok(amount),
            None => Ok(0),
        }
    }

    /// Reads whatever lies below the contiguous watermark, never waiting.
    ///
    /// Returns `Ok(Some(0))` when caught up and `Ok(None)` when the term
    /// has ended at the current index.
    pub fn read_any(&self, buf: &mut [u8]) -> LogResult<Option<usize>> {
        let log = self.log.upgrade().ok_or(LogError::Closed)?;

        let index = self.index.load(Ordering::Acquire);
        let mut contig_index = self.contig_index.load(Ordering::Acquire);
        let mut avail = contig_index.saturating_sub(index);

        if avail == 0 {
            let (contig, end_index) = log.contig_and_end();
            self.contig_index.store(contig, Ordering::Release);
            contig_index = contig;
            avail = contig_index.saturating_sub(index);

            if avail == 0 {
                return if contig_index == end_index {
                    Ok(None)
                } else {
                    Ok(Some(0))
                };
            }
        }

        let length = buf.len().min(avail as usize);
        self.read_segment(&log, index, &mut buf[..length])
    }

    /// Returns the reader to the term's reader LRU for reuse. The cursor
    /// must be reacquired through `open_reader`.
    pub fn release(self: Arc<Self>) {
        if let Some(log) = self.log.upgrade() {
            log.release_reader(self);
        }
    }

    /// Marks the reader closed, releases it, and wakes any blocked `read`
    /// with the closed sentinel.
    pub fn close(self: Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        let tag = self.tag;
        let log = self.log.upgrade();
        self.release();
        if let Some(log) = log {
            log.signal_closed(tag);
        }
    }

    pub(crate) fn take_segment(&self) -> Option<Arc<Segment>> {
        self.segment.lock().take()
    }

    /// Reads through the pinned segment, crossing to the next segment on
    /// a boundary. `None` means no segment covers the index (end of the
    /// term's data).
    fn read_segment(
        &self,
        log: &Arc<TermLog>,
        index: u64,
        buf: &mut [u8],
    ) -> LogResult<Option<usize>> {
        let segment = match self.segment.lock().clone() {
            Some(segment) => segment,
            None => {
                if buf.is_empty() {
                    // Avoid the prev-term side effect on an empty read.
                    return Ok(Some(0));
                }
                match self.segment_for_reading(log, index)? {
                    Some(segment) => {
                        *self.segment.lock() = Some(segment.clone());
                        self.prev_term.store(self.term, Ordering::Release);
                        segment
                    }
                    None => return Ok(None),
                }
            }
        };

        let mut amount = segment.read(index, buf)?;

        if amount == 0 {
            if buf.is_empty() {
                return Ok(Some(0));
            }
            let _ = self.segment.lock().take();
            log.unreferenced(segment);
            let segment = match self.segment_for_reading(log, index)? {
                Some(segment) => {
                    *self.segment.lock() = Some(segment.clone());
                    segment
                }
                None => return Ok(None),
            };
            amount = segment.read(index, buf)?;
        }

        self.index.store(index + amount as u64, Ordering::Release);
        Ok(Some(amount))
    }

    fn segment_for_reading(
        &self,
        log: &Arc<TermLog>,
        index: u64,
    ) -> LogResult<Option<Arc<Segment>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        log.segment_for_reading(index)
    }
}
