use std::sync::Arc;
use std::time::Duration;

use crate::error::LogResult;
use crate::reader::SegmentReader;
use crate::writer::SegmentWriter;

/// Snapshot of a log's watermarks for one term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogInfo {
    pub term: u64,
    /// Highest index known valid over a contiguous range.
    pub highest_index: u64,
    /// Actual commit index: `min(commit, highest)`.
    pub commit_index: u64,
}

/// Contract between the per-term logs and the layer that stitches terms
/// together into the full replicated log.
///
/// Implementations compose one [`crate::TermLog`] per term and route each
/// operation to the term covering the requested index.
pub trait StateLog {
    /// Copies the highest term's watermarks over a contiguous range into
    /// `info`.
    fn capture_highest(&self, info: &mut LogInfo);

    /// Permits the commit index to advance. If the highest contiguous
    /// index is below the given commit index, the actual commit index
    /// advances only as the highest index catches up.
    fn commit(&self, commit_index: u64);

    /// Ensures that a term is defined at the given index.
    ///
    /// Returns false when `prev_term` does not match the term recorded
    /// immediately before `index` (pass 0 to skip the check).
    fn define_term(&self, prev_term: u64, term: u64, index: u64) -> LogResult<bool>;

    /// Reports every term defined over `[start_index, end_index)` as
    /// `(prev_term, term, start_index)` triples.
    fn query_terms(&self, start_index: u64, end_index: u64, results: &mut dyn FnMut(u64, u64, u64));

    /// Reports missing ranges over the contiguous prefix. Pass the value
    /// returned by the previous invocation (or 0); ranges are reported
    /// only while the contiguous range is not advancing.
    fn check_for_missing_data(&self, contig_index: u64, results: &mut dyn FnMut(u64, u64)) -> u64;

    /// Returns a writer for the given index, or `None` when the
    /// `prev_term` assertion fails.
    fn open_writer(
        &self,
        prev_term: u64,
        term: u64,
        index: u64,
    ) -> LogResult<Option<Arc<SegmentWriter>>>;

    /// Returns a reader positioned at the given index, waiting up to
    /// `timeout` for a term to cover it. `None` on timeout.
    fn open_reader(&self, index: u64, timeout: Option<Duration>)
        -> LogResult<Option<Arc<SegmentReader>>>;

    /// Durably persists all data up to the highest index.
    fn sync(&self) -> LogResult<()>;
}
