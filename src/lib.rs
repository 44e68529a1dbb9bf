//! Segmented, file-backed append-only log for a single replication term.
//!
//! A term log durably stores one contiguous range of log bytes belonging
//! to a single election term and tracks three monotonic watermarks over
//! it: the *contiguous* index (no gap below it), the *highest* index
//! (valid prefix asserted by writers), and the *commit* index (durable
//! across replicas, reported as `min(commit, highest)`).
//!
//! ## Architecture
//!
//! - [`TermLog`] owns the watermarks, an ordered set of segment files,
//!   a priority queue of out-of-order writers, and a priority queue of
//!   commit waiters.
//! - Segments are variable-sized files named `<base>.<term>.<start>`,
//!   memory-mapped on first write and reference counted; idle segments
//!   park in a small LRU and are unmapped and closed in the background.
//! - [`SegmentWriter`]s append at arbitrary start indexes and may arrive
//!   out of order; the log resolves them into a contiguous prefix.
//! - [`SegmentReader`]s trail the commit watermark with blocking reads,
//!   or the contiguous watermark with non-blocking reads.
//! - A shared [`Worker`] thread runs close/unmap/truncate tasks, keeping
//!   file-system ordering on any one segment deterministic.
//!
//! ## Thread safety
//!
//! All public types are safe for concurrent use. Multiple writer and
//! reader threads may operate simultaneously; index state is guarded by
//! one read-write latch per term log, and blocked commit waits park on a
//! per-thread waiter so the serving hot path does not allocate.

pub mod config;
pub mod error;
pub mod state_log;
pub mod worker;

mod cache;
mod reader;
mod segment;
mod term_log;
mod writer;

pub use config::LogConfig;
pub use error::{LogError, LogResult};
pub use reader::SegmentReader;
pub use state_log::{LogInfo, StateLog};
pub use term_log::{TermLog, WaitOutcome, CLOSED_SIGNAL, TERM_END_SIGNAL};
pub use worker::Worker;
pub use writer::SegmentWriter;
