use std::fmt::Display;
use std::path::PathBuf;

/// A specialized error type for term log operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The term log, or a writer or reader handle, was already closed.
    #[error("closed")]
    Closed,
    /// The requested index precedes the start of the term.
    #[error("index is too low: {index} < {start_index}")]
    InvalidIndex { index: u64, start_index: u64 },
    /// `finish_term` was called with an end index the term cannot accept.
    #[error("illegal term boundary: {0}")]
    IllegalTermBoundary(String),
    /// Recovery found a gap between segment files below the highest index.
    #[error("incomplete segment: {}", .0.display())]
    IncompleteSegment(PathBuf),
    /// Recovery found no segment covering the configured start index.
    #[error("missing start segment: {start_index}, term={term}")]
    MissingSegment { start_index: u64, term: u64 },
    /// Start index discovery was requested but no segment files exist.
    #[error("no segment files exist for term: {0}")]
    NoSegments(u64),
    /// A blocked thread was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// Configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LogError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a term boundary error from a displayable value.
    pub fn illegal_term_boundary<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::IllegalTermBoundary(msg.to_string())
    }
}

/// A Result type alias for term log operations.
pub type LogResult<T> = Result<T, LogError>;
