use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LogError, LogResult};

/// Default number of idle segments retained in the segment LRU.
const DEFAULT_MAX_CACHED_SEGMENTS: usize = 10;

/// Default number of released writers retained for reuse.
const DEFAULT_MAX_CACHED_WRITERS: usize = 10;

/// Default number of released readers retained for reuse.
const DEFAULT_MAX_CACHED_READERS: usize = 10;

/// Default base size for the first segment of a term (1 MiB).
///
/// Segment sizes ramp up as the set grows: `base << n` for the n-th
/// segment, bounded by [`DEFAULT_SEGMENT_GROWTH_CAP`]. A small first
/// segment keeps short-lived terms cheap; the ramp keeps file counts
/// bounded for long terms.
const DEFAULT_SEGMENT_BASE_BYTES: u64 = 1024 * 1024;

/// Default cap on the segment size ramp, as a shift applied to the base.
///
/// With the 1 MiB base this yields the progression 1, 2, 4, 8, 16, 32,
/// 64 MiB, after which segment size stays flat.
const DEFAULT_SEGMENT_GROWTH_CAP: u32 = 6;

/// Default idle time before the background worker thread exits.
const DEFAULT_WORKER_KEEP_ALIVE_MS: u64 = 10_000;

/// Tuning knobs for a term log instance.
///
/// All fields have defaults that match the production configuration; tests
/// shrink the segment base to keep fixtures small. Validation is performed
/// once when a term log is created or opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Capacity of the idle-segment LRU.
    pub max_cached_segments: usize,
    /// Capacity of the released-writer LRU.
    pub max_cached_writers: usize,
    /// Capacity of the released-reader LRU.
    pub max_cached_readers: usize,
    /// Size of the first segment; subsequent segments double up to the cap.
    pub segment_base_bytes: u64,
    /// Maximum left shift applied to `segment_base_bytes` by the ramp.
    pub segment_growth_cap: u32,
    /// Idle time before the shared worker thread exits.
    pub worker_keep_alive: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_cached_segments: DEFAULT_MAX_CACHED_SEGMENTS,
            max_cached_writers: DEFAULT_MAX_CACHED_WRITERS,
            max_cached_readers: DEFAULT_MAX_CACHED_READERS,
            segment_base_bytes: DEFAULT_SEGMENT_BASE_BYTES,
            segment_growth_cap: DEFAULT_SEGMENT_GROWTH_CAP,
            worker_keep_alive: Duration::from_millis(DEFAULT_WORKER_KEEP_ALIVE_MS),
        }
    }
}

impl LogConfig {
    /// Checks the configuration for values the log cannot operate with.
    pub fn validate(&self) -> LogResult<()> {
        if self.segment_base_bytes == 0 {
            return Err(LogError::invalid_config("segment_base_bytes must be non-zero"));
        }
        if self.segment_growth_cap >= 32 {
            return Err(LogError::invalid_config(
                "segment_growth_cap must leave the ramp below 2^63",
            ));
        }
        if self.segment_base_bytes > (u64::MAX >> self.segment_growth_cap) {
            return Err(LogError::invalid_config(
                "segment ramp overflows: lower segment_base_bytes or segment_growth_cap",
            ));
        }
        if self.max_cached_segments == 0 {
            return Err(LogError::invalid_config("max_cached_segments must be non-zero"));
        }
        if self.max_cached_writers == 0 || self.max_cached_readers == 0 {
            return Err(LogError::invalid_config("cursor cache capacities must be non-zero"));
        }
        Ok(())
    }

    /// Segment size for a term that already holds `segment_count` segments.
    pub(crate) fn segment_length(&self, segment_count: usize) -> u64 {
        let shift = (segment_count as u32).min(self.segment_growth_cap);
        self.segment_base_bytes << shift
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        LogConfig::default().validate().expect("default config");
    }

    #[test]
    fn ramp_doubles_then_caps() {
        let config = LogConfig::default();
        assert_eq!(config.segment_length(0), 1024 * 1024);
        assert_eq!(config.segment_length(1), 2 * 1024 * 1024);
        assert_eq!(config.segment_length(6), 64 * 1024 * 1024);
        assert_eq!(config.segment_length(100), 64 * 1024 * 1024);
    }

    #[test]
    fn rejects_zero_base() {
        let config = LogConfig {
            segment_base_bytes: 0,
            ..LogConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_overflowing_ramp() {
        let config = LogConfig {
            segment_base_bytes: u64::MAX / 2,
            segment_growth_cap: 6,
            ..LogConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
