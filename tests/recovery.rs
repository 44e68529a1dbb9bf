use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use termlog::{LogConfig, LogError, TermLog, Worker};

const SEGMENT_BASE: u64 = 4096;

fn test_config() -> LogConfig {
    LogConfig {
        segment_base_bytes: SEGMENT_BASE,
        ..LogConfig::default()
    }
}

fn worker() -> Arc<Worker> {
    Arc::new(Worker::new(Duration::from_millis(200)))
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 247) as u8).collect()
}

/// Writes `data` at index 0 of a fresh term, syncs it and closes the log.
fn seed_term(dir: &TempDir, data: &[u8]) {
    let log = TermLog::create(worker(), &dir.path().join("log"), 0, 1, 0, 0, test_config())
        .expect("create term");
    let writer = log.open_writer(0).expect("writer");
    assert_eq!(
        writer.write(data, data.len() as u64).expect("write"),
        data.len()
    );
    writer.release();
    log.sync().expect("sync");
    log.close().expect("close");
}

fn read_exact(log: &Arc<TermLog>, start: u64, len: usize) -> Vec<u8> {
    let reader = log.open_reader(start).expect("reader");
    let mut out = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let amount = reader.read(&mut out[filled..]).expect("read");
        assert!(amount > 0, "unexpected end of term at {}", filled);
        filled += amount;
    }
    out
}

#[test]
fn reopen_round_trips_synced_bytes() {
    let dir = TempDir::new().expect("tempdir");
    let total = SEGMENT_BASE as usize + 1904;
    let data = pattern(total);
    seed_term(&dir, &data);

    let log = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        Some(0),
        total as u64,
        total as u64,
        None,
        test_config(),
    )
    .expect("reopen");

    assert_eq!(log.start_index(), 0);
    assert_eq!(read_exact(&log, 0, total), data);
    log.close().expect("close");
}

#[test]
fn reopen_discovers_start_index() {
    let dir = TempDir::new().expect("tempdir");
    let data = pattern(600);
    seed_term(&dir, &data);

    let log = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        None,
        0,
        600,
        None,
        test_config(),
    )
    .expect("reopen");
    assert_eq!(log.start_index(), 0);
    log.close().expect("close");
}

#[test]
fn reopen_without_segments_fails_discovery() {
    let dir = TempDir::new().expect("tempdir");
    let err = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        None,
        0,
        0,
        None,
        test_config(),
    );
    assert!(matches!(err, Err(LogError::NoSegments(1))));
}

#[test]
fn missing_start_segment_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let err = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        Some(0),
        0,
        1500,
        None,
        test_config(),
    );
    assert!(matches!(err, Err(LogError::MissingSegment { .. })));
}

#[test]
fn gap_between_segments_is_incomplete() {
    let dir = TempDir::new().expect("tempdir");
    // Three segments: [0, 4096), [4096, 12288), [12288, ...).
    let total = 16000;
    let data = pattern(total);
    seed_term(&dir, &data);

    let middle = dir.path().join(format!("log.1.{SEGMENT_BASE}"));
    assert!(middle.exists());
    fs::remove_file(&middle).expect("drop middle segment");

    let err = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        Some(0),
        0,
        total as u64,
        None,
        test_config(),
    );
    assert!(matches!(err, Err(LogError::IncompleteSegment(_))));
}

#[test]
fn higher_recovered_highest_reads_up_to_files() {
    let dir = TempDir::new().expect("tempdir");
    let total = SEGMENT_BASE as usize + 1904;
    let data = pattern(total);
    seed_term(&dir, &data);

    // Reopening with a lower highest bound still works; bytes beyond it
    // are not served.
    let log = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        Some(0),
        1000,
        1500,
        None,
        test_config(),
    )
    .expect("reopen");
    assert_eq!(read_exact(&log, 0, 1000), &data[..1000]);
    log.close().expect("close");
}

#[test]
fn out_of_bounds_segments_are_deleted_on_open() {
    let dir = TempDir::new().expect("tempdir");
    let total = SEGMENT_BASE as usize + 1904;
    let data = pattern(total);
    seed_term(&dir, &data);

    // Recover with highest inside the first segment; the second segment
    // is entirely out of bounds and gets deleted.
    let log = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        Some(0),
        0,
        100,
        None,
        test_config(),
    )
    .expect("reopen");

    assert!(dir.path().join("log.1.0").exists());
    assert!(!dir.path().join(format!("log.1.{SEGMENT_BASE}")).exists());
    log.close().expect("close");
}

#[test]
fn finished_term_truncates_files() {
    let dir = TempDir::new().expect("tempdir");
    let log = TermLog::create(worker(), &dir.path().join("log"), 0, 1, 0, 0, test_config())
        .expect("create term");

    let writer = log.open_writer(0).expect("writer");
    let data = pattern(2000);
    writer.write(&data, 2000).expect("write");
    log.commit(1000);

    log.finish_term(1000).expect("finish");
    log.close().expect("close");

    let len = fs::metadata(dir.path().join("log.1.0")).expect("meta").len();
    assert_eq!(len, 1000);
}

#[test]
fn new_writes_after_reopen_extend_the_log() {
    let dir = TempDir::new().expect("tempdir");
    let data = pattern(500);
    seed_term(&dir, &data);

    let log = TermLog::open(
        worker(),
        &dir.path().join("log"),
        0,
        1,
        Some(0),
        500,
        500,
        None,
        test_config(),
    )
    .expect("reopen");

    let writer = log.open_writer(500).expect("writer");
    assert_eq!(writer.write(b"appended", 508).expect("write"), 8);
    log.commit(508);

    let mut expected = data.clone();
    expected.extend_from_slice(b"appended");
    assert_eq!(read_exact(&log, 0, 508), expected);
    log.close().expect("close");
}
