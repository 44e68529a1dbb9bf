use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use termlog::{LogConfig, LogError, LogInfo, TermLog, WaitOutcome, Worker};

const SEGMENT_BASE: u64 = 4096;

fn test_config() -> LogConfig {
    LogConfig {
        segment_base_bytes: SEGMENT_BASE,
        ..LogConfig::default()
    }
}

fn new_log(dir: &TempDir) -> Arc<TermLog> {
    let worker = Arc::new(Worker::new(Duration::from_millis(200)));
    TermLog::create(worker, &dir.path().join("log"), 0, 1, 0, 0, test_config())
        .expect("create term")
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
fn linear_writer_round_trip() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let writer = log.open_writer(0).expect("writer");
    assert_eq!(writer.write(b"aaaa", 0).expect("write"), 4);
    assert_eq!(writer.write(b"bbbb", 8).expect("write"), 4);

    let mut info = LogInfo::default();
    log.capture_highest(&mut info);
    assert_eq!(info.term, 1);
    assert_eq!(info.highest_index, 8);
    assert_eq!(info.commit_index, 0);

    log.commit(8);
    log.capture_highest(&mut info);
    assert_eq!(info.commit_index, 8);

    assert_eq!(read_exact(&log, 0, 8), b"aaaabbbb");

    // A second reader has consumed everything committed.
    let reader = log.open_reader(8).expect("reader");
    let mut buf = [0u8; 4];
    assert_eq!(reader.read_any(&mut buf).expect("read_any"), Some(0));
}

#[test]
fn out_of_order_writers_merge() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let w1 = log.open_writer(0).expect("w1");
    let w2 = log.open_writer(4).expect("w2");

    assert_eq!(w2.write(b"yyyy", 0).expect("write"), 4);

    let mut info = LogInfo::default();
    log.capture_highest(&mut info);
    assert_eq!(info.highest_index, 0);

    let mut ranges = Vec::new();
    let token = log.check_for_missing_data(0, &mut |s, e| ranges.push((s, e)));
    assert_eq!(ranges, vec![(0, 4)]);
    assert_eq!(token, 0);

    assert_eq!(w1.write(b"xxxx", 8).expect("write"), 4);
    log.capture_highest(&mut info);
    assert_eq!(info.highest_index, 8);

    // The gap closed; no ranges remain.
    let mut ranges = Vec::new();
    let token = log.check_for_missing_data(token, &mut |s, e| ranges.push((s, e)));
    assert_eq!(token, 8);
    assert!(ranges.is_empty());

    log.commit(8);
    assert_eq!(read_exact(&log, 0, 8), b"xxxxyyyy");
}

#[test]
fn finish_term_below_pending_writer() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let writer = log.open_writer(100).expect("writer");

    let waiter = {
        let writer = writer.clone();
        thread::spawn(move || writer.wait_for_commit(150, None))
    };
    thread::sleep(Duration::from_millis(50));

    log.finish_term(50).expect("finish");

    assert_eq!(waiter.join().expect("join"), WaitOutcome::TermEnd);

    // The dropped writer can no longer append.
    assert_eq!(writer.write(b"zz", 0).expect("write"), 0);

    // Only the plain tail gap remains; the writer is gone from the queue.
    let mut ranges = Vec::new();
    log.check_for_missing_data(0, &mut |s, e| ranges.push((s, e)));
    assert_eq!(ranges, vec![(0, 50)]);
}

#[test]
fn write_spans_segment_boundary() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let total = SEGMENT_BASE as usize + SEGMENT_BASE as usize / 2;
    let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

    let writer = log.open_writer(0).expect("writer");
    assert_eq!(writer.write(&data, total as u64).expect("write"), total);
    log.commit(total as u64);

    // Two files: [0, base) and [base, 3*base).
    assert!(dir.path().join("log.1.0").exists());
    assert!(dir.path().join(format!("log.1.{SEGMENT_BASE}")).exists());

    let start = SEGMENT_BASE - 16;
    let spanning = read_exact(&log, start, 32);
    assert_eq!(spanning, &data[start as usize..start as usize + 32]);
}

#[test]
fn close_wakes_blocked_waiter() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);
    log.commit(50);

    let waiter = {
        let log = log.clone();
        thread::spawn(move || log.wait_for_commit(100, None))
    };
    thread::sleep(Duration::from_millis(50));

    log.close().expect("close");

    assert_eq!(waiter.join().expect("join"), WaitOutcome::Closed);
}

#[test]
fn closed_reader_wakes_with_error() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let reader = log.open_reader(0).expect("reader");
    let blocked = {
        let reader = reader.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf)
        })
    };
    thread::sleep(Duration::from_millis(50));

    reader.close();

    assert!(matches!(blocked.join().expect("join"), Err(LogError::Closed)));
}

#[test]
fn wait_for_commit_times_out() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let outcome = log.wait_for_commit(10, Some(Duration::from_millis(20)));
    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[test]
fn released_writer_resumes_at_its_index() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let writer = log.open_writer(0).expect("writer");
    writer.write(b"abcdefgh", 8).expect("write");
    let before = Arc::as_ptr(&writer);
    writer.release();

    // Reopening at the released cursor's position resumes it.
    let resumed = log.open_writer(8).expect("writer");
    assert_eq!(Arc::as_ptr(&resumed), before);
    assert_eq!(resumed.index(), 8);
    resumed.write(b"ij", 10).expect("write");

    log.commit(10);
    assert_eq!(read_exact(&log, 0, 10), b"abcdefghij");
}

#[test]
fn read_any_trails_contig_and_ends_with_term() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let writer = log.open_writer(0).expect("writer");
    writer.write(b"uncommitted", 11).expect("write");

    // read_any sees contiguous data before any commit.
    let reader = log.open_reader(0).expect("reader");
    let mut buf = [0u8; 16];
    assert_eq!(reader.read_any(&mut buf).expect("read_any"), Some(11));
    assert_eq!(&buf[..11], b"uncommitted");

    assert_eq!(reader.read_any(&mut buf).expect("read_any"), Some(0));

    log.finish_term(11).expect("finish");
    assert_eq!(reader.read_any(&mut buf).expect("read_any"), None);
}

#[test]
fn writer_sees_captured_watermarks() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let writer = log.open_writer(0).expect("writer");
    writer.write(b"abcd", 4).expect("write");
    log.commit(4);
    writer.write(b"efgh", 8).expect("write");

    let captured = writer.captured();
    assert_eq!(captured.highest_index, 8);
    assert_eq!(captured.commit_index, 4);
    assert_eq!(writer.prev_term(), 1);
}

#[test]
fn concurrent_writer_and_reader_stream() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    const CHUNK: usize = 997;
    const CHUNKS: usize = 64;
    let payload: Vec<u8> = (0..CHUNK * CHUNKS).map(|i| (i % 239) as u8).collect();

    let producer = {
        let log = log.clone();
        let payload = payload.clone();
        thread::spawn(move || {
            let writer = log.open_writer(0).expect("writer");
            let mut written = 0usize;
            for chunk in payload.chunks(CHUNK) {
                written += chunk.len();
                assert_eq!(
                    writer.write(chunk, written as u64).expect("write"),
                    chunk.len()
                );
                log.commit(written as u64);
            }
        })
    };

    let consumed = read_exact(&log, 0, CHUNK * CHUNKS);
    producer.join().expect("producer");
    assert_eq!(consumed, payload);
}

#[test]
fn sync_makes_bytes_durable() {
    let dir = TempDir::new().expect("tempdir");
    let log = new_log(&dir);

    let writer = log.open_writer(0).expect("writer");
    writer.write(b"durable-bytes", 13).expect("write");
    log.sync().expect("sync");
    // A second sync has nothing left to flush.
    log.sync().expect("sync again");

    let on_disk = std::fs::read(dir.path().join("log.1.0")).expect("segment file");
    assert_eq!(&on_disk[..13], b"durable-bytes");
}
