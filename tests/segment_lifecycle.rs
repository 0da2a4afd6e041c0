//! Exercises the segment recorder with its real scan thread against a
//! scratch directory standing in for the splitmux ring.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nvrd::segment::{SegmentRecorder, WorkerState};

fn recorder(dir: &Path) -> Arc<SegmentRecorder> {
    Arc::new(SegmentRecorder::new(
        dir.to_path_buf(),
        "mkv",
        Duration::from_millis(25),
        65,
    ))
}

fn write_segment(dir: &Path, name: &str, body: &[u8]) {
    fs::write(dir.join(name), body).unwrap();
}

fn saved_count(dir: &Path) -> usize {
    fs::read_dir(dir.join("saved")).map(|d| d.count()).unwrap_or(0)
}

#[test]
fn motion_retains_segments_in_capture_order() {
    let tmp = tempfile::tempdir().unwrap();
    let rec = recorder(tmp.path());
    let handle = rec.start().unwrap();
    assert_eq!(rec.get_state(), WorkerState::Working);

    // The muxer opens the first ring file; let the scanner see it.
    write_segment(tmp.path(), "segment-000.mkv", b"segment-zero");
    thread::sleep(Duration::from_millis(120));

    // Motion while segment-000 is being written; the rollover to -001
    // must retain the closed file.
    rec.save_current_segment();
    write_segment(tmp.path(), "segment-001.mkv", b"segment-one");
    thread::sleep(Duration::from_millis(150));
    assert_eq!(saved_count(tmp.path()), 1);

    // Retained copies are named by wall-clock second; keep the second
    // rollover out of the first one's timestamp bucket.
    thread::sleep(Duration::from_millis(1100));
    rec.save_current_segment();
    write_segment(tmp.path(), "segment-002.mkv", b"segment-two");
    thread::sleep(Duration::from_millis(150));

    // Monotone growth between drains: everything retained earlier is
    // still there when more arrives.
    assert_eq!(saved_count(tmp.path()), 2);

    let drained = rec.drain_motion_segments();
    assert_eq!(drained.len(), 2);
    // Capture order is preserved in the retained list.
    assert_eq!(fs::read(&drained[0]).unwrap(), b"segment-zero");
    assert_eq!(fs::read(&drained[1]).unwrap(), b"segment-one");

    // The drain emptied the list in the same critical section.
    assert!(rec.drain_motion_segments().is_empty());

    rec.stop(handle);
    assert_eq!(rec.get_state(), WorkerState::Stopped);
}

#[test]
fn finalisation_handshake_completes_after_motion_falls() {
    let tmp = tempfile::tempdir().unwrap();
    let rec = recorder(tmp.path());
    let handle = rec.start().unwrap();

    write_segment(tmp.path(), "segment-000.mkv", b"burst");
    thread::sleep(Duration::from_millis(120));

    // Motion latched the current segment, then fell.
    rec.save_current_segment();
    rec.set_state(WorkerState::FinishRequested);

    // Next rollover retains the closed segment and reports finalized.
    write_segment(tmp.path(), "segment-001.mkv", b"tail");
    let deadline = Instant::now() + Duration::from_secs(2);
    while rec.get_state() != WorkerState::Finalized && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(rec.get_state(), WorkerState::Finalized);

    // The consumer drains and hands the recorder back to work.
    let segments = rec.drain_motion_segments();
    assert_eq!(segments.len(), 1);
    assert!(segments.iter().all(|p| p.exists()));
    rec.set_state(WorkerState::Working);
    assert_eq!(rec.get_state(), WorkerState::Working);

    rec.stop(handle);
}

#[test]
fn motion_recovery_returns_to_working_without_a_clip() {
    let tmp = tempfile::tempdir().unwrap();
    let rec = recorder(tmp.path());
    let handle = rec.start().unwrap();

    write_segment(tmp.path(), "segment-000.mkv", b"a");
    thread::sleep(Duration::from_millis(120));

    // Fall edge, but motion returns before any rollover happens.
    rec.set_state(WorkerState::FinishRequested);
    rec.set_state(WorkerState::Working);
    thread::sleep(Duration::from_millis(150));

    assert_eq!(rec.get_state(), WorkerState::Working);
    assert!(rec.drain_motion_segments().is_empty());

    rec.stop(handle);
}
