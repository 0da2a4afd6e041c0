//! Segment recorder: watches one camera's rolling segment directory and
//! retains motion-flagged segments.
//!
//! The splitmux ring in `tmp/` is written by the ingest graph; this worker
//! only observes it. Every `scan_interval` it looks for the newest segment
//! file. When the newest name changes, the previously newest file has just
//! been closed by the muxer; if a save was latched while it was being
//! written, that file is copied into `tmp/saved/` under an ISO-local
//! timestamp before the ring can recycle it.
//!
//! State machine (one capture session):
//!
//! ```text
//! Working -> FinishRequested -> Finalized -> Working
//! ```
//!
//! `Stopped` only on shutdown. The analyser requests `FinishRequested` on
//! the falling edge of motion and may push back to `Working` if motion
//! recovers before the next rollover; `Finalized` is held until the
//! retained list is drained.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info, warn};

use crate::error::{NvrError, NvrResult};
use crate::paths::ensure_dir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Stopped = 0,
    Working = 1,
    FinishRequested = 2,
    Finalized = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> WorkerState {
        match v {
            1 => WorkerState::Working,
            2 => WorkerState::FinishRequested,
            3 => WorkerState::Finalized,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Default)]
struct SaveLatch {
    save_requested: bool,
    retained: Vec<PathBuf>,
}

pub struct SegmentRecorder {
    segment_dir: PathBuf,
    saved_dir: PathBuf,
    ext: String,
    scan_interval: Duration,
    max_retained: usize,
    running: AtomicBool,
    state: AtomicU8,
    latch: Mutex<SaveLatch>,
}

impl SegmentRecorder {
    pub fn new(
        segment_dir: PathBuf,
        ext: &str,
        scan_interval: Duration,
        max_retained: usize,
    ) -> SegmentRecorder {
        let saved_dir = segment_dir.join("saved");
        SegmentRecorder {
            segment_dir,
            saved_dir,
            ext: ext.to_string(),
            scan_interval,
            max_retained,
            running: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Stopped as u8),
            latch: Mutex::new(SaveLatch::default()),
        }
    }

    /// Start the scan thread. The returned handle is joined by [`stop`].
    pub fn start(self: &Arc<Self>) -> NvrResult<thread::JoinHandle<()>> {
        ensure_dir(&self.saved_dir)?;
        self.running.store(true, Ordering::SeqCst);
        self.set_state(WorkerState::Working);

        let recorder = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("segment-scan".into())
            .spawn(move || recorder.scan_loop())
            .map_err(|e| NvrError::io("spawn segment scanner", e))?;
        info!("[segment] scanner started for {}", self.segment_dir.display());
        Ok(handle)
    }

    pub fn stop(&self, handle: thread::JoinHandle<()>) {
        self.running.store(false, Ordering::SeqCst);
        let _ = handle.join();
        self.set_state(WorkerState::Stopped);
        info!("[segment] scanner stopped for {}", self.segment_dir.display());
    }

    /// One-shot latch: the next rollover persists the just-closed segment.
    /// Idempotent; the analyser calls this on every motion tick.
    pub fn save_current_segment(&self) {
        let mut latch = self.latch.lock().expect("segment latch poisoned");
        latch.save_requested = true;
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn get_state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Return the retained paths and empty the list in one critical
    /// section, so a segment can never appear in two exports.
    pub fn drain_motion_segments(&self) -> Vec<PathBuf> {
        let mut latch = self.latch.lock().expect("segment latch poisoned");
        std::mem::take(&mut latch.retained)
    }

    fn scan_loop(&self) {
        let mut last_seen: Option<String> = None;
        while self.running.load(Ordering::SeqCst) {
            self.scan_tick(&mut last_seen);
            thread::sleep(self.scan_interval);
        }
    }

    fn scan_tick(&self, last_seen: &mut Option<String>) {
        let newest = match self.newest_segment() {
            Ok(newest) => newest,
            Err(e) => {
                warn!("[segment] scan error in {}: {e}", self.segment_dir.display());
                return;
            }
        };

        let Some(newest) = newest else { return };
        if last_seen.as_deref() == Some(newest.as_str()) {
            return;
        }

        // The previously newest file has just been closed by the muxer.
        let save_requested = {
            let latch = self.latch.lock().expect("segment latch poisoned");
            latch.save_requested
        };
        if save_requested {
            if let Some(closed) = last_seen.as_deref() {
                self.retain_closed(closed);
            }
        }
        *last_seen = Some(newest);
    }

    /// Copy a just-closed segment into `saved/` and account for it. Only
    /// files older than the current newest are ever touched here, so the
    /// muxer's active file is never raced.
    fn retain_closed(&self, closed: &str) {
        let src = self.segment_dir.join(closed);
        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let dst = self.saved_dir.join(format!("{stamp}.{}", self.ext));

        match fs::copy(&src, &dst) {
            Ok(_) => {
                debug!("[segment] retained {} as {}", src.display(), dst.display());
                let mut latch = self.latch.lock().expect("segment latch poisoned");
                latch.retained.push(dst);
                latch.save_requested = false;
                if self.get_state() == WorkerState::FinishRequested {
                    debug!("[segment] finish requested; reporting finalized");
                    self.set_state(WorkerState::Finalized);
                }
                // Safety cap: an endless motion burst must not grow the
                // retained set without bound.
                if latch.retained.len() >= self.max_retained {
                    warn!(
                        "[segment] retained {} segments, forcing finalize",
                        latch.retained.len()
                    );
                    self.set_state(WorkerState::Finalized);
                }
            }
            Err(e) => {
                error!("[segment] failed to copy {}: {e}", src.display());
                let mut latch = self.latch.lock().expect("segment latch poisoned");
                latch.save_requested = false;
            }
        }
    }

    fn newest_segment(&self) -> NvrResult<Option<String>> {
        let suffix = format!(".{}", self.ext);
        let mut newest: Option<(std::time::SystemTime, String)> = None;

        let entries = fs::read_dir(&self.segment_dir)
            .map_err(|e| NvrError::io(format!("read {}", self.segment_dir.display()), e))?;
        for entry in entries.flatten() {
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(&suffix) {
                continue;
            }
            let mtime = meta.modified().map_err(|e| NvrError::io("segment mtime", e))?;
            if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
                newest = Some((mtime, name));
            }
        }
        Ok(newest.map(|(_, name)| name))
    }
}
