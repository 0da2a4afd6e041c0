//! Motion analyser: sparse optical flow over decoded frames.
//!
//! One worker thread per camera pulls BGR frames from the ingest graph's
//! appsink, estimates motion with Shi-Tomasi corners + pyramidal
//! Lucas-Kanade flow, filters samples through the camera's motion regions,
//! and drives the segment recorder's state machine. The most recent
//! annotated frame is kept for the HTTP `/motion_frame` endpoint.
//!
//! The flow math and the hit/decay/hold state machine are split out as pure
//! functions so they can be tested without GStreamer or live frames.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use gstreamer as gst;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use opencv::core::{self, Mat, Point, Point2f, Scalar, Size, TermCriteria, TermCriteria_Type, Vector};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc, video};

use crate::camera::region::MotionRegion;
use crate::camera::MotionParams;
use crate::error::{NvrError, NvrResult};
use crate::export::{ExportHandle, ExportJob};
use crate::segment::{SegmentRecorder, WorkerState};

/// State shared between the motion worker, the ingest supervisor and the
/// HTTP layer. Lives as long as the camera does, across pipeline rebuilds.
pub struct MotionShared {
    pub regions: Mutex<Vec<MotionRegion>>,
    pub next_region_id: AtomicU32,
    pub last_frame: Mutex<Option<Mat>>,
    pub motion_detected: AtomicBool,
    pub worker_failed: AtomicBool,
}

impl MotionShared {
    pub fn new() -> MotionShared {
        MotionShared {
            regions: Mutex::new(Vec::new()),
            next_region_id: AtomicU32::new(1),
            last_frame: Mutex::new(None),
            motion_detected: AtomicBool::new(false),
            worker_failed: AtomicBool::new(false),
        }
    }
}

impl Default for MotionShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a worker incarnation needs, cloned out of the camera runtime.
pub struct MotionContext {
    pub camera: String,
    pub params: MotionParams,
    pub segment_enabled: bool,
    pub shared: Arc<MotionShared>,
    pub recorder: Option<Arc<SegmentRecorder>>,
    pub exporter: ExportHandle,
    pub clip_dir: PathBuf,
    pub container: String,
    /// Camera-level stop flag.
    pub running: Arc<AtomicBool>,
    /// Incarnation-level stop flag; flipped before a pipeline rebuild.
    pub alive: Arc<AtomicBool>,
}

pub fn spawn_motion_worker(
    appsink: gst_app::AppSink,
    ctx: MotionContext,
) -> NvrResult<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("motion-{}", ctx.camera))
        .spawn(move || motion_loop(appsink, ctx))
        .map_err(|e| NvrError::io("spawn motion worker", e))
}

/// Outcome of feeding one `avg_motion` observation into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionTick {
    pub detected: bool,
    pub rose: bool,
    pub fell: bool,
}

/// Hit counter with decay and a hold window.
///
/// `motion_detected` is true exactly while `now - last_motion_time` is
/// within the hold; a sample strictly above the threshold counts as a hit,
/// and `min_hits` hits arm the hold window.
#[derive(Debug, Default)]
pub struct MotionState {
    hits: u32,
    last_motion: Option<Instant>,
    prev_detected: bool,
}

impl MotionState {
    pub fn new() -> MotionState {
        MotionState::default()
    }

    pub fn observe(&mut self, avg_motion: f32, params: &MotionParams, now: Instant) -> MotionTick {
        if avg_motion > params.motion_threshold {
            self.hits += 1;
            if self.hits >= params.min_hits {
                self.last_motion = Some(now);
            }
        } else {
            self.hits = self.hits.saturating_sub(params.decay);
        }

        let detected = self
            .last_motion
            .map(|t| now.duration_since(t) <= params.hold)
            .unwrap_or(false);
        let tick = MotionTick {
            detected,
            rose: detected && !self.prev_detected,
            fell: !detected && self.prev_detected,
        };
        self.prev_detected = detected;
        tick
    }
}

/// One successfully tracked feature.
#[derive(Debug, Clone, Copy)]
pub struct FlowSample {
    pub prev: (f32, f32),
    pub curr: (f32, f32),
}

impl FlowSample {
    pub fn displacement(&self) -> f32 {
        let dx = self.curr.0 - self.prev.0;
        let dy = self.curr.1 - self.prev.1;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Apply the region filter and noise gate, returning the mean displacement
/// of the kept samples (0.0 when none survive) together with the samples
/// themselves for annotation.
pub fn average_motion(
    samples: &[FlowSample],
    regions: &[MotionRegion],
    noise_threshold: f32,
) -> (f32, Vec<FlowSample>) {
    let mut total = 0.0f32;
    let mut kept = Vec::new();
    for sample in samples {
        // With no regions configured the whole frame participates; the
        // filter tests the feature's previous location.
        let in_region = regions.is_empty()
            || regions.iter().any(|r| r.contains(sample.prev.0, sample.prev.1));
        if !in_region {
            continue;
        }
        let d = sample.displacement();
        if d <= noise_threshold {
            continue;
        }
        total += d;
        kept.push(*sample);
    }
    if kept.is_empty() {
        (0.0, kept)
    } else {
        (total / kept.len() as f32, kept)
    }
}

enum FrameError {
    /// Pixel format the analyser does not handle; skip and keep going.
    Unsupported(String),
    /// Truncated buffer, mapping failure, allocation failure.
    Bad(String),
}

fn motion_loop(appsink: gst_app::AppSink, ctx: MotionContext) {
    debug!(
        "[motion] {} worker up (scale {}, segment {})",
        ctx.camera, ctx.params.frame_scale, ctx.segment_enabled
    );

    let mut prev_gray: Option<Mat> = None;
    let mut state = MotionState::new();
    let mut consecutive_failures = 0u32;

    while ctx.running.load(Ordering::SeqCst) && ctx.alive.load(Ordering::SeqCst) {
        let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_mseconds(100)) else {
            thread::sleep(Duration::from_millis(5));
            continue;
        };

        let frame = match sample_to_bgr(&sample) {
            Ok(frame) => frame,
            Err(FrameError::Unsupported(format)) => {
                warn!("[motion] {}: unsupported pixel format {format}", ctx.camera);
                continue;
            }
            Err(FrameError::Bad(msg)) => {
                consecutive_failures += 1;
                warn!("[motion] {}: bad frame ({msg})", ctx.camera);
                if consecutive_failures >= 3 {
                    ctx.shared.worker_failed.store(true, Ordering::SeqCst);
                    break;
                }
                continue;
            }
        };

        match analyze_frame(&ctx, frame, &mut prev_gray, &mut state) {
            Ok(()) => consecutive_failures = 0,
            Err(e) => {
                consecutive_failures += 1;
                warn!("[motion] {}: analysis error: {e}", ctx.camera);
                if consecutive_failures >= 3 {
                    ctx.shared.worker_failed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    }
    debug!("[motion] {} worker exiting", ctx.camera);
}

fn analyze_frame(
    ctx: &MotionContext,
    frame: Mat,
    prev_gray: &mut Option<Mat>,
    state: &mut MotionState,
) -> opencv::Result<()> {
    let prepared = prepare_frame(&frame, &ctx.params)?;
    let mut gray = Mat::default();
    imgproc::cvt_color_def(&prepared, &mut gray, imgproc::COLOR_BGR2GRAY)?;

    // The very first frame only seeds the previous-gray buffer.
    if let Some(prev) = prev_gray.as_ref() {
        let samples = track_features(prev, &gray)?;
        let regions = ctx.shared.regions.lock().expect("regions poisoned").clone();
        let (avg_motion, kept) = average_motion(&samples, &regions, ctx.params.noise_threshold);

        let vis = annotate(&prepared, &regions, &kept, avg_motion, &ctx.params)?;
        *ctx.shared.last_frame.lock().expect("last frame poisoned") = Some(vis);

        let tick = state.observe(avg_motion, &ctx.params, Instant::now());
        ctx.shared.motion_detected.store(tick.detected, Ordering::SeqCst);
        if tick.rose {
            info!("[motion] {}: started (avg {avg_motion:.2})", ctx.camera);
        }
        if tick.fell {
            info!("[motion] {}: stopped", ctx.camera);
        }

        if ctx.segment_enabled {
            if let Some(recorder) = ctx.recorder.as_ref() {
                drive_recorder(ctx, recorder, tick);
            }
        }
    }

    *prev_gray = Some(gray);
    Ok(())
}

/// Resize to the explicit motion-frame size, then apply the scale factor,
/// per the camera's configuration.
fn prepare_frame(frame: &Mat, params: &MotionParams) -> opencv::Result<Mat> {
    let mut out = frame.try_clone()?;
    let (w, h) = params.frame_size;
    if w > 0 && h > 0 {
        let mut resized = Mat::default();
        imgproc::resize(
            &out,
            &mut resized,
            Size::new(w as i32, h as i32),
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;
        out = resized;
    }
    if params.frame_scale > 0.0 && params.frame_scale != 1.0 {
        let mut scaled = Mat::default();
        imgproc::resize(
            &out,
            &mut scaled,
            Size::new(0, 0),
            params.frame_scale as f64,
            params.frame_scale as f64,
            imgproc::INTER_LINEAR,
        )?;
        out = scaled;
    }
    Ok(out)
}

/// Corners on the previous grey frame, tracked into the current one.
fn track_features(prev_gray: &Mat, gray: &Mat) -> opencv::Result<Vec<FlowSample>> {
    let mut prev_pts = Vector::<Point2f>::new();
    imgproc::good_features_to_track(
        prev_gray,
        &mut prev_pts,
        100,
        0.01,
        10.0,
        &core::no_array(),
        3,
        false,
        0.04,
    )?;
    if prev_pts.is_empty() {
        return Ok(Vec::new());
    }

    let mut next_pts = Vector::<Point2f>::new();
    let mut status = Vector::<u8>::new();
    let mut err = Vector::<f32>::new();
    video::calc_optical_flow_pyr_lk(
        prev_gray,
        gray,
        &prev_pts,
        &mut next_pts,
        &mut status,
        &mut err,
        Size::new(21, 21),
        3,
        TermCriteria::new(
            TermCriteria_Type::COUNT as i32 + TermCriteria_Type::EPS as i32,
            30,
            0.01,
        )?,
        0,
        1e-4,
    )?;

    let samples = prev_pts
        .iter()
        .zip(next_pts.iter())
        .zip(status.iter())
        .filter(|(_, ok)| *ok != 0)
        .map(|((prev, curr), _)| FlowSample {
            prev: (prev.x, prev.y),
            curr: (curr.x, curr.y),
        })
        .collect();
    Ok(samples)
}

/// Region outlines in blue, kept-feature arrows in green, the motion
/// average as text. This is the only frame the HTTP surface ever exposes.
fn annotate(
    prepared: &Mat,
    regions: &[MotionRegion],
    kept: &[FlowSample],
    avg_motion: f32,
    params: &MotionParams,
) -> opencv::Result<Mat> {
    let blue = Scalar::new(255.0, 0.0, 0.0, 0.0);
    let green = Scalar::new(0.0, 255.0, 0.0, 0.0);
    let red = Scalar::new(0.0, 0.0, 255.0, 0.0);

    let mut vis = prepared.try_clone()?;
    for region in regions {
        let corners = region.corners();
        for i in 0..4 {
            let (ax, ay) = corners[i];
            let (bx, by) = corners[(i + 1) % 4];
            imgproc::line(
                &mut vis,
                Point::new(ax.round() as i32, ay.round() as i32),
                Point::new(bx.round() as i32, by.round() as i32),
                blue,
                2,
                imgproc::LINE_8,
                0,
            )?;
        }
        imgproc::put_text(
            &mut vis,
            &format!("Region {}", region.id),
            Point::new(region.rect.x, region.rect.y - 10),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            blue,
            1,
            imgproc::LINE_8,
            false,
        )?;
    }

    for sample in kept {
        let (px, py) = sample.prev;
        let end_x = px + params.arrow_scale * (sample.curr.0 - px);
        let end_y = py + params.arrow_scale * (sample.curr.1 - py);
        imgproc::arrowed_line(
            &mut vis,
            Point::new(px.round() as i32, py.round() as i32),
            Point::new(end_x.round() as i32, end_y.round() as i32),
            green,
            params.arrow_thickness.max(1),
            imgproc::LINE_8,
            0,
            0.1,
        )?;
    }

    imgproc::put_text(
        &mut vis,
        &format!("Motion: {avg_motion:.2}"),
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        1.0,
        red,
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(vis)
}

fn drive_recorder(ctx: &MotionContext, recorder: &Arc<SegmentRecorder>, tick: MotionTick) {
    if tick.detected {
        recorder.save_current_segment();
    }
    if tick.fell {
        recorder.set_state(WorkerState::FinishRequested);
    }
    // Motion recovered before the rollover completed: no clip yet.
    if recorder.get_state() == WorkerState::FinishRequested && tick.detected {
        debug!("[motion] {}: finish pending but motion recovered", ctx.camera);
        recorder.set_state(WorkerState::Working);
    }

    if recorder.get_state() == WorkerState::Finalized {
        let segments = recorder.drain_motion_segments();
        if segments.is_empty() {
            warn!("[motion] {}: finalized with no segments", ctx.camera);
        } else {
            let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
            let filename = format!("motion-{stamp}.{}", ctx.container);
            info!(
                "[motion] {}: exporting {} segments as {filename}",
                ctx.camera,
                segments.len()
            );
            ctx.exporter.submit(ExportJob {
                segments,
                output_dir: ctx.clip_dir.clone(),
                filename,
                container: ctx.container.clone(),
            });
        }
        recorder.set_state(WorkerState::Working);
    }
}

/// Encode an annotated frame as JPEG for the HTTP surface.
pub fn encode_jpeg(frame: &Mat) -> NvrResult<Vec<u8>> {
    let mut buf = Vector::<u8>::new();
    let ok = imgcodecs::imencode(".jpg", frame, &mut buf, &Vector::new())
        .map_err(|e| NvrError::Export(format!("jpeg encode: {e}")))?;
    if !ok {
        return Err(NvrError::Export("jpeg encode refused frame".into()));
    }
    Ok(buf.to_vec())
}

fn sample_to_bgr(sample: &gst::Sample) -> Result<Mat, FrameError> {
    let caps = sample.caps().ok_or_else(|| FrameError::Bad("sample without caps".into()))?;
    let structure = caps
        .structure(0)
        .ok_or_else(|| FrameError::Bad("caps without structure".into()))?;
    let width: i32 = structure
        .get("width")
        .map_err(|_| FrameError::Bad("caps missing width".into()))?;
    let height: i32 = structure
        .get("height")
        .map_err(|_| FrameError::Bad("caps missing height".into()))?;
    let format: &str = structure
        .get("format")
        .map_err(|_| FrameError::Bad("caps missing format".into()))?;
    if width <= 0 || height <= 0 {
        return Err(FrameError::Bad(format!("bad dimensions {width}x{height}")));
    }

    let buffer = sample
        .buffer()
        .ok_or_else(|| FrameError::Bad("sample without buffer".into()))?;
    let map = buffer
        .map_readable()
        .map_err(|_| FrameError::Bad("buffer map failed".into()))?;
    let data = map.as_slice();

    match format {
        "BGR" => packed_3ch(data, width, height).map_err(|e| FrameError::Bad(e.to_string())),
        "RGB" => {
            let rgb = packed_3ch(data, width, height).map_err(|e| FrameError::Bad(e.to_string()))?;
            let mut bgr = Mat::default();
            imgproc::cvt_color_def(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR)
                .map_err(|e| FrameError::Bad(e.to_string()))?;
            Ok(bgr)
        }
        "I420" => {
            let needed = (width * height * 3 / 2) as usize;
            if data.len() < needed {
                return Err(FrameError::Bad(format!(
                    "I420 buffer too small: {} < {needed}",
                    data.len()
                )));
            }
            let yuv = Mat::from_slice(&data[..needed])
                .and_then(|m| m.reshape(1, height + height / 2).and_then(|r| r.try_clone()))
                .map_err(|e| FrameError::Bad(e.to_string()))?;
            let mut bgr = Mat::default();
            imgproc::cvt_color_def(&yuv, &mut bgr, imgproc::COLOR_YUV2BGR_I420)
                .map_err(|e| FrameError::Bad(e.to_string()))?;
            Ok(bgr)
        }
        other => Err(FrameError::Unsupported(other.to_string())),
    }
}

/// Build an owned H x W x 3 Mat from a possibly row-padded buffer.
fn packed_3ch(data: &[u8], width: i32, height: i32) -> opencv::Result<Mat> {
    let row_bytes = width as usize * 3;
    let needed = row_bytes * height as usize;
    if data.len() == needed {
        return Mat::from_slice(data)?.reshape(3, height)?.try_clone();
    }
    if data.len() < needed {
        return Err(opencv::Error::new(core::StsError, "frame buffer too small".to_string()));
    }
    let stride = data.len() / height as usize;
    let mut packed = Vec::with_capacity(needed);
    for row in 0..height as usize {
        let start = row * stride;
        packed.extend_from_slice(&data[start..start + row_bytes]);
    }
    Mat::from_slice(&packed)?.reshape(3, height)?.try_clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::region::{MotionRegion, RegionRect};

    fn params(threshold: f32, min_hits: u32, decay: u32, hold_s: u64) -> MotionParams {
        MotionParams {
            frame_size: (0, 0),
            frame_scale: 1.0,
            noise_threshold: 1.0,
            motion_threshold: threshold,
            min_hits,
            decay,
            arrow_scale: 2.5,
            arrow_thickness: 1,
            hold: Duration::from_secs(hold_s),
        }
    }

    fn sample(prev: (f32, f32), disp: f32) -> FlowSample {
        FlowSample { prev, curr: (prev.0 + disp, prev.1) }
    }

    #[test]
    fn region_filter_keeps_only_inside_features() {
        let regions = vec![MotionRegion::new(1, RegionRect { x: 0, y: 0, w: 10, h: 10 }, 0.0)];
        let samples = [sample((5.0, 5.0), 10.0), sample((50.0, 50.0), 10.0)];
        let (avg, kept) = average_motion(&samples, &regions, 1.0);
        assert_eq!(kept.len(), 1);
        assert!((avg - 10.0).abs() < 1e-5);
    }

    #[test]
    fn no_regions_means_whole_frame() {
        let samples = [sample((5.0, 5.0), 4.0), sample((50.0, 50.0), 8.0)];
        let (avg, kept) = average_motion(&samples, &[], 1.0);
        assert_eq!(kept.len(), 2);
        assert!((avg - 6.0).abs() < 1e-5);
    }

    #[test]
    fn noise_gate_discards_small_displacements() {
        let samples = [sample((5.0, 5.0), 0.5), sample((6.0, 6.0), 1.0)];
        // displacement <= noise threshold is discarded; none survive.
        let (avg, kept) = average_motion(&samples, &[], 1.0);
        assert_eq!(avg, 0.0);
        assert!(kept.is_empty());
    }

    #[test]
    fn threshold_equality_is_not_a_hit() {
        let p = params(5.0, 1, 0, 3);
        let mut state = MotionState::new();
        let now = Instant::now();
        let tick = state.observe(5.0, &p, now);
        assert!(!tick.detected);
        let tick = state.observe(5.01, &p, now);
        assert!(tick.detected);
    }

    #[test]
    fn zero_min_hits_triggers_on_first_sample() {
        let p = params(5.0, 0, 1, 3);
        let mut state = MotionState::new();
        let tick = state.observe(8.0, &p, Instant::now());
        assert!(tick.detected && tick.rose);
    }

    #[test]
    fn alternating_samples_with_high_decay_never_detect() {
        let p = params(5.0, 2, 2, 3);
        let mut state = MotionState::new();
        let now = Instant::now();
        for i in 0..20 {
            let avg = if i % 2 == 0 { 9.0 } else { 0.0 };
            let tick = state.observe(avg, &p, now + Duration::from_millis(i * 40));
            assert!(!tick.detected, "sample {i} must not arm motion");
        }
    }

    #[test]
    fn hold_window_expires() {
        let p = params(5.0, 1, 1, 3);
        let mut state = MotionState::new();
        let t0 = Instant::now();
        assert!(state.observe(9.0, &p, t0).detected);
        // Within the hold window the state stays armed without new hits.
        assert!(state.observe(0.0, &p, t0 + Duration::from_secs(2)).detected);
        let tick = state.observe(0.0, &p, t0 + Duration::from_secs(4));
        assert!(!tick.detected && tick.fell);
    }

    #[test]
    fn rising_and_falling_edges_fire_once() {
        let p = params(5.0, 2, 1, 1);
        let mut state = MotionState::new();
        let t0 = Instant::now();
        assert!(!state.observe(9.0, &p, t0).rose);
        let tick = state.observe(9.0, &p, t0 + Duration::from_millis(40));
        assert!(tick.rose && tick.detected);
        let tick = state.observe(9.0, &p, t0 + Duration::from_millis(80));
        assert!(!tick.rose && tick.detected);
        let tick = state.observe(0.0, &p, t0 + Duration::from_secs(3));
        assert!(tick.fell && !tick.detected);
    }
}
