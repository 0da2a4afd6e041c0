//! Per-camera media graph: one upstream RTSP pull fanned into a decoded
//! motion sink and an encoded segment writer.
//!
//! The graph is described as a launch string in two shapes (audio-present /
//! audio-absent), decided by a bounded RTSP DESCRIBE probe whose result is
//! cached in the camera definition. Upstream transport is forced to TCP.
//!
//! ```text
//! rtspsrc (tcp, latency=150) -> depay -> h264parse -> tee name=vt
//!   vt -> decode -> convert/scale -> appsink "motion_sink"   (motion_frame)
//!   vt -> caps -> splitmuxsink (10 s ring of 3)              (segment)
//!   vt -> caps -> muxer -> filesink                          (recording)
//!   vt -> decode -> convert -> intervideosink                (re-encode proxy tap)
//!   audio -> depay -> aacparse -> caps -> splitmuxsink.audio_0
//! ```
//!
//! A supervisor thread owns the pipeline for the lifetime of the camera:
//! it watches the bus, and on an error or end-of-stream tears the graph
//! down and rebuilds it after 300/600/900 ms, then every 1.5 s, for as
//! long as the camera stays registered. Audio and video failures are not
//! separated; the whole graph restarts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;

use crate::camera::motion::{
    encode_jpeg, spawn_motion_worker, MotionContext, MotionShared,
};
use crate::camera::region::{MotionRegion, RegionRect};
use crate::camera::{AudioHint, CameraDefinition, ProxyKind};
use crate::error::{NvrError, NvrResult};
use crate::export::{spawn_export_worker, ExportHandle};
use crate::paths::camera_media_dir;
use crate::segment::SegmentRecorder;
use crate::settings::SettingsData;

static GST_INIT: OnceCell<()> = OnceCell::new();

/// Initialise GStreamer on first use; later calls are free.
pub fn ensure_gst() -> NvrResult<()> {
    GST_INIT
        .get_or_try_init(|| {
            gst::init().map_err(|e| NvrError::PipelineBuild(format!("gstreamer init: {e}")))
        })
        .map(|_| ())
}

/// Probe the upstream for an audio track with a bounded DESCRIBE.
///
/// A bare `rtspsrc` moved to PAUSED exposes its pads once the DESCRIBE
/// answer arrives; the pad caps carry the media type. On timeout whatever
/// was learned so far is returned with `probed` set, so the result is
/// cached either way and restarts skip the probe.
pub fn probe_rtsp_audio(uri: &str, timeout: Duration) -> NvrResult<AudioHint> {
    ensure_gst()?;

    let pipeline = gst::Pipeline::new();
    let src = gst::ElementFactory::make("rtspsrc")
        .name("probe-src")
        .build()
        .map_err(|e| NvrError::PipelineBuild(format!("rtspsrc: {e}")))?;
    src.set_property("location", uri);
    // Force TCP so the probe sees what the real pipeline will see.
    src.set_property_from_str("protocols", "tcp");
    pipeline
        .add(&src)
        .map_err(|e| NvrError::PipelineBuild(format!("probe pipeline: {e}")))?;

    let hint = Arc::new(Mutex::new(AudioHint::default()));
    let (tx, rx) = crossbeam_channel::bounded::<()>(2);

    {
        let hint = Arc::clone(&hint);
        let tx = tx.clone();
        src.connect_pad_added(move |_, pad| {
            let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
            let Some(s) = caps.structure(0) else { return };
            if s.get::<&str>("media").ok() != Some("audio") {
                return;
            }
            let mut h = hint.lock().expect("probe hint poisoned");
            h.has_audio = true;
            if let Ok(enc) = s.get::<&str>("encoding-name") {
                h.encoding = enc.to_string();
            }
            if let Ok(rate) = s.get::<i32>("clock-rate") {
                h.rate = rate;
            }
            if let Ok(channels) = s.get::<i32>("channels") {
                h.channels = channels;
            }
            let _ = tx.try_send(());
        });
    }
    src.connect_no_more_pads(move |_| {
        let _ = tx.try_send(());
    });

    let _ = pipeline.set_state(gst::State::Paused);
    let _ = rx.recv_timeout(timeout);
    let _ = pipeline.set_state(gst::State::Null);

    let mut result = hint.lock().expect("probe hint poisoned").clone();
    result.probed = true;
    Ok(result)
}

/// Assemble the launch description for a camera definition.
fn build_launch(def: &CameraDefinition, segment_dir: &Path, media_dir: &Path) -> String {
    let has_audio = def.audio.as_ref().map(|a| a.probed && a.has_audio).unwrap_or(false);
    // Motion-only graphs want freshness; graphs that also carry audio need
    // a deeper jitter buffer to play it smoothly.
    let latency_ms: u32 = if has_audio && def.segment { 300 } else { 150 };
    let mut p = String::new();

    if def.segment {
        p.push_str(&format!(
            "splitmuxsink name=smux muxer-factory={} location={}/segment-%03d.{} \
             max-size-time=10000000000 max-files=3 async-finalize=true ",
            def.muxer_factory(),
            segment_dir.display(),
            def.container_ext()
        ));
    }

    p.push_str(&format!(
        "rtspsrc location={} protocols=tcp latency={latency_ms} drop-on-latency=true \
         ntp-sync=true name=src ",
        def.uri
    ));

    if has_audio {
        p.push_str("src. ! queue ! rtph264depay ! h264parse config-interval=1 ! tee name=vt ");
    } else {
        // Pin the video pad explicitly; with no audio branch the source
        // must not hand us anything else.
        p.push_str(
            "src. ! application/x-rtp,media=video,encoding-name=H264 \
             ! queue ! rtph264depay ! h264parse config-interval=1 ! tee name=vt ",
        );
    }

    if def.motion_frame {
        p.push_str(
            "vt. ! queue ! avdec_h264 ! videoconvert ! videoscale \
             ! video/x-raw,format=BGR \
             ! appsink name=motion_sink emit-signals=false max-buffers=1 drop=true sync=false ",
        );
    }

    if def.segment {
        p.push_str("vt. ! queue ! video/x-h264,stream-format=avc,alignment=au ! smux.video ");
    }

    if def.recording {
        if let Some(file) = def.record_file.as_deref() {
            // Remux, no re-encode; the file name is confined to the
            // camera's media directory.
            let file = Path::new(file)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("record.{}", def.container_ext()));
            p.push_str(&format!(
                "vt. ! queue ! video/x-h264,stream-format=avc,alignment=au \
                 ! {} ! filesink location={}/{file} ",
                def.muxer_factory(),
                media_dir.display()
            ));
        }
    }

    if def.proxy_kind() == ProxyKind::Reencode {
        // Decoded tap feeding the proxy's intervideosrc channel.
        p.push_str(&format!(
            "vt. ! queue ! avdec_h264 ! videoconvert ! intervideosink channel={} ",
            def.sanitized_name()
        ));
    }

    if has_audio && def.segment {
        p.push_str(
            "src. ! queue ! rtpmp4gdepay ! aacparse \
             ! audio/mpeg,mpegversion=4,stream-format=raw,rate=48000,channels=2 \
             ! queue ! smux.audio_0 ",
        );
    }

    p.trim_end().to_string()
}

enum RunExit {
    Stopped,
    Failed(String),
}

struct SupervisorCtx {
    camera: String,
    def: CameraDefinition,
    launch: String,
    shared: Arc<MotionShared>,
    recorder: Option<Arc<SegmentRecorder>>,
    exporter: ExportHandle,
    clip_dir: PathBuf,
    running: Arc<AtomicBool>,
}

/// Camera runtime: the supervised pipeline plus its workers.
pub struct CameraStream {
    def: CameraDefinition,
    media_dir: PathBuf,
    segment_dir: PathBuf,
    scan_interval: Duration,
    max_retained: usize,
    shared: Arc<MotionShared>,
    exporter: ExportHandle,
    running: Arc<AtomicBool>,
    supervisor: Option<thread::JoinHandle<()>>,
    recorder: Option<(Arc<SegmentRecorder>, thread::JoinHandle<()>)>,
}

impl CameraStream {
    pub fn new(
        def: CameraDefinition,
        settings: &SettingsData,
        media_root: &Path,
    ) -> NvrResult<CameraStream> {
        let media_dir = camera_media_dir(media_root, &def.name)?;
        let segment_dir = media_dir.join("tmp");
        let exporter = spawn_export_worker(&def.name);
        Ok(CameraStream {
            def,
            media_dir,
            segment_dir,
            scan_interval: Duration::from_millis(settings.scan_interval_ms),
            max_retained: settings.max_retained_segments,
            shared: Arc::new(MotionShared::new()),
            exporter,
            running: Arc::new(AtomicBool::new(false)),
            supervisor: None,
            recorder: None,
        })
    }

    pub fn definition(&self) -> &CameraDefinition {
        &self.def
    }

    /// The client-facing mount path for this camera.
    pub fn mount_point(&self) -> String {
        format!("/{}", self.def.name)
    }

    pub fn is_running(&self) -> bool {
        self.supervisor.is_some()
    }

    /// Build the graph and spawn the supervisor. A parse failure is
    /// returned synchronously; runtime failures are retried internally.
    pub fn start(&mut self) -> NvrResult<()> {
        if self.supervisor.is_some() {
            return Ok(());
        }
        ensure_gst()?;
        self.running.store(true, Ordering::SeqCst);

        if self.def.segment {
            let recorder = Arc::new(SegmentRecorder::new(
                self.segment_dir.clone(),
                self.def.container_ext(),
                self.scan_interval,
                self.max_retained,
            ));
            let handle = recorder.start()?;
            self.recorder = Some((recorder, handle));
        }

        let launch = build_launch(&self.def, &self.segment_dir, &self.media_dir);
        info!("[camera] {}: pipeline: {launch}", self.def.name);

        let first = match gst::parse::launch(&launch) {
            Ok(element) => element,
            Err(e) => {
                // Roll the recorder back so the camera is fully stopped.
                if let Some((recorder, handle)) = self.recorder.take() {
                    recorder.stop(handle);
                }
                self.running.store(false, Ordering::SeqCst);
                return Err(NvrError::PipelineBuild(e.to_string()));
            }
        };

        let ctx = SupervisorCtx {
            camera: self.def.name.clone(),
            def: self.def.clone(),
            launch,
            shared: Arc::clone(&self.shared),
            recorder: self.recorder.as_ref().map(|(r, _)| Arc::clone(r)),
            exporter: self.exporter.clone(),
            clip_dir: self.media_dir.clone(),
            running: Arc::clone(&self.running),
        };
        let handle = thread::Builder::new()
            .name(format!("camera-{}", self.def.name))
            .spawn(move || supervise(ctx, first))
            .map_err(|e| NvrError::io("spawn camera supervisor", e))?;
        self.supervisor = Some(handle);
        Ok(())
    }

    /// Stop every worker and release the graph. Safe to call twice.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        if let Some((recorder, handle)) = self.recorder.take() {
            recorder.stop(handle);
        }
        self.shared.motion_detected.store(false, Ordering::SeqCst);
    }

    fn rebuild(&mut self) -> NvrResult<()> {
        let was_running = self.supervisor.is_some();
        self.stop();
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    pub fn set_segment(&mut self, on: bool) -> NvrResult<()> {
        if self.def.segment == on {
            return Ok(());
        }
        self.def.segment = on;
        self.rebuild()
    }

    /// `Some(file)` enables full recording into the camera's media dir;
    /// `None` disables it.
    pub fn set_recording(&mut self, file: Option<String>) -> NvrResult<()> {
        match file {
            Some(file) => {
                if self.def.recording && self.def.record_file.as_deref() == Some(file.as_str()) {
                    return Ok(());
                }
                self.def.recording = true;
                self.def.record_file = Some(file);
            }
            None => {
                if !self.def.recording {
                    return Ok(());
                }
                self.def.recording = false;
                self.def.record_file = None;
            }
        }
        self.rebuild()
    }

    pub fn set_overlay(&mut self, on: bool) -> NvrResult<()> {
        if self.def.overlay == on {
            return Ok(());
        }
        self.def.overlay = on;
        self.rebuild()
    }

    pub fn set_motion_frame(&mut self, on: bool) -> NvrResult<()> {
        if self.def.motion_frame == on {
            return Ok(());
        }
        self.def.motion_frame = on;
        self.rebuild()
    }

    pub fn add_motion_region(&self, rect: RegionRect, angle_deg: f32) -> u32 {
        let id = self.shared.next_region_id.fetch_add(1, Ordering::SeqCst);
        let mut regions = self.shared.regions.lock().expect("regions poisoned");
        regions.push(MotionRegion::new(id, rect, angle_deg));
        info!(
            "[camera] {}: added motion region {id} at ({},{}) {}x{} angle {angle_deg}",
            self.def.name, rect.x, rect.y, rect.w, rect.h
        );
        id
    }

    pub fn remove_motion_region(&self, id: u32) -> bool {
        let mut regions = self.shared.regions.lock().expect("regions poisoned");
        let before = regions.len();
        regions.retain(|r| r.id != id);
        before != regions.len()
    }

    pub fn clear_motion_regions(&self) {
        self.shared.regions.lock().expect("regions poisoned").clear();
    }

    pub fn motion_regions(&self) -> Vec<MotionRegion> {
        self.shared.regions.lock().expect("regions poisoned").clone()
    }

    pub fn has_motion_frame(&self) -> bool {
        self.shared.last_frame.lock().expect("last frame poisoned").is_some()
    }

    /// JPEG-encode the latest annotated frame, if any exists yet.
    pub fn last_motion_jpeg(&self) -> Option<NvrResult<Vec<u8>>> {
        let guard = self.shared.last_frame.lock().expect("last frame poisoned");
        guard.as_ref().map(encode_jpeg)
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn supervise(ctx: SupervisorCtx, first: gst::Element) {
    let mut pipeline = Some(first);
    let mut attempt = 0u32;

    while ctx.running.load(Ordering::SeqCst) {
        let current = match pipeline.take() {
            Some(p) => p,
            None => match gst::parse::launch(&ctx.launch) {
                Ok(p) => p,
                Err(e) => {
                    attempt += 1;
                    warn!("[camera] {}: rebuild parse failed: {e}", ctx.camera);
                    backoff_sleep(&ctx.running, retry_delay(attempt));
                    continue;
                }
            },
        };

        match run_incarnation(&ctx, current) {
            RunExit::Stopped => break,
            RunExit::Failed(reason) => {
                attempt += 1;
                let delay = retry_delay(attempt);
                warn!("[camera] {}: {reason}; restarting in {delay:?}", ctx.camera);
                backoff_sleep(&ctx.running, delay);
            }
        }
    }
    debug!("[camera] {}: supervisor exited", ctx.camera);
}

/// Bounded exponential retry: 300, 600, 900 ms, then 1.5 s steady.
fn retry_delay(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::from_millis(300),
        2 => Duration::from_millis(600),
        3 => Duration::from_millis(900),
        _ => Duration::from_millis(1500),
    }
}

/// Sleep in small slices so a stop request stays prompt.
fn backoff_sleep(running: &AtomicBool, delay: Duration) {
    let mut remaining = delay;
    while running.load(Ordering::SeqCst) && remaining > Duration::ZERO {
        let slice = remaining.min(Duration::from_millis(50));
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

fn run_incarnation(ctx: &SupervisorCtx, pipeline: gst::Element) -> RunExit {
    if let Err(e) = pipeline.set_state(gst::State::Playing) {
        let _ = pipeline.set_state(gst::State::Null);
        return RunExit::Failed(format!("failed to start pipeline: {e}"));
    }

    let mut motion_worker: Option<(thread::JoinHandle<()>, Arc<AtomicBool>)> = None;
    if ctx.def.motion_frame {
        match find_motion_sink(&pipeline) {
            Some(appsink) => {
                let alive = Arc::new(AtomicBool::new(true));
                let worker_ctx = MotionContext {
                    camera: ctx.camera.clone(),
                    params: ctx.def.motion_params(),
                    segment_enabled: ctx.def.segment,
                    shared: Arc::clone(&ctx.shared),
                    recorder: ctx.recorder.clone(),
                    exporter: ctx.exporter.clone(),
                    clip_dir: ctx.clip_dir.clone(),
                    container: ctx.def.container_ext().to_string(),
                    running: Arc::clone(&ctx.running),
                    alive: Arc::clone(&alive),
                };
                match spawn_motion_worker(appsink, worker_ctx) {
                    Ok(handle) => motion_worker = Some((handle, alive)),
                    Err(e) => warn!("[camera] {}: {e}", ctx.camera),
                }
            }
            None => warn!("[camera] {}: appsink 'motion_sink' not in pipeline", ctx.camera),
        }
    }

    let exit = watch_bus(ctx, &pipeline);

    if let Some((handle, alive)) = motion_worker {
        alive.store(false, Ordering::SeqCst);
        let _ = handle.join();
    }
    let _ = pipeline.set_state(gst::State::Null);
    exit
}

fn watch_bus(ctx: &SupervisorCtx, pipeline: &gst::Element) -> RunExit {
    let Some(bus) = pipeline.bus() else {
        return RunExit::Failed("pipeline has no bus".into());
    };

    loop {
        if !ctx.running.load(Ordering::SeqCst) {
            return RunExit::Stopped;
        }
        if ctx.shared.worker_failed.swap(false, Ordering::SeqCst) {
            return RunExit::Failed("motion worker failed".into());
        }
        let msg = bus.timed_pop_filtered(
            gst::ClockTime::from_mseconds(500),
            &[gst::MessageType::Error, gst::MessageType::Eos],
        );
        match msg {
            Some(msg) => match msg.view() {
                gst::MessageView::Error(err) => {
                    return RunExit::Failed(format!("bus error: {}", err.error()));
                }
                gst::MessageView::Eos(_) => {
                    return RunExit::Failed("end of stream".into());
                }
                _ => {}
            },
            None => {}
        }
    }
}

fn find_motion_sink(pipeline: &gst::Element) -> Option<gst_app::AppSink> {
    let bin = pipeline.clone().downcast::<gst::Bin>().ok()?;
    let sink = bin.by_name("motion_sink")?;
    sink.downcast::<gst_app::AppSink>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsData;

    fn def(segment: bool, motion: bool) -> CameraDefinition {
        let mut def = CameraDefinition::from_settings(
            "front",
            "rtsp://10.0.0.5:554/stream",
            &SettingsData::default(),
        );
        def.segment = segment;
        def.motion_frame = motion;
        def
    }

    fn launch(def: &CameraDefinition) -> String {
        build_launch(def, Path::new("/m/front/tmp"), Path::new("/m/front"))
    }

    #[test]
    fn upstream_is_forced_to_tcp() {
        let p = launch(&def(false, false));
        assert!(p.contains("protocols=tcp"));
        assert!(p.contains("latency=150"));
        assert!(p.contains("drop-on-latency=true"));
    }

    #[test]
    fn audio_graphs_get_a_deeper_jitter_buffer() {
        let mut d = def(true, false);
        d.audio = Some(AudioHint {
            has_audio: true,
            encoding: "MPEG4-GENERIC".into(),
            rate: 48000,
            channels: 2,
            probed: true,
        });
        assert!(launch(&d).contains("latency=300"));
    }

    #[test]
    fn segment_branch_present_only_when_segmenting() {
        let with = launch(&def(true, false));
        assert!(with.contains("splitmuxsink name=smux"));
        assert!(with.contains("max-size-time=10000000000 max-files=3"));
        assert!(with.contains("smux.video"));
        assert!(with.contains("/m/front/tmp/segment-%03d.mkv"));

        let without = launch(&def(false, false));
        assert!(!without.contains("splitmuxsink"));
    }

    #[test]
    fn motion_branch_uses_single_slot_dropping_appsink() {
        let p = launch(&def(false, true));
        assert!(p.contains("appsink name=motion_sink"));
        assert!(p.contains("max-buffers=1 drop=true sync=false"));
        assert!(p.contains("video/x-raw,format=BGR"));
    }

    #[test]
    fn audio_branch_requires_probe_hit_and_segmenting() {
        let mut d = def(true, false);
        d.audio = Some(AudioHint {
            has_audio: true,
            encoding: "MPEG4-GENERIC".into(),
            rate: 48000,
            channels: 2,
            probed: true,
        });
        let p = launch(&d);
        assert!(p.contains("smux.audio_0"));
        assert!(p.contains("rate=48000,channels=2"));
        // The explicit video-pad caps selector is only used in the
        // audio-absent shape.
        assert!(!p.contains("application/x-rtp,media=video"));

        let mut no_segment = d.clone();
        no_segment.segment = false;
        assert!(!launch(&no_segment).contains("audio_0"));

        let no_audio = def(true, false);
        let p = launch(&no_audio);
        assert!(!p.contains("audio_0"));
        assert!(p.contains("application/x-rtp,media=video,encoding-name=H264"));
    }

    #[test]
    fn recording_branch_remuxes_to_media_dir() {
        let mut d = def(false, false);
        d.recording = true;
        d.record_file = Some("evidence.mkv".into());
        let p = launch(&d);
        assert!(p.contains("filesink location=/m/front/evidence.mkv"));
        assert!(p.contains("matroskamux"));

        // Path components in the requested file are stripped.
        d.record_file = Some("../../escape.mkv".into());
        assert!(launch(&d).contains("filesink location=/m/front/escape.mkv"));
    }

    #[test]
    fn reencode_proxy_gets_intervideo_tap() {
        let mut d = def(false, false);
        d.gstreamer_proxy = true;
        let p = launch(&d);
        assert!(p.contains("intervideosink channel=front"));

        // Relay proxying needs no tap: the proxy pulls upstream itself.
        let mut relay = def(false, false);
        relay.live555_proxy = true;
        assert!(!launch(&relay).contains("intervideosink"));
    }

    #[test]
    fn mp4_container_switches_muxer_and_extension() {
        let mut d = def(true, false);
        d.video_output_format = "mp4".into();
        let p = launch(&d);
        assert!(p.contains("muxer-factory=mp4mux"));
        assert!(p.contains("segment-%03d.mp4"));
    }

    #[test]
    fn region_crud_round_trips_with_monotonic_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let stream =
            CameraStream::new(def(false, false), &SettingsData::default(), tmp.path()).unwrap();

        assert!(stream.motion_regions().is_empty());
        let first = stream.add_motion_region(RegionRect { x: 0, y: 0, w: 10, h: 10 }, 0.0);
        let second = stream.add_motion_region(RegionRect { x: 5, y: 5, w: 4, h: 4 }, 45.0);
        assert_eq!((first, second), (1, 2));

        // Removing the returned id restores the prior set; a second remove
        // finds nothing.
        assert!(stream.remove_motion_region(second));
        assert!(!stream.remove_motion_region(second));
        let remaining = stream.motion_regions();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, first);

        // Clearing is idempotent and ids never restart.
        stream.clear_motion_regions();
        stream.clear_motion_regions();
        assert!(stream.motion_regions().is_empty());
        assert_eq!(stream.add_motion_region(RegionRect { x: 0, y: 0, w: 2, h: 2 }, 0.0), 3);
    }

    #[test]
    fn retry_schedule_is_bounded() {
        assert_eq!(retry_delay(1), Duration::from_millis(300));
        assert_eq!(retry_delay(2), Duration::from_millis(600));
        assert_eq!(retry_delay(3), Duration::from_millis(900));
        assert_eq!(retry_delay(4), Duration::from_millis(1500));
        assert_eq!(retry_delay(100), Duration::from_millis(1500));
    }
}
