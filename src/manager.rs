//! Camera registry: owns every camera, persists definitions, orchestrates
//! the ingest graphs and the RTSP proxy.
//!
//! Structural changes go through one registry mutex; the slow substeps
//! (the audio probe, pipeline construction) run outside it and the insert
//! re-checks for a racing duplicate. The proxy has its own lock and the
//! two are never held together.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use serde_json::json;

use nvr_rtsp::RtspProxy;

use crate::camera::region::RegionRect;
use crate::camera::stream::{probe_rtsp_audio, CameraStream};
use crate::camera::{AudioHint, CameraDefinition, ProxyKind};
use crate::error::{NvrError, NvrResult};
use crate::settings::{Settings, SettingsData};

const AUDIO_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Seam between the registry and the media runtime. The production
/// backend probes real upstreams and starts real pipelines; tests swap in
/// a stub so registry behaviour is checkable without GStreamer or a
/// network.
trait StreamBackend: Send + Sync {
    fn probe_audio(&self, uri: &str, timeout: Duration) -> NvrResult<AudioHint>;

    /// Build the camera runtime and bring it up.
    fn build(
        &self,
        def: CameraDefinition,
        settings: &SettingsData,
        media_root: &Path,
    ) -> NvrResult<CameraStream>;
}

struct GstBackend;

impl StreamBackend for GstBackend {
    fn probe_audio(&self, uri: &str, timeout: Duration) -> NvrResult<AudioHint> {
        probe_rtsp_audio(uri, timeout)
    }

    fn build(
        &self,
        def: CameraDefinition,
        settings: &SettingsData,
        media_root: &Path,
    ) -> NvrResult<CameraStream> {
        let mut stream = CameraStream::new(def, settings, media_root)?;
        stream.start()?;
        Ok(stream)
    }
}

pub struct CameraManager {
    backend: Box<dyn StreamBackend>,
    cameras: Mutex<BTreeMap<String, CameraStream>>,
    proxy: Mutex<Option<RtspProxy>>,
    settings: Arc<Settings>,
    config_path: PathBuf,
    media_root: PathBuf,
}

impl CameraManager {
    /// Create the registry and materialise every camera persisted in
    /// `config_path`. Entries that fail to load are skipped, not fatal.
    pub fn new(settings: Arc<Settings>, config_path: PathBuf, media_root: PathBuf) -> Arc<CameraManager> {
        Self::with_backend(Box::new(GstBackend), settings, config_path, media_root)
    }

    fn with_backend(
        backend: Box<dyn StreamBackend>,
        settings: Arc<Settings>,
        config_path: PathBuf,
        media_root: PathBuf,
    ) -> Arc<CameraManager> {
        let manager = Arc::new(CameraManager {
            backend,
            cameras: Mutex::new(BTreeMap::new()),
            proxy: Mutex::new(None),
            settings,
            config_path,
            media_root,
        });
        manager.load_cameras();
        manager
    }

    /// Register a camera and bring its runtime up. On any step failure the
    /// already-applied steps are rolled back and the registry is unchanged.
    pub fn add_camera(&self, mut def: CameraDefinition, loading: bool) -> NvrResult<()> {
        if !crate::paths::is_valid_camera_name(&def.name) {
            return Err(NvrError::invalid(format!(
                "camera name {:?} (allowed: [A-Za-z0-9._-]+)",
                def.name
            )));
        }
        if self.cameras.lock().expect("registry poisoned").contains_key(&def.name) {
            return Err(NvrError::conflict(format!("camera '{}' already exists", def.name)));
        }

        if def.live555_proxy && def.gstreamer_proxy {
            warn!(
                "camera '{}': both proxy styles requested; preferring the relay proxy",
                def.name
            );
        }
        let proxy_kind = def.proxy_kind();
        let sanitized = def.sanitized_name();
        let mount_path = format!("cam/{sanitized}");
        let upstream = def.upstream_uri().to_string();

        // Cached hint wins; a fresh DESCRIBE probe only runs when none.
        if !def.audio.as_ref().map(|a| a.probed).unwrap_or(false) {
            let hint = self.backend.probe_audio(&upstream, AUDIO_PROBE_TIMEOUT)?;
            info!(
                "camera '{}': probed upstream, audio: {}",
                def.name,
                if hint.has_audio { "yes" } else { "no" }
            );
            def.audio = Some(hint);
        }

        match proxy_kind {
            ProxyKind::Relay => {
                let mounted = self.with_proxy(|proxy| {
                    proxy.add_relay_mount(&upstream, &mount_path)?;
                    Ok(proxy.port())
                });
                let port = match mounted {
                    Ok(port) => port,
                    Err(e) => {
                        self.stop_proxy_if_idle();
                        return Err(e);
                    }
                };
                // Subsequent consumers (our own ingest included) go through
                // the shared proxy session.
                def.original_uri = Some(upstream.clone());
                def.uri = format!("rtsp://127.0.0.1:{port}/{mount_path}");
            }
            ProxyKind::Reencode => {
                let mounted = self.with_proxy(|proxy| {
                    proxy.add_reencode_mount(
                        &sanitized,
                        &mount_path,
                        def.proxy_bitrate,
                        &def.proxy_speed_preset,
                    )?;
                    Ok(())
                });
                if let Err(e) = mounted {
                    self.stop_proxy_if_idle();
                    return Err(e);
                }
            }
            ProxyKind::None => {}
        }

        let built = self.backend.build(def, &self.settings.get(), &self.media_root);
        let stream = match built {
            Ok(stream) => stream,
            Err(e) => {
                self.rollback_mount(proxy_kind, &mount_path);
                return Err(e);
            }
        };

        {
            let mut cameras = self.cameras.lock().expect("registry poisoned");
            if cameras.contains_key(stream.definition().name.as_str()) {
                // Lost a race with a concurrent add of the same name.
                drop(cameras);
                let name = stream.definition().name.clone();
                drop(stream);
                self.rollback_mount(proxy_kind, &mount_path);
                return Err(NvrError::conflict(format!("camera '{name}' already exists")));
            }
            cameras.insert(stream.definition().name.clone(), stream);
        }

        if !loading {
            self.persist();
        }
        Ok(())
    }

    /// Tear a camera down in reverse order of construction. Removing an
    /// unknown name reports `NotFound` but leaves the same state behind.
    pub fn remove_camera(&self, name: &str) -> NvrResult<()> {
        let mut stream = {
            let mut cameras = self.cameras.lock().expect("registry poisoned");
            cameras
                .remove(name)
                .ok_or_else(|| NvrError::not_found(format!("camera '{name}'")))?
        };

        let proxy_kind = stream.definition().proxy_kind();
        let mount_path = format!("cam/{}", stream.definition().sanitized_name());
        stream.stop();
        drop(stream);

        if proxy_kind != ProxyKind::None {
            self.rollback_mount(proxy_kind, &mount_path);
        }
        info!("closed stream /{mount_path}");
        self.persist();
        Ok(())
    }

    /// Run `f` against a camera's runtime under the registry lock.
    pub fn with_camera<R>(&self, name: &str, f: impl FnOnce(&CameraStream) -> R) -> Option<R> {
        let cameras = self.cameras.lock().expect("registry poisoned");
        cameras.get(name).map(f)
    }

    /// Mutable variant used by the policy toggles; persists afterwards so a
    /// restart reproduces the current policy.
    pub fn with_camera_mut<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut CameraStream) -> R,
    ) -> Option<R> {
        let result = {
            let mut cameras = self.cameras.lock().expect("registry poisoned");
            cameras.get_mut(name).map(f)
        };
        if result.is_some() {
            self.persist();
        }
        result
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.lock().expect("registry poisoned").len()
    }

    pub fn camera_names(&self) -> Vec<String> {
        self.cameras.lock().expect("registry poisoned").keys().cloned().collect()
    }

    pub fn add_motion_region(&self, name: &str, rect: RegionRect, angle: f32) -> NvrResult<u32> {
        self.with_camera(name, |cam| cam.add_motion_region(rect, angle))
            .ok_or_else(|| NvrError::not_found(format!("camera '{name}'")))
    }

    pub fn remove_motion_region(&self, name: &str, region_id: u32) -> NvrResult<bool> {
        self.with_camera(name, |cam| cam.remove_motion_region(region_id))
            .ok_or_else(|| NvrError::not_found(format!("camera '{name}'")))
    }

    /// Idempotent; clearing an unknown camera is a no-op.
    pub fn clear_motion_regions(&self, name: &str) {
        self.with_camera(name, |cam| cam.clear_motion_regions());
    }

    pub fn list_motion_regions(&self, name: &str) -> NvrResult<Vec<crate::camera::region::MotionRegion>> {
        self.with_camera(name, |cam| cam.motion_regions())
            .ok_or_else(|| NvrError::not_found(format!("camera '{name}'")))
    }

    /// Camera-by-camera JSON for `GET /get_cameras`.
    pub fn info_snapshot(&self) -> serde_json::Value {
        let cameras = self.cameras.lock().expect("registry poisoned");
        let list: Vec<serde_json::Value> = cameras
            .values()
            .map(|cam| {
                let def = cam.definition();
                json!({
                    "name": def.name,
                    "uri": def.uri,
                    "segment": def.segment,
                    "recording": def.recording,
                    "overlay": def.overlay,
                    "motion_frame": def.motion_frame,
                    "gstreamerEncodedProxy": def.gstreamer_proxy,
                    "live555Proxied": def.live555_proxy,
                    "proxy_bitrate": def.proxy_bitrate,
                    "proxy_speed_preset": def.proxy_speed_preset,
                    "segment_bitrate": def.segment_bitrate,
                    "segment_speed_preset": def.segment_speed_preset,
                    "motion_frame_size": [def.motion_frame_size.0, def.motion_frame_size.1],
                    "motion_frame_scale": def.motion_frame_scale,
                    "noise_threshold": def.noise_threshold,
                    "motion_threshold": def.motion_threshold,
                    "motion_min_hits": def.motion_min_hits,
                    "motion_decay": def.motion_decay,
                    "motion_arrow_scale": def.motion_arrow_scale,
                    "motion_arrow_thickness": def.motion_arrow_thickness,
                    "video_output_format": def.video_output_format,
                    "mount_point": cam.mount_point(),
                    "has_motion_frame": cam.has_motion_frame(),
                    "live_proxied_rtsp_path": if def.proxy_kind() == ProxyKind::Relay {
                        json!(format!("cam/{}", def.sanitized_name()))
                    } else {
                        json!(null)
                    },
                })
            })
            .collect();
        serde_json::Value::Array(list)
    }

    /// Stop every camera and the proxy; the registry keeps its entries so
    /// the persisted file still reflects them.
    pub fn stop_all(&self) {
        let mut cameras = self.cameras.lock().expect("registry poisoned");
        for stream in cameras.values_mut() {
            stream.stop();
        }
        drop(cameras);
        if let Some(proxy) = self.proxy.lock().expect("proxy poisoned").take() {
            proxy.stop();
        }
    }

    /// Run `f` against the proxy, lazily starting it on first use.
    fn with_proxy<R>(&self, f: impl FnOnce(&RtspProxy) -> NvrResult<R>) -> NvrResult<R> {
        let mut guard = self.proxy.lock().expect("proxy poisoned");
        if guard.is_none() {
            let port = self.settings.get().live_rtsp_proxy_port;
            *guard = Some(RtspProxy::start(port)?);
        }
        f(guard.as_ref().expect("proxy just started"))
    }

    /// Stop the proxy when it carries no mounts at all.
    fn stop_proxy_if_idle(&self) {
        let mut guard = self.proxy.lock().expect("proxy poisoned");
        if guard.as_ref().map(|p| p.mount_count() == 0).unwrap_or(false) {
            if let Some(proxy) = guard.take() {
                proxy.stop();
            }
        }
    }

    /// Undo a mount registration, stopping the proxy when nothing is left
    /// mounted on it.
    fn rollback_mount(&self, kind: ProxyKind, mount_path: &str) {
        if kind == ProxyKind::None {
            return;
        }
        let mut guard = self.proxy.lock().expect("proxy poisoned");
        if let Some(proxy) = guard.as_ref() {
            proxy.remove_mount(mount_path);
            if proxy.mount_count() == 0 {
                if let Some(proxy) = guard.take() {
                    proxy.stop();
                }
            }
        }
    }

    fn load_cameras(&self) {
        let text = match fs::read_to_string(&self.config_path) {
            Ok(text) => text,
            // No saved cameras yet; that's fine.
            Err(_) => return,
        };
        let parsed: serde_json::Value = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("failed to parse {}: {e}", self.config_path.display());
                return;
            }
        };
        let Some(entries) = parsed.get("cameras").and_then(|c| c.as_array()) else {
            error!("malformed {}: no 'cameras' array", self.config_path.display());
            return;
        };

        for entry in entries {
            let mut def: CameraDefinition = match serde_json::from_value(entry.clone()) {
                Ok(def) => def,
                Err(e) => {
                    warn!("skipping malformed camera entry: {e}");
                    continue;
                }
            };
            if let Some(audio) = def.audio.as_mut() {
                audio.probed = true;
            }
            let name = def.name.clone();
            if let Err(e) = self.add_camera(def, true) {
                warn!("failed to restore camera '{name}': {e}");
            }
        }
        info!("restored {} camera(s)", self.camera_count());
    }

    /// Atomic write-then-rename so a crash never corrupts the file.
    fn persist(&self) {
        let defs: Vec<CameraDefinition> = {
            let cameras = self.cameras.lock().expect("registry poisoned");
            cameras.values().map(|c| c.definition().clone()).collect()
        };
        let body = match serde_json::to_string_pretty(&json!({ "cameras": defs })) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to serialise cameras: {e}");
                return;
            }
        };
        let tmp = self.config_path.with_extension("json.tmp");
        let result = fs::write(&tmp, body).and_then(|_| fs::rename(&tmp, &self.config_path));
        match result {
            Ok(()) => info!("cameras saved to {}", self.config_path.display()),
            Err(e) => error!("failed to write {}: {e}", self.config_path.display()),
        }
    }
}
