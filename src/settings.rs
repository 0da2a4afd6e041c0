//! File-backed settings store with compiled-in defaults.
//!
//! `settings.json` is a flat object; any key missing from the file falls
//! back to its default. Writes persist immediately under the store's mutex.
//! Changes affect newly created cameras only; running pipelines keep the
//! values they were built with until an explicit rebuild.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{NvrError, NvrResult};

pub(crate) fn default_segment_bitrate() -> u32 {
    2000
}
pub(crate) fn default_segment_speed_preset() -> String {
    "veryfast".into()
}
pub(crate) fn default_proxy_bitrate() -> u32 {
    2000
}
pub(crate) fn default_proxy_speed_preset() -> String {
    "superfast".into()
}
pub(crate) fn default_motion_frame_size() -> (u32, u32) {
    (0, 0)
}
pub(crate) fn default_motion_frame_scale() -> f32 {
    1.0
}
pub(crate) fn default_noise_threshold() -> f32 {
    1.0
}
pub(crate) fn default_motion_threshold() -> f32 {
    10.0
}
pub(crate) fn default_motion_min_hits() -> u32 {
    3
}
pub(crate) fn default_motion_decay() -> u32 {
    1
}
pub(crate) fn default_motion_arrow_scale() -> f32 {
    2.5
}
pub(crate) fn default_motion_arrow_thickness() -> i32 {
    1
}
pub(crate) fn default_motion_hold_seconds() -> u64 {
    5
}
pub(crate) fn default_video_output_format() -> String {
    "mkv".into()
}
pub(crate) fn default_live_rtsp_proxy_port() -> u16 {
    8554
}
pub(crate) fn default_http_port() -> u16 {
    8080
}
pub(crate) fn default_scan_interval_ms() -> u64 {
    500
}
pub(crate) fn default_max_retained_segments() -> usize {
    65
}

/// The persisted key set. Every field has a standalone default so a partial
/// or empty file still yields a full configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsData {
    #[serde(default = "default_segment_bitrate")]
    pub segment_bitrate: u32,
    #[serde(default = "default_segment_speed_preset")]
    pub segment_speed_preset: String,
    #[serde(default = "default_proxy_bitrate")]
    pub proxy_bitrate: u32,
    #[serde(default = "default_proxy_speed_preset")]
    pub proxy_speed_preset: String,
    #[serde(default = "default_motion_frame_size")]
    pub motion_frame_size: (u32, u32),
    #[serde(default = "default_motion_frame_scale")]
    pub motion_frame_scale: f32,
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: f32,
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: f32,
    #[serde(default = "default_motion_min_hits")]
    pub motion_min_hits: u32,
    #[serde(default = "default_motion_decay")]
    pub motion_decay: u32,
    #[serde(default = "default_motion_arrow_scale")]
    pub motion_arrow_scale: f32,
    #[serde(default = "default_motion_arrow_thickness")]
    pub motion_arrow_thickness: i32,
    #[serde(default = "default_motion_hold_seconds")]
    pub motion_hold_seconds: u64,
    #[serde(default = "default_video_output_format")]
    pub video_output_format: String,
    #[serde(default = "default_live_rtsp_proxy_port")]
    pub live_rtsp_proxy_port: u16,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_max_retained_segments")]
    pub max_retained_segments: usize,
}

impl Default for SettingsData {
    fn default() -> Self {
        // An empty object deserialises into pure defaults.
        serde_json::from_str("{}").expect("defaults are total")
    }
}

/// Hot-readable settings handle shared across components.
pub struct Settings {
    path: PathBuf,
    data: Mutex<SettingsData>,
}

impl Settings {
    /// Load from `path`, falling back to defaults when the file is missing
    /// or unreadable. A malformed file is reported and ignored.
    pub fn load(path: PathBuf) -> Settings {
        let data = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(e) => {
                    warn!("settings: ignoring malformed {}: {e}", path.display());
                    SettingsData::default()
                }
            },
            Err(_) => SettingsData::default(),
        };
        Settings { path, data: Mutex::new(data) }
    }

    /// Snapshot of the current values.
    pub fn get(&self) -> SettingsData {
        self.data.lock().expect("settings poisoned").clone()
    }

    /// Mutate the store and persist the result immediately.
    pub fn update(&self, f: impl FnOnce(&mut SettingsData)) -> NvrResult<()> {
        let mut data = self.data.lock().expect("settings poisoned");
        f(&mut data);
        let text = serde_json::to_string_pretty(&*data)
            .map_err(|e| NvrError::invalid(format!("settings serialise: {e}")))?;
        fs::write(&self.path, text)
            .map_err(|e| NvrError::io(format!("write {}", self.path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_defaults() {
        let d = SettingsData::default();
        assert_eq!(d.segment_bitrate, 2000);
        assert_eq!(d.segment_speed_preset, "veryfast");
        assert_eq!(d.proxy_speed_preset, "superfast");
        assert_eq!(d.motion_frame_size, (0, 0));
        assert_eq!(d.motion_threshold, 10.0);
        assert_eq!(d.motion_min_hits, 3);
        assert_eq!(d.motion_hold_seconds, 5);
        assert_eq!(d.video_output_format, "mkv");
        assert_eq!(d.live_rtsp_proxy_port, 8554);
        assert_eq!(d.http_port, 8080);
        assert_eq!(d.max_retained_segments, 65);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"motion_threshold": 3.5, "http_port": 9000}"#).unwrap();

        let settings = Settings::load(path);
        let d = settings.get();
        assert_eq!(d.motion_threshold, 3.5);
        assert_eq!(d.http_port, 9000);
        assert_eq!(d.motion_min_hits, 3);
    }

    #[test]
    fn update_persists_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = Settings::load(path.clone());
        settings.update(|d| d.proxy_bitrate = 4500).unwrap();

        let reloaded = Settings::load(path);
        assert_eq!(reloaded.get().proxy_bitrate, 4500);
    }
}
