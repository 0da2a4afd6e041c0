//! Camera definitions: immutable identity plus mutable policy.
//!
//! A `CameraDefinition` is what the registry persists to `cameras.json` and
//! what the HTTP layer assembles from form parameters (missing parameters
//! fall back to the settings store). The runtime side lives in
//! [`stream::CameraStream`].

pub mod motion;
pub mod region;
pub mod stream;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::paths::sanitize_camera_name;
use crate::settings::{self, SettingsData};

/// Cached result of the upstream RTSP audio probe. Stored in the definition
/// so restarts do not re-probe the camera.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioHint {
    pub has_audio: bool,
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub rate: i32,
    #[serde(default)]
    pub channels: i32,
    #[serde(skip)]
    pub probed: bool,
}

/// Which proxy front-end a camera is served through, if any. The two styles
/// are mutually exclusive; when a caller requests both, the relay wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    None,
    /// Bridge the upstream without re-encoding (shared session, TCP backend).
    Relay,
    /// Re-encode a decoded tap from the ingest graph at a chosen profile.
    Reencode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraDefinition {
    pub name: String,
    /// Effective RTSP URI the ingest graph connects to. For relay-proxied
    /// cameras this points at the local proxy mount and `original_uri`
    /// keeps the upstream address.
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_uri: Option<String>,

    #[serde(default)]
    pub segment: bool,
    #[serde(default)]
    pub recording: bool,
    #[serde(default)]
    pub overlay: bool,
    #[serde(default)]
    pub motion_frame: bool,
    #[serde(default, rename = "gstreamerEncodedProxy")]
    pub gstreamer_proxy: bool,
    #[serde(default, rename = "live555proxied")]
    pub live555_proxy: bool,

    #[serde(default = "settings::default_segment_bitrate")]
    pub segment_bitrate: u32,
    #[serde(default = "settings::default_segment_speed_preset")]
    pub segment_speed_preset: String,
    #[serde(default = "settings::default_proxy_bitrate")]
    pub proxy_bitrate: u32,
    #[serde(default = "settings::default_proxy_speed_preset")]
    pub proxy_speed_preset: String,

    #[serde(default = "settings::default_motion_frame_size")]
    pub motion_frame_size: (u32, u32),
    #[serde(default = "settings::default_motion_frame_scale")]
    pub motion_frame_scale: f32,
    #[serde(default = "settings::default_noise_threshold")]
    pub noise_threshold: f32,
    #[serde(default = "settings::default_motion_threshold")]
    pub motion_threshold: f32,
    #[serde(default = "settings::default_motion_min_hits")]
    pub motion_min_hits: u32,
    #[serde(default = "settings::default_motion_decay")]
    pub motion_decay: u32,
    #[serde(default = "settings::default_motion_arrow_scale")]
    pub motion_arrow_scale: f32,
    #[serde(default = "settings::default_motion_arrow_thickness")]
    pub motion_arrow_thickness: i32,
    #[serde(default = "settings::default_motion_hold_seconds")]
    pub motion_hold_seconds: u64,

    #[serde(default = "settings::default_video_output_format")]
    pub video_output_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioHint>,
}

impl CameraDefinition {
    /// A fresh definition for `name`/`uri` with every policy field taken
    /// from the settings store. The HTTP layer overlays explicit form
    /// parameters on top of this.
    pub fn from_settings(name: &str, uri: &str, s: &SettingsData) -> CameraDefinition {
        CameraDefinition {
            name: name.to_string(),
            uri: uri.to_string(),
            original_uri: None,
            segment: false,
            recording: false,
            overlay: false,
            motion_frame: false,
            gstreamer_proxy: false,
            live555_proxy: false,
            segment_bitrate: s.segment_bitrate,
            segment_speed_preset: s.segment_speed_preset.clone(),
            proxy_bitrate: s.proxy_bitrate,
            proxy_speed_preset: s.proxy_speed_preset.clone(),
            motion_frame_size: s.motion_frame_size,
            motion_frame_scale: s.motion_frame_scale,
            noise_threshold: s.noise_threshold,
            motion_threshold: s.motion_threshold,
            motion_min_hits: s.motion_min_hits,
            motion_decay: s.motion_decay,
            motion_arrow_scale: s.motion_arrow_scale,
            motion_arrow_thickness: s.motion_arrow_thickness,
            motion_hold_seconds: s.motion_hold_seconds,
            video_output_format: s.video_output_format.clone(),
            record_file: None,
            audio: None,
        }
    }

    pub fn sanitized_name(&self) -> String {
        sanitize_camera_name(&self.name)
    }

    /// Resolve the proxy flags. Both set prefers the relay style; the
    /// caller is expected to have warned about the combination.
    pub fn proxy_kind(&self) -> ProxyKind {
        if self.live555_proxy {
            ProxyKind::Relay
        } else if self.gstreamer_proxy {
            ProxyKind::Reencode
        } else {
            ProxyKind::None
        }
    }

    /// Upstream URI regardless of proxy re-pointing.
    pub fn upstream_uri(&self) -> &str {
        self.original_uri.as_deref().unwrap_or(&self.uri)
    }

    /// Container extension for segments, clips and full recordings.
    pub fn container_ext(&self) -> &str {
        match self.video_output_format.as_str() {
            "mp4" => "mp4",
            _ => "mkv",
        }
    }

    /// GStreamer muxer factory matching [`Self::container_ext`].
    pub fn muxer_factory(&self) -> &str {
        match self.container_ext() {
            "mp4" => "mp4mux",
            _ => "matroskamux",
        }
    }

    pub fn motion_params(&self) -> MotionParams {
        MotionParams {
            frame_size: self.motion_frame_size,
            frame_scale: self.motion_frame_scale,
            noise_threshold: self.noise_threshold,
            motion_threshold: self.motion_threshold,
            min_hits: self.motion_min_hits,
            decay: self.motion_decay,
            arrow_scale: self.motion_arrow_scale,
            arrow_thickness: self.motion_arrow_thickness,
            hold: Duration::from_secs(self.motion_hold_seconds),
        }
    }
}

/// The analyser's working parameters, copied out of the definition when a
/// worker starts.
#[derive(Debug, Clone)]
pub struct MotionParams {
    pub frame_size: (u32, u32),
    pub frame_scale: f32,
    pub noise_threshold: f32,
    pub motion_threshold: f32,
    pub min_hits: u32,
    pub decay: u32,
    pub arrow_scale: f32,
    pub arrow_thickness: i32,
    pub hold: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_round_trips_through_json() {
        let mut def =
            CameraDefinition::from_settings("front", "rtsp://10.0.0.5/stream", &SettingsData::default());
        def.segment = true;
        def.live555_proxy = true;
        def.original_uri = Some("rtsp://10.0.0.5/stream".into());
        def.uri = "rtsp://127.0.0.1:8554/cam/front".into();
        def.audio = Some(AudioHint {
            has_audio: true,
            encoding: "MPEG4-GENERIC".into(),
            rate: 48000,
            channels: 2,
            probed: true,
        });

        let json = serde_json::to_string(&def).unwrap();
        // Wire names stay compatible with the persisted format.
        assert!(json.contains("\"live555proxied\":true"));
        assert!(json.contains("\"gstreamerEncodedProxy\":false"));

        let back: CameraDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "front");
        assert!(back.segment);
        assert_eq!(back.proxy_kind(), ProxyKind::Relay);
        assert_eq!(back.upstream_uri(), "rtsp://10.0.0.5/stream");
        assert!(back.audio.unwrap().has_audio);
    }

    #[test]
    fn sparse_entry_loads_with_defaults() {
        let back: CameraDefinition =
            serde_json::from_str(r#"{"name": "a", "uri": "rtsp://h/s"}"#).unwrap();
        assert_eq!(back.segment_bitrate, 2000);
        assert_eq!(back.motion_hold_seconds, 5);
        assert_eq!(back.container_ext(), "mkv");
        assert_eq!(back.proxy_kind(), ProxyKind::None);
    }

    #[test]
    fn relay_wins_when_both_proxies_requested() {
        let mut def = CameraDefinition::from_settings("a", "rtsp://h/s", &SettingsData::default());
        def.live555_proxy = true;
        def.gstreamer_proxy = true;
        assert_eq!(def.proxy_kind(), ProxyKind::Relay);
    }

    #[test]
    fn container_mapping() {
        let mut def = CameraDefinition::from_settings("a", "rtsp://h/s", &SettingsData::default());
        assert_eq!(def.muxer_factory(), "matroskamux");
        def.video_output_format = "mp4".into();
        assert_eq!(def.container_ext(), "mp4");
        assert_eq!(def.muxer_factory(), "mp4mux");
    }
}
