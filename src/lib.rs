//! # nvrd — network video recorder back-end
//!
//! Pulls live RTSP camera streams, re-serves them through an internal RTSP
//! proxy, runs optical-flow motion analysis on decoded frames, and
//! persists motion-triggered clips to disk. Control happens over a small
//! HTTP surface; camera definitions survive restarts in `cameras.json`.
//!
//! ## Components
//!
//! - [`camera::stream`]: per-camera GStreamer graph (ingest, decode tap,
//!   segment ring) with a supervising retry loop
//! - [`segment`]: rolling-segment observer that retains motion segments
//! - [`camera::motion`]: sparse optical-flow analyser driving the recorder
//! - [`export`]: concat-demuxer clip exporter
//! - [`manager`]: camera registry, persistence, proxy orchestration
//! - [`http`]: the control plane
//! - [`settings`]: file-backed defaults
//!
//! The RTSP proxy front-end lives in the `nvr-rtsp` workspace crate.
//!
//! Everything runs on OS threads; there is no async runtime in the core.

pub mod camera;
pub mod error;
pub mod export;
pub mod http;
pub mod manager;
pub mod paths;
pub mod segment;
pub mod settings;

pub use camera::{AudioHint, CameraDefinition, ProxyKind};
pub use error::{NvrError, NvrResult};
pub use manager::CameraManager;
pub use settings::{Settings, SettingsData};
