// SPDX-License-Identifier: MIT
//! # RTSP proxy front-end
//!
//! Serves one or more upstream RTSP cameras as local mount points at
//! `rtsp://<host>:<port>/cam/<name>`, so a single upstream connection fans
//! out to any number of viewers.
//!
//! Two mount variants exist, chosen per camera:
//! - **Relay**: bridges the upstream elementary stream without re-encoding.
//!   The backend RTP transport is forced to TCP.
//! - **Re-encode**: consumes a decoded tap published by the local ingest
//!   graph (`intervideosink channel=<name>`) and serves a freshly encoded
//!   H.264 stream at a chosen bitrate and speed preset.
//!
//! ## Threading model
//!
//! One background thread owns the GLib main loop, the `RTSPServer` and all
//! mount objects. Public calls may come from any thread: they validate
//! against a mutex-guarded mount table and enqueue a command that the loop
//! thread applies on its next tick. Mount removal therefore never races an
//! active client session, and callers must not assume a mount is visible
//! the instant `add_*_mount` returns.

use std::collections::HashSet;
use std::fmt;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::glib::{ControlFlow, MainContext, MainLoop};
use gstreamer_rtsp_server::prelude::*;
use gstreamer_rtsp_server::{RTSPMediaFactory, RTSPServer};
use log::{debug, info};

/// Errors surfaced by the proxy's public API.
#[derive(Debug)]
pub enum ProxyError {
    /// The server could not bind or attach on the requested port.
    Bind { port: u16, reason: String },
    /// A mount with the same path is already registered.
    MountExists(String),
    /// The proxy event loop is no longer running.
    NotRunning,
    /// GStreamer initialisation failed.
    Init(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Bind { port, reason } => {
                write!(f, "RTSP proxy failed to start on port {port}: {reason}")
            }
            ProxyError::MountExists(path) => write!(f, "mount already exists: {path}"),
            ProxyError::NotRunning => write!(f, "RTSP proxy is not running"),
            ProxyError::Init(reason) => write!(f, "GStreamer init failed: {reason}"),
        }
    }
}

impl std::error::Error for ProxyError {}

enum Command {
    Mount { path: String, launch: String },
    Unmount { path: String },
    Quit,
}

/// Handle to a running RTSP proxy server.
///
/// Dropping the handle stops the event loop and joins its thread.
pub struct RtspProxy {
    port: u16,
    tx: Sender<Command>,
    mounts: Mutex<HashSet<String>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RtspProxy {
    /// Start the proxy server and its event-loop thread.
    ///
    /// Blocks until the server is attached (or has failed to attach) so a
    /// port-bind failure is reported synchronously to the caller.
    pub fn start(port: u16) -> Result<RtspProxy, ProxyError> {
        gst::init().map_err(|e| ProxyError::Init(e.to_string()))?;

        let (tx, rx) = unbounded::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let handle = thread::Builder::new()
            .name("rtsp-proxy".into())
            .spawn(move || serve_loop(port, rx, ready_tx))
            .map_err(|e| ProxyError::Init(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {
                info!("RTSP proxy listening on rtsp://0.0.0.0:{port}/");
                Ok(RtspProxy {
                    port,
                    tx,
                    mounts: Mutex::new(HashSet::new()),
                    handle: Some(handle),
                })
            }
            Ok(Err(reason)) => {
                let _ = handle.join();
                Err(ProxyError::Bind { port, reason })
            }
            Err(_) => {
                // Thread never reported; treat as a failed start.
                Err(ProxyError::Bind {
                    port,
                    reason: "timed out waiting for event loop".into(),
                })
            }
        }
    }

    /// Port the server was started on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of currently registered mounts.
    pub fn mount_count(&self) -> usize {
        self.mounts.lock().expect("mount table poisoned").len()
    }

    /// Register a relay mount: pull `upstream` over RTSP/TCP and re-serve it
    /// at `path` (e.g. `cam/front`) without re-encoding.
    pub fn add_relay_mount(&self, upstream: &str, path: &str) -> Result<(), ProxyError> {
        self.add_mount(path, relay_launch(upstream))
    }

    /// Register a re-encode mount fed by the ingest graph's
    /// `intervideosink channel=<channel>` tap.
    pub fn add_reencode_mount(
        &self,
        channel: &str,
        path: &str,
        bitrate: u32,
        speed_preset: &str,
    ) -> Result<(), ProxyError> {
        self.add_mount(path, reencode_launch(channel, bitrate, speed_preset))
    }

    fn add_mount(&self, path: &str, launch: String) -> Result<(), ProxyError> {
        let path = normalize(path);
        {
            let mut mounts = self.mounts.lock().expect("mount table poisoned");
            if !mounts.insert(path.clone()) {
                return Err(ProxyError::MountExists(path));
            }
        }
        debug!("[rtsp-proxy] mount {path}: {launch}");
        self.tx
            .send(Command::Mount { path: path.clone(), launch })
            .map_err(|_| {
                self.mounts.lock().expect("mount table poisoned").remove(&path);
                ProxyError::NotRunning
            })
    }

    /// Remove a mount. Idempotent; returns whether the mount was registered.
    ///
    /// The mount object itself is freed on the event-loop thread so client
    /// sessions in teardown are not raced.
    pub fn remove_mount(&self, path: &str) -> bool {
        let path = normalize(path);
        let was_present = self.mounts.lock().expect("mount table poisoned").remove(&path);
        if was_present {
            let _ = self.tx.send(Command::Unmount { path });
        }
        was_present
    }

    /// Stop the event loop and join its thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.tx.send(Command::Quit);
            let _ = handle.join();
            self.mounts.lock().expect("mount table poisoned").clear();
            info!("RTSP proxy stopped");
        }
    }
}

impl Drop for RtspProxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Factory launch for the relay variant: no re-encode, TCP to the backend.
fn relay_launch(upstream: &str) -> String {
    format!(
        "rtspsrc location={upstream} protocols=tcp latency=200 \
         ! rtph264depay ! h264parse config-interval=-1 \
         ! rtph264pay name=pay0 pt=96"
    )
}

/// Factory launch for the re-encode variant at a chosen H.264 profile.
fn reencode_launch(channel: &str, bitrate: u32, speed_preset: &str) -> String {
    format!(
        "intervideosrc channel={channel} ! videoconvert \
         ! x264enc tune=zerolatency bitrate={bitrate} speed-preset={speed_preset} \
         ! h264parse ! rtph264pay name=pay0 pt=96"
    )
}

/// Mount paths are stored with a leading slash, the form the RTSP mount
/// table expects.
fn normalize(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn serve_loop(port: u16, rx: Receiver<Command>, ready_tx: mpsc::Sender<Result<(), String>>) {
    // GLib main context on this thread; every mount mutation happens here.
    let ctx = MainContext::default();
    let _guard = match ctx.acquire() {
        Ok(guard) => guard,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("failed to acquire GLib context: {e}")));
            return;
        }
    };
    let main_loop = MainLoop::new(Some(&ctx), false);

    let server = RTSPServer::new();
    server.set_service(&port.to_string());

    let mounts = match server.mount_points() {
        Some(m) => m,
        None => {
            let _ = ready_tx.send(Err("server has no mount points".into()));
            return;
        }
    };

    // Binding happens on attach; report the outcome to the caller.
    if let Err(e) = server.attach(Some(&ctx)) {
        let _ = ready_tx.send(Err(e.to_string()));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    // Poll the command queue from inside the loop so add/remove/stop are
    // serialised with client session handling.
    let loop_handle = main_loop.clone();
    glib::timeout_add_local(Duration::from_millis(50), move || {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Mount { path, launch } => {
                    let factory = RTSPMediaFactory::new();
                    factory.set_launch(&launch);
                    // One upstream pipeline shared by every client on the mount.
                    factory.set_shared(true);
                    mounts.add_factory(&path, factory);
                    info!("[rtsp-proxy] serving {path}");
                }
                Command::Unmount { path } => {
                    mounts.remove_factory(&path);
                    info!("[rtsp-proxy] removed {path}");
                }
                Command::Quit => {
                    loop_handle.quit();
                    return ControlFlow::Break;
                }
            }
        }
        ControlFlow::Continue
    });

    main_loop.run();
    debug!("[rtsp-proxy] event loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_adds_leading_slash() {
        assert_eq!(normalize("cam/front"), "/cam/front");
        assert_eq!(normalize("/cam/front"), "/cam/front");
    }

    #[test]
    fn relay_launch_forces_tcp_and_skips_encoding() {
        let launch = relay_launch("rtsp://10.0.0.5:554/stream");
        assert!(launch.contains("location=rtsp://10.0.0.5:554/stream"));
        assert!(launch.contains("protocols=tcp"));
        assert!(launch.contains("rtph264pay name=pay0"));
        assert!(!launch.contains("x264enc"));
    }

    #[test]
    fn reencode_launch_applies_profile() {
        let launch = reencode_launch("front", 3000, "superfast");
        assert!(launch.contains("intervideosrc channel=front"));
        assert!(launch.contains("bitrate=3000"));
        assert!(launch.contains("speed-preset=superfast"));
    }
}
