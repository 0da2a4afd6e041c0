//! HTTP control plane.
//!
//! Thread-based server: one shared accept queue drained by a small fixed
//! worker pool, no async runtime. Endpoints take form-encoded parameters
//! (query string or body) and answer with plain text or JSON per route.
//! Bad input never panics; every internal error is rendered as a status
//! code plus a diagnostic body.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{info, warn};
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};
use url::form_urlencoded;

use crate::camera::region::RegionRect;
use crate::camera::CameraDefinition;
use crate::error::NvrError;
use crate::manager::CameraManager;
use crate::settings::Settings;

const WORKER_THREADS: usize = 4;
const MAX_BODY_BYTES: u64 = 64 * 1024;

pub struct HttpContext {
    pub manager: Arc<CameraManager>,
    pub settings: Arc<Settings>,
    pub shutdown: Arc<AtomicBool>,
    pub http_port: u16,
    pub started_at: Instant,
    /// Per-request access logging, toggled at runtime.
    pub http_logging: AtomicBool,
}

pub struct HttpServer {
    workers: Vec<thread::JoinHandle<()>>,
}

impl HttpServer {
    /// Workers exit on their next accept timeout once the shutdown flag is
    /// up; this joins them.
    pub fn join(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

/// Bind the listener and spawn the worker pool. A port-bind failure is
/// fatal for the process and surfaces here.
pub fn serve(ctx: Arc<HttpContext>) -> Result<HttpServer> {
    let server = Server::http(("0.0.0.0", ctx.http_port))
        .map_err(|e| anyhow!("failed to bind HTTP port {}: {e}", ctx.http_port))?;
    let server = Arc::new(server);

    let workers = (0..WORKER_THREADS)
        .map(|i| {
            let server = Arc::clone(&server);
            let ctx = Arc::clone(&ctx);
            thread::Builder::new()
                .name(format!("http-{i}"))
                .spawn(move || worker_loop(&server, &ctx))
                .map_err(|e| anyhow!("spawn http worker: {e}"))
        })
        .collect::<Result<Vec<_>>>()?;

    info!("HTTP server started on port {}", ctx.http_port);
    Ok(HttpServer { workers })
}

fn worker_loop(server: &Server, ctx: &HttpContext) {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match server.recv_timeout(Duration::from_millis(250)) {
            Ok(Some(request)) => handle(request, ctx),
            Ok(None) => {}
            Err(e) => {
                if !ctx.shutdown.load(Ordering::SeqCst) {
                    warn!("http accept error: {e}");
                }
            }
        }
    }
}

enum Reply {
    Text(u16, String),
    Json(u16, serde_json::Value),
    Jpeg(Vec<u8>),
    Empty(u16),
}

fn handle(mut request: Request, ctx: &HttpContext) {
    let method = request.method().clone();
    let path = request.url().split('?').next().unwrap_or("/").to_string();
    let params = read_params(&mut request);

    let reply = dispatch(&method, &path, &params, ctx);
    let status = match &reply {
        Reply::Text(status, _) | Reply::Json(status, _) | Reply::Empty(status) => *status,
        Reply::Jpeg(_) => 200,
    };
    if ctx.http_logging.load(Ordering::SeqCst) {
        info!("[HTTP] {method} {path} -> {status}");
    }

    let outcome = match reply {
        Reply::Text(status, body) => request.respond(
            Response::from_string(body)
                .with_status_code(status)
                .with_header(content_type("text/plain")),
        ),
        Reply::Json(status, value) => request.respond(
            Response::from_string(value.to_string())
                .with_status_code(status)
                .with_header(content_type("application/json")),
        ),
        Reply::Jpeg(bytes) => {
            request.respond(Response::from_data(bytes).with_header(content_type("image/jpeg")))
        }
        Reply::Empty(status) => request.respond(Response::empty(status)),
    };
    if let Err(e) = outcome {
        warn!("http response failed: {e}");
    }
}

fn content_type(value: &str) -> Header {
    // Static names and values; construction cannot fail.
    Header::from_bytes(&b"Content-Type"[..], value.as_bytes()).expect("static header")
}

/// Merge query-string and form-body parameters; the body wins.
fn read_params(request: &mut Request) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some((_, query)) = request.url().split_once('?') {
        for (k, v) in form_urlencoded::parse(query.as_bytes()).into_owned() {
            params.insert(k, v);
        }
    }
    let mut body = String::new();
    let _ = request.as_reader().take(MAX_BODY_BYTES).read_to_string(&mut body);
    for (k, v) in form_urlencoded::parse(body.as_bytes()).into_owned() {
        params.insert(k, v);
    }
    params
}

fn truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "on")
}

fn param_bool(params: &HashMap<String, String>, key: &str) -> bool {
    params.get(key).map(|v| truthy(v)).unwrap_or(false)
}

/// `WxH` (also `,` or `:` separated) into a size pair.
fn parse_frame_size(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once(['x', ',', ':'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Parse an optional numeric parameter; a present-but-garbled value is a
/// caller error, not a silent default.
fn param_num<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, Reply> {
    match params.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Reply::Text(400, format!("Invalid numeric parameter: {key}\n"))),
    }
}

fn error_reply(e: NvrError) -> Reply {
    match e {
        NvrError::InvalidInput(_) | NvrError::Conflict(_) => Reply::Text(400, format!("{e}\n")),
        NvrError::NotFound(_) => Reply::Text(404, format!("{e}\n")),
        other => Reply::Text(500, format!("{other}\n")),
    }
}

fn dispatch(
    method: &Method,
    path: &str,
    params: &HashMap<String, String>,
    ctx: &HttpContext,
) -> Reply {
    match (method, path) {
        (&Method::Get, "/health") => health(ctx),
        (&Method::Post, "/toggle_logging") => toggle_logging(params, ctx),
        (&Method::Post, "/shutdown") => shutdown(ctx),
        (&Method::Get, "/get_cameras") => Reply::Json(200, ctx.manager.info_snapshot()),
        (&Method::Post, "/add_camera") => add_camera(params, ctx),
        (&Method::Post, "/remove_camera") => remove_camera(params, ctx),
        (&Method::Post, "/toggle_motion") => toggle_motion(params, ctx),
        (&Method::Post, "/record_on") => record_on(params, ctx),
        (&Method::Post, "/record_off") => {
            simple_toggle(params, ctx, "Full recording OFF\n", |cam| cam.set_recording(None))
        }
        (&Method::Post, "/overlay_on") => {
            simple_toggle(params, ctx, "Overlay ON\n", |cam| cam.set_overlay(true))
        }
        (&Method::Post, "/overlay_off") => {
            simple_toggle(params, ctx, "Overlay OFF\n", |cam| cam.set_overlay(false))
        }
        (&Method::Post, "/motion_on") => {
            simple_toggle(params, ctx, "Motion frame saving ON\n", |cam| {
                cam.set_motion_frame(true)
            })
        }
        (&Method::Post, "/motion_off") => {
            simple_toggle(params, ctx, "Motion frame saving OFF\n", |cam| {
                cam.set_motion_frame(false)
            })
        }
        (&Method::Get, "/motion_frame") => motion_frame(params, ctx),
        (&Method::Post, "/add_motion_region") => add_motion_region(params, ctx),
        (&Method::Post, "/remove_motion_region") => remove_motion_region(params, ctx),
        (&Method::Post, "/clear_motion_regions") => clear_motion_regions(params, ctx),
        (&Method::Get, "/favicon.ico") => Reply::Empty(204),
        _ => Reply::Text(404, "Not found\n".into()),
    }
}

fn health(ctx: &HttpContext) -> Reply {
    Reply::Json(
        200,
        json!({
            "ok": true,
            "http_port": ctx.http_port,
            "rtsp_proxy_port": ctx.settings.get().live_rtsp_proxy_port,
            "camera_count": ctx.manager.camera_count(),
            "uptime_s": ctx.started_at.elapsed().as_secs(),
        }),
    )
}

fn toggle_logging(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let enabled = match params.get("action").map(String::as_str) {
        Some("on") | Some("enable") | Some("true") | Some("1") => true,
        Some("off") | Some("disable") | Some("false") | Some("0") => false,
        _ => !ctx.http_logging.load(Ordering::SeqCst),
    };
    ctx.http_logging.store(enabled, Ordering::SeqCst);
    Reply::Json(
        200,
        json!({
            "success": true,
            "http_logging_enabled": enabled,
            "message": if enabled { "HTTP logging enabled" } else { "HTTP logging disabled" },
        }),
    )
}

fn shutdown(ctx: &HttpContext) -> Reply {
    let flag = Arc::clone(&ctx.shutdown);
    // Flip the flag after the response has gone out.
    let spawned = thread::Builder::new().name("shutdown".into()).spawn(move || {
        thread::sleep(Duration::from_millis(100));
        flag.store(true, Ordering::SeqCst);
    });
    if spawned.is_err() {
        ctx.shutdown.store(true, Ordering::SeqCst);
    }
    Reply::Json(200, json!({ "success": true, "message": "Server shutdown initiated" }))
}

fn add_camera(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let Some(name) = params.get("name") else {
        return Reply::Text(400, "Missing required parameter: name\n".into());
    };
    let Some(uri) = params.get("uri") else {
        return Reply::Text(400, "Missing required parameter: uri\n".into());
    };

    let settings = ctx.settings.get();
    let mut def = CameraDefinition::from_settings(name, uri, &settings);
    def.segment = param_bool(params, "segment");
    def.recording = param_bool(params, "recording");
    def.overlay = param_bool(params, "overlay");
    def.motion_frame = param_bool(params, "motion_frame");
    def.gstreamer_proxy = param_bool(params, "gstreamerEncodedProxy");
    def.live555_proxy = param_bool(params, "live555proxied") || param_bool(params, "live555proxy");

    macro_rules! numeric {
        ($field:ident, $key:literal) => {
            match param_num(params, $key) {
                Ok(Some(v)) => def.$field = v,
                Ok(None) => {}
                Err(reply) => return reply,
            }
        };
    }
    numeric!(segment_bitrate, "segment_bitrate");
    numeric!(proxy_bitrate, "proxy_bitrate");
    numeric!(motion_frame_scale, "motion_frame_scale");
    numeric!(noise_threshold, "noise_threshold");
    numeric!(motion_threshold, "motion_threshold");
    numeric!(motion_min_hits, "motion_min_hits");
    numeric!(motion_decay, "motion_decay");
    numeric!(motion_arrow_scale, "motion_arrow_scale");
    numeric!(motion_arrow_thickness, "motion_arrow_thickness");

    if let Some(preset) = params.get("segment_speed_preset") {
        def.segment_speed_preset = preset.clone();
    }
    if let Some(preset) = params.get("proxy_speed_preset") {
        def.proxy_speed_preset = preset.clone();
    }
    if let Some(format) = params.get("video_output_format") {
        def.video_output_format = format.clone();
    }

    if let Some(size) = params.get("motion_frame_size") {
        match parse_frame_size(size) {
            Some(pair) => def.motion_frame_size = pair,
            None => return Reply::Text(400, "Invalid motion_frame_size (expected WxH)\n".into()),
        }
    } else if params.contains_key("motion_frame_w") && params.contains_key("motion_frame_h") {
        let w = match param_num(params, "motion_frame_w") {
            Ok(v) => v.unwrap_or(0),
            Err(reply) => return reply,
        };
        let h = match param_num(params, "motion_frame_h") {
            Ok(v) => v.unwrap_or(0),
            Err(reply) => return reply,
        };
        def.motion_frame_size = (w, h);
    }

    let summary = format!(
        "Camera added (segment={}, recording={}, overlay={}, motion_frame={}, \
         gstreamerEncodedProxy={}, live555proxied={}, segment_bitrate={}, \
         segment_speed_preset={}, proxy_bitrate={}, proxy_speed_preset={}, \
         motion_frame_size={}x{}, motion_frame_scale={}, noise_threshold={}, \
         motion_threshold={}, motion_min_hits={}, motion_decay={}, \
         motion_arrow_scale={}, motion_arrow_thickness={}, video_output_format={})\n",
        def.segment,
        def.recording,
        def.overlay,
        def.motion_frame,
        def.gstreamer_proxy,
        def.live555_proxy,
        def.segment_bitrate,
        def.segment_speed_preset,
        def.proxy_bitrate,
        def.proxy_speed_preset,
        def.motion_frame_size.0,
        def.motion_frame_size.1,
        def.motion_frame_scale,
        def.noise_threshold,
        def.motion_threshold,
        def.motion_min_hits,
        def.motion_decay,
        def.motion_arrow_scale,
        def.motion_arrow_thickness,
        def.video_output_format,
    );

    match ctx.manager.add_camera(def, false) {
        Ok(()) => Reply::Text(200, summary),
        Err(e) => error_reply(e),
    }
}

fn remove_camera(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let Some(name) = params.get("name") else {
        return Reply::Text(400, "Missing required parameter: name\n".into());
    };
    match ctx.manager.remove_camera(name) {
        Ok(()) => Reply::Text(200, "Camera removed\n".into()),
        Err(e) => error_reply(e),
    }
}

fn toggle_motion(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let Some(name) = params.get("name") else {
        return Reply::Text(400, "Missing required parameter: name\n".into());
    };
    let on = match params.get("value").map(String::as_str) {
        Some("on") => true,
        Some("off") => false,
        _ => return Reply::Text(400, "Invalid value\n".into()),
    };
    let body = if on { "Motion recording ON\n" } else { "Motion recording OFF\n" };
    match ctx.manager.with_camera_mut(name, |cam| cam.set_motion_frame(on)) {
        Some(Ok(())) => Reply::Text(200, body.into()),
        Some(Err(e)) => error_reply(e),
        None => Reply::Text(404, "Camera not found\n".into()),
    }
}

fn record_on(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let Some(name) = params.get("name") else {
        return Reply::Text(400, "Missing required parameter: name\n".into());
    };
    let Some(file) = params.get("file") else {
        return Reply::Text(400, "Missing required parameter: file\n".into());
    };
    let file = file.clone();
    match ctx.manager.with_camera_mut(name, move |cam| cam.set_recording(Some(file))) {
        Some(Ok(())) => Reply::Text(200, "Full recording ON\n".into()),
        Some(Err(e)) => error_reply(e),
        None => Reply::Text(404, "Camera not found\n".into()),
    }
}

fn simple_toggle(
    params: &HashMap<String, String>,
    ctx: &HttpContext,
    body: &str,
    f: impl FnOnce(&mut crate::camera::stream::CameraStream) -> crate::error::NvrResult<()>,
) -> Reply {
    let Some(name) = params.get("name") else {
        return Reply::Text(400, "Missing required parameter: name\n".into());
    };
    match ctx.manager.with_camera_mut(name, f) {
        Some(Ok(())) => Reply::Text(200, body.into()),
        Some(Err(e)) => error_reply(e),
        None => Reply::Text(404, "Camera not found\n".into()),
    }
}

fn motion_frame(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let Some(name) = params.get("name") else {
        return Reply::Text(400, "Missing required parameter: name\n".into());
    };
    match ctx.manager.with_camera(name, |cam| cam.last_motion_jpeg()) {
        None => Reply::Text(404, "Camera not found\n".into()),
        Some(None) => Reply::Text(404, "No motion frame available\n".into()),
        Some(Some(Err(_))) => Reply::Text(500, "Failed to encode image\n".into()),
        Some(Some(Ok(bytes))) => Reply::Jpeg(bytes),
    }
}

fn add_motion_region(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    for key in ["name", "x", "y", "w", "h"] {
        if !params.contains_key(key) {
            return Reply::Text(400, "Missing required parameters: name, x, y, w, h\n".into());
        }
    }
    let name = &params["name"];
    let mut nums = [0i32; 4];
    for (slot, key) in nums.iter_mut().zip(["x", "y", "w", "h"]) {
        match params[key].parse() {
            Ok(v) => *slot = v,
            Err(_) => return Reply::Text(400, "Invalid numeric parameters\n".into()),
        }
    }
    let angle: f32 = match params.get("angle") {
        None => 0.0,
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => return Reply::Text(400, "Invalid numeric parameters\n".into()),
        },
    };

    let rect = RegionRect { x: nums[0], y: nums[1], w: nums[2], h: nums[3] };
    match ctx.manager.add_motion_region(name, rect, angle) {
        Ok(region_id) => Reply::Json(
            200,
            json!({
                "success": true,
                "region_id": region_id,
                "angle": angle,
                "message": "Motion region added successfully",
            }),
        ),
        Err(_) => Reply::Text(404, "Camera not found\n".into()),
    }
}

fn remove_motion_region(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let (Some(name), Some(raw_id)) = (params.get("name"), params.get("region_id")) else {
        return Reply::Text(400, "Missing required parameters: name, region_id\n".into());
    };
    let Ok(region_id) = raw_id.parse::<u32>() else {
        return Reply::Text(400, "Invalid region_id parameter\n".into());
    };
    match ctx.manager.remove_motion_region(name, region_id) {
        Ok(true) => Reply::Json(
            200,
            json!({ "success": true, "message": "Motion region removed successfully" }),
        ),
        Ok(false) | Err(_) => Reply::Text(404, "Camera or region not found\n".into()),
    }
}

fn clear_motion_regions(params: &HashMap<String, String>, ctx: &HttpContext) -> Reply {
    let Some(name) = params.get("name") else {
        return Reply::Text(400, "Missing required parameter: name\n".into());
    };
    ctx.manager.clear_motion_regions(name);
    Reply::Json(
        200,
        json!({ "success": true, "message": "All motion regions cleared successfully" }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        assert!(truthy("1"));
        assert!(truthy("true"));
        assert!(truthy("on"));
        assert!(!truthy("yes"));
        assert!(!truthy("0"));
        assert!(!truthy(""));
    }

    #[test]
    fn frame_size_formats() {
        assert_eq!(parse_frame_size("640x480"), Some((640, 480)));
        assert_eq!(parse_frame_size("640,480"), Some((640, 480)));
        assert_eq!(parse_frame_size("640:480"), Some((640, 480)));
        assert_eq!(parse_frame_size("640"), None);
        assert_eq!(parse_frame_size("axb"), None);
    }

    #[test]
    fn param_num_distinguishes_missing_from_garbled() {
        let mut params = HashMap::new();
        assert!(matches!(param_num::<u32>(&params, "n"), Ok(None)));
        params.insert("n".to_string(), "12".to_string());
        assert!(matches!(param_num::<u32>(&params, "n"), Ok(Some(12))));
        params.insert("n".to_string(), "twelve".to_string());
        assert!(matches!(param_num::<u32>(&params, "n"), Err(Reply::Text(400, _))));
    }
}
