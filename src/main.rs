use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use log::info;

use nvrd::http::{self, HttpContext};
use nvrd::paths;
use nvrd::{CameraManager, Settings};

/// NVR back-end: RTSP ingest, motion-triggered clip capture, RTSP
/// re-serving and an HTTP control plane.
#[derive(Parser, Debug)]
#[command(name = "nvrd")]
#[command(about = "Network video recorder back-end")]
struct Args {
    /// HTTP control-plane port (overrides settings.json)
    #[arg(long)]
    http_port: Option<u16>,

    /// Root directory for per-camera media output
    #[arg(long)]
    media_dir: Option<PathBuf>,

    /// Directory holding cameras.json and settings.json
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Enable per-request HTTP access logging from startup
    #[arg(long)]
    log_http: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let base_dir = args.config_dir.unwrap_or_else(paths::executable_dir);
    let settings = Arc::new(Settings::load(base_dir.join("settings.json")));
    let http_port = args.http_port.unwrap_or(settings.get().http_port);
    let media_root = args.media_dir.unwrap_or_else(|| base_dir.join("media"));

    // Process-wide shutdown flag; signal handlers do nothing but notify.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;
    }

    let manager = CameraManager::new(
        Arc::clone(&settings),
        base_dir.join("cameras.json"),
        media_root,
    );

    let ctx = Arc::new(HttpContext {
        manager: Arc::clone(&manager),
        settings,
        shutdown: Arc::clone(&shutdown),
        http_port,
        started_at: Instant::now(),
        http_logging: AtomicBool::new(args.log_http),
    });
    // A port-bind failure here is fatal and exits non-zero.
    let server = http::serve(ctx)?;

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down: stopping HTTP server");
    server.join();
    info!("stopping all cameras");
    manager.stop_all();
    info!("shutdown complete");
    Ok(())
}
