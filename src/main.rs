//! UVC MJPEG server CLI application

// Use jemalloc for better memory management (optional feature)
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};
use uvc_mjpeg_server::config::{CameraConfig, Config};
use uvc_mjpeg_server::hub::CameraHub;
use uvc_mjpeg_server::session::{ModeSelection, SessionError, SessionStats};
use uvc_mjpeg_server::source::{FrameSource, ReplaySource};

/// How often and how long to wait for a pending camera permission
const PERMISSION_RETRIES: u32 = 10;
const PERMISSION_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "uvc-mjpeg-server")]
#[command(about = "Stream UVC cameras to any number of browsers as MJPEG over HTTP")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the base port
    #[arg(short, long)]
    port: Option<u16>,

    /// Replay the JPEG files of this directory instead of capturing
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// Frame rate of the replay source
    #[arg(long, default_value_t = 30)]
    replay_fps: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("UVC MJPEG server starting");

    let mut config = if Path::new(&cli.config).exists() {
        info!(config_path = %cli.config, "Loading configuration");
        Config::load(&cli.config).with_context(|| format!("loading {}", cli.config))?
    } else {
        info!(config_path = %cli.config, "No configuration file, using defaults");
        Config::default()
    };

    if let Some(port) = cli.port {
        config.server.base_port = port;
    }
    config.validate()?;

    let source = build_source(&cli, &mut config)?;
    if config.cameras.is_empty() {
        info!("No cameras configured, exiting");
        return Ok(());
    }

    let hub = CameraHub::new(source, config.session_template());

    for cam in &config.cameras {
        if let Err(e) = start_camera(&hub, &config, cam).await {
            error!(device = %cam.device, error = %e, "Camera failed to start");
        }
    }

    if hub.is_empty() {
        bail!("no camera could be started");
    }

    for info in hub.sessions() {
        info!(device = %info.device, url = %format!("http://{}:{}/", config.server.bind_ip, info.port), "Streaming");
    }

    info!("Streaming started, press Ctrl+C to stop");
    run_until_ctrl_c(&hub, config.stats_interval_seconds).await?;

    info!("Shutting down");
    hub.stop_all();

    Ok(())
}

fn build_source(cli: &Cli, config: &mut Config) -> Result<Arc<dyn FrameSource>> {
    if let Some(dir) = &cli.frames_dir {
        let source = ReplaySource::from_dir(dir, cli.replay_fps)
            .with_context(|| format!("loading frames from {}", dir.display()))?;
        if config.cameras.is_empty() {
            let mode = source.mode();
            let mut cam = CameraConfig::new("replay");
            cam.width = mode.width;
            cam.height = mode.height;
            cam.fps = mode.fps;
            config.cameras.push(cam);
        }
        return Ok(Arc::new(source));
    }

    #[cfg(feature = "gstreamer")]
    {
        let source = uvc_mjpeg_server::source::GstSource::new()?;
        if config.cameras.is_empty() {
            for device in source.devices() {
                info!(device = %device, "Found camera");
                config.cameras.push(CameraConfig::new(device));
            }
        }
        Ok(Arc::new(source))
    }

    #[cfg(not(feature = "gstreamer"))]
    bail!("no frame source available: pass --frames-dir or build with the `gstreamer` feature");
}

async fn start_camera(hub: &CameraHub, config: &Config, cam: &CameraConfig) -> Result<()> {
    let tuned = config.session_for(cam);
    let mut attempts = 0;
    let port = loop {
        match hub.select_with(&cam.device, cam.port, |session| {
            session.buffer_count = tuned.buffer_count;
            session.bandwidth = tuned.bandwidth;
        }) {
            Ok(port) => break port,
            Err(SessionError::PermissionPending(_)) if attempts < PERMISSION_RETRIES => {
                attempts += 1;
                warn!(device = %cam.device, attempts, "Waiting for camera permission");
                tokio::time::sleep(PERMISSION_RETRY_DELAY).await;
            }
            Err(e) => {
                hub.close(&cam.device);
                return Err(e.into());
            }
        }
    };

    let addr = match hub.start(&cam.device, cam.mode_selection()) {
        Err(SessionError::InvalidSelection { .. }) => {
            warn!(
                device = %cam.device,
                requested = %format!("{}x{}@{}", cam.width, cam.height, cam.fps),
                "Requested mode not available, using the first MJPEG mode"
            );
            hub.start(&cam.device, ModeSelection::First)
        }
        other => other,
    };
    let addr = match addr {
        Ok(addr) => addr,
        Err(e) => {
            hub.close(&cam.device);
            return Err(e.into());
        }
    };
    info!(device = %cam.device, port, addr = %addr, "Camera started");

    if let Some(exposure) = cam.exposure {
        match hub.with_session(&cam.device, |s| s.set_exposure(exposure)) {
            Some(Ok(())) => info!(device = %cam.device, exposure, "Exposure set"),
            Some(Err(e)) => warn!(device = %cam.device, error = %e, "Failed to set exposure"),
            None => {}
        }
    }

    Ok(())
}

async fn run_until_ctrl_c(hub: &CameraHub, stats_interval_seconds: u64) -> Result<()> {
    if stats_interval_seconds == 0 {
        tokio::signal::ctrl_c().await?;
        return Ok(());
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval_seconds));
    ticker.tick().await;

    let mut previous: HashMap<String, SessionStats> = HashMap::new();
    let mut last = Instant::now();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(());
            }
            _ = ticker.tick() => {
                let elapsed = last.elapsed().as_secs_f64();
                last = Instant::now();

                for (device, stats) in hub.stats() {
                    let prev = previous.get(&device).cloned().unwrap_or(SessionStats {
                        ingest: Default::default(),
                        server: Default::default(),
                    });
                    info!(
                        device = %device,
                        published = %stats.ingest.frames_published,
                        sent = %stats.server.frames_sent,
                        clients = %stats.server.clients_active,
                        ingest_fps = %format!("{:.1}", stats.ingest.calculate_fps(&prev.ingest, elapsed)),
                        send_fps = %format!("{:.1}", stats.server.calculate_fps(&prev.server, elapsed)),
                        kbps = %format!("{:.0}", stats.server.calculate_bitrate_kbps(&prev.server, elapsed)),
                        "Stats"
                    );
                    previous.insert(device, stats);
                }
            }
        }
    }
}
