//! mjpeg_server - browser MJPEG stream for the camera
//!
//! This daemon:
//! 1. Opens and configures the camera for still (JPEG) capture
//! 2. Waits for the sensor to settle
//! 3. Serves `/`, `/video_feed` and `/health` until SIGINT/SIGTERM
//! 4. Stops the server, then the camera

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use picam_relay::{
    Camera, EncodingMode, MjpegServer, RelayConfig, ShutdownGuard, ShutdownReason, Supervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve the camera as an MJPEG stream over HTTP")]
struct Args {
    /// TOML config file.
    #[arg(long, env = "PICAM_CONFIG")]
    config: Option<PathBuf>,
    /// Camera device (`stub://<name>` or a V4L2 node such as /dev/video0).
    #[arg(long)]
    device: Option<String>,
    /// Listen address.
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<f32>,
    /// JPEG quality, 1-100.
    #[arg(long)]
    quality: Option<u8>,
    /// Sensor warm-up before serving, in milliseconds.
    #[arg(long)]
    warmup_ms: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let reason = run(args)?;
    if reason.exit_code() != 0 {
        log::error!("mjpeg_server exiting: {}", reason);
        std::process::exit(reason.exit_code());
    }
    Ok(())
}

fn run(args: Args) -> Result<ShutdownReason> {
    let mut cfg = RelayConfig::load(args.config.as_deref())?;
    if let Some(device) = args.device {
        cfg.device = device;
    }
    if let Some(bind) = args.bind {
        cfg.mjpeg.bind = bind;
    }
    if let Some(width) = args.width {
        cfg.mjpeg.stream.width = width;
    }
    if let Some(height) = args.height {
        cfg.mjpeg.stream.height = height;
    }
    if let Some(fps) = args.fps {
        cfg.mjpeg.stream.frame_rate = fps;
    }
    if let Some(quality) = args.quality {
        cfg.mjpeg.stream.quality = quality;
    }
    if let Some(warmup_ms) = args.warmup_ms {
        cfg.mjpeg.warmup = Duration::from_millis(warmup_ms);
    }
    cfg.validate_mjpeg()?;

    let supervisor = Supervisor::new();
    supervisor.install_signal_handlers()?;

    let camera = Camera::open(&cfg.device)?;
    let teardown = ShutdownGuard::new();
    let result = serve(&cfg, &camera, &supervisor, &teardown);
    // Startup errors leave the camera running; stop it here.
    teardown.run_once(|| camera.stop());
    result
}

fn serve(
    cfg: &RelayConfig,
    camera: &Camera,
    supervisor: &Supervisor,
    teardown: &ShutdownGuard,
) -> Result<ShutdownReason> {
    camera.configure(cfg.mjpeg.stream, EncodingMode::Still)?;
    camera.start()?;

    if !cfg.mjpeg.warmup.is_zero() {
        log::info!("Camera: warming up for {:?}", cfg.mjpeg.warmup);
        if let Some(reason) = supervisor.wait_timeout(cfg.mjpeg.warmup) {
            log::info!("mjpeg_server: {} during warm-up", reason);
            return Ok(reason);
        }
    }

    let server = MjpegServer::new(cfg.mjpeg_config(), camera.clone(), cfg.mjpeg.stream).spawn()?;
    log::info!(
        "mjpeg_server running. open http://{}/ in a browser (Ctrl-C to stop)",
        server.addr
    );

    let reason = supervisor.wait();
    log::info!("mjpeg_server: {}, stopping", reason);
    teardown
        .run_once(|| -> Result<()> {
            server.stop()?;
            camera.stop();
            Ok(())
        })
        .transpose()?;
    Ok(reason)
}
