//! rtsp_publisher - push the camera's H.264 stream to an RTSP server
//!
//! This daemon:
//! 1. Configures the camera for continuous H.264
//! 2. Launches the muxer (ffmpeg) and pipes the encoder output into it
//! 3. Blocks until SIGINT/SIGTERM or the muxer exits
//! 4. Closes the muxer input, terminates it, stops encoder and camera

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use picam_relay::{
    Camera, ProcessLauncher, RelayConfig, RtspPublisher, ShutdownReason, Supervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish the camera as H.264 over RTSP via ffmpeg")]
struct Args {
    /// TOML config file.
    #[arg(long, env = "PICAM_CONFIG")]
    config: Option<PathBuf>,
    /// Camera device (`stub://<name>` or a V4L2 node such as /dev/video0).
    #[arg(long)]
    device: Option<String>,
    /// Destination, e.g. rtsp://localhost:8554/cam.
    #[arg(long)]
    url: Option<String>,
    /// Muxer executable.
    #[arg(long)]
    muxer: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<f32>,
    /// Encoder bitrate in bits per second.
    #[arg(long)]
    bitrate: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let reason = run(args)?;
    if reason.exit_code() != 0 {
        log::error!("rtsp_publisher exiting: {}", reason);
        std::process::exit(reason.exit_code());
    }
    Ok(())
}

fn run(args: Args) -> Result<ShutdownReason> {
    let mut cfg = RelayConfig::load(args.config.as_deref())?;
    if let Some(device) = args.device {
        cfg.device = device;
    }
    if let Some(url) = args.url {
        cfg.rtsp.url = url;
    }
    if let Some(muxer) = args.muxer {
        cfg.rtsp.muxer = muxer;
    }
    if let Some(width) = args.width {
        cfg.rtsp.stream.width = width;
    }
    if let Some(height) = args.height {
        cfg.rtsp.stream.height = height;
    }
    if let Some(fps) = args.fps {
        cfg.rtsp.stream.frame_rate = fps;
    }
    if let Some(bitrate) = args.bitrate {
        cfg.rtsp.stream.bitrate = bitrate;
    }
    cfg.validate_rtsp()?;

    let supervisor = Supervisor::new();
    supervisor.install_signal_handlers()?;

    let camera = Camera::open(&cfg.device)?;
    let publisher = RtspPublisher::new(cfg.publisher_config(), camera, Box::new(ProcessLauncher));
    publisher.publish()?;
    if let Some(sink) = publisher.sink() {
        supervisor.watch_sink(sink)?;
    }
    log::info!("rtsp_publisher running. streaming to {} (Ctrl-C to stop)", cfg.rtsp.url);

    let reason = supervisor.wait();
    log::info!("rtsp_publisher: {}, stopping", reason);
    let report = publisher.shutdown();
    if let Some(fault) = report.encoder.as_ref().and_then(|encoder| encoder.fault.as_deref()) {
        log::debug!("rtsp_publisher: encoder ended with: {}", fault);
    }
    Ok(reason)
}
