use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{EncodingMode, StreamConfig};
use crate::mjpeg::MjpegConfig;
use crate::rtsp::PublisherConfig;

const DEFAULT_DEVICE: &str = "stub://camera";
const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_WARMUP_MS: u64 = 2000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RTSP_URL: &str = "rtsp://localhost:8554/cam";
const DEFAULT_MUXER: &str = "ffmpeg";
const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    device: Option<String>,
    mjpeg: Option<MjpegConfigFile>,
    rtsp: Option<RtspConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MjpegConfigFile {
    bind: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f32>,
    quality: Option<u8>,
    warmup_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RtspConfigFile {
    url: Option<String>,
    muxer: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<f32>,
    bitrate: Option<u32>,
    terminate_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `stub://<name>` or a V4L2 device node.
    pub device: String,
    pub mjpeg: MjpegSettings,
    pub rtsp: RtspSettings,
}

#[derive(Debug, Clone)]
pub struct MjpegSettings {
    pub bind: String,
    pub stream: StreamConfig,
    /// Sensor settle time between camera start and the first request.
    pub warmup: Duration,
    pub write_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RtspSettings {
    pub url: String,
    pub muxer: String,
    pub stream: StreamConfig,
    pub terminate_timeout: Duration,
}

impl RelayConfig {
    /// Load from `path`, or from `PICAM_CONFIG` when no path is given, then
    /// apply environment overrides. Values are not range-checked here: callers
    /// apply their own overrides and validate the section they use.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("PICAM_CONFIG").ok().map(PathBuf::from));
        let file_cfg = match path.as_deref() {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        let mjpeg_file = file.mjpeg.unwrap_or_default();
        let rtsp_file = file.rtsp.unwrap_or_default();
        let mjpeg_default = StreamConfig::mjpeg_default();
        let rtsp_default = StreamConfig::rtsp_default();

        let mjpeg = MjpegSettings {
            bind: mjpeg_file.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            stream: StreamConfig {
                width: mjpeg_file.width.unwrap_or(mjpeg_default.width),
                height: mjpeg_file.height.unwrap_or(mjpeg_default.height),
                frame_rate: mjpeg_file.fps.unwrap_or(mjpeg_default.frame_rate),
                quality: mjpeg_file.quality.unwrap_or(mjpeg_default.quality),
                bitrate: 0,
            },
            warmup: Duration::from_millis(mjpeg_file.warmup_ms.unwrap_or(DEFAULT_WARMUP_MS)),
            write_timeout: Duration::from_millis(
                mjpeg_file
                    .write_timeout_ms
                    .unwrap_or(DEFAULT_WRITE_TIMEOUT_MS),
            ),
        };
        let rtsp = RtspSettings {
            url: rtsp_file
                .url
                .unwrap_or_else(|| DEFAULT_RTSP_URL.to_string()),
            muxer: rtsp_file.muxer.unwrap_or_else(|| DEFAULT_MUXER.to_string()),
            stream: StreamConfig {
                width: rtsp_file.width.unwrap_or(rtsp_default.width),
                height: rtsp_file.height.unwrap_or(rtsp_default.height),
                frame_rate: rtsp_file.fps.unwrap_or(rtsp_default.frame_rate),
                quality: 0,
                bitrate: rtsp_file.bitrate.unwrap_or(rtsp_default.bitrate),
            },
            terminate_timeout: Duration::from_millis(
                rtsp_file
                    .terminate_timeout_ms
                    .unwrap_or(DEFAULT_TERMINATE_TIMEOUT_MS),
            ),
        };
        Self {
            device: file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            mjpeg,
            rtsp,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("PICAM_DEVICE") {
            if !device.trim().is_empty() {
                self.device = device;
            }
        }
        if let Ok(bind) = std::env::var("PICAM_BIND") {
            if !bind.trim().is_empty() {
                self.mjpeg.bind = bind;
            }
        }
        if let Ok(url) = std::env::var("PICAM_RTSP_URL") {
            if !url.trim().is_empty() {
                self.rtsp.url = url;
            }
        }
        if let Ok(muxer) = std::env::var("PICAM_FFMPEG") {
            if !muxer.trim().is_empty() {
                self.rtsp.muxer = muxer;
            }
        }
        if let Ok(warmup) = std::env::var("PICAM_WARMUP_MS") {
            let millis: u64 = warmup
                .parse()
                .map_err(|_| anyhow!("PICAM_WARMUP_MS must be an integer number of milliseconds"))?;
            self.mjpeg.warmup = Duration::from_millis(millis);
        }
        Ok(())
    }

    /// Check both sections.
    pub fn validate(&self) -> Result<()> {
        self.validate_mjpeg()?;
        self.validate_rtsp()
    }

    /// Check what `mjpeg_server` uses: device, bind address, still envelope.
    pub fn validate_mjpeg(&self) -> Result<()> {
        self.validate_device()?;
        self.mjpeg
            .bind
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid mjpeg bind address {}: {}", self.mjpeg.bind, e))?;
        self.mjpeg
            .stream
            .validate(EncodingMode::Still)
            .context("invalid [mjpeg] stream")?;
        if self.mjpeg.write_timeout.is_zero() {
            return Err(anyhow!("mjpeg write timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Check what `rtsp_publisher` uses: device, url, muxer, H.264 envelope.
    pub fn validate_rtsp(&self) -> Result<()> {
        self.validate_device()?;
        if !(self.rtsp.url.starts_with("rtsp://") || self.rtsp.url.starts_with("rtsps://")) {
            return Err(anyhow!("rtsp url must start with rtsp:// or rtsps://, got {}", self.rtsp.url));
        }
        if self.rtsp.muxer.trim().is_empty() {
            return Err(anyhow!("rtsp muxer must not be empty"));
        }
        self.rtsp
            .stream
            .validate(EncodingMode::Continuous)
            .context("invalid [rtsp] stream")?;
        if self.rtsp.terminate_timeout.is_zero() {
            return Err(anyhow!("rtsp terminate timeout must be greater than zero"));
        }
        Ok(())
    }

    fn validate_device(&self) -> Result<()> {
        if self.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        Ok(())
    }

    pub fn mjpeg_config(&self) -> MjpegConfig {
        MjpegConfig {
            addr: self.mjpeg.bind.clone(),
            write_timeout: self.mjpeg.write_timeout,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            stream: self.rtsp.stream,
            url: self.rtsp.url.clone(),
            muxer: self.rtsp.muxer.clone(),
            terminate_timeout: self.rtsp.terminate_timeout,
        }
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RelayConfig::from_file(RelayConfigFile::default());
        assert_eq!(cfg.device, "stub://camera");
        assert_eq!(cfg.mjpeg.bind, "0.0.0.0:8000");
        assert_eq!(cfg.mjpeg.stream, StreamConfig::mjpeg_default());
        assert_eq!(cfg.mjpeg.warmup, Duration::from_secs(2));
        assert_eq!(cfg.rtsp.url, "rtsp://localhost:8554/cam");
        assert_eq!(cfg.rtsp.muxer, "ffmpeg");
        assert_eq!(cfg.rtsp.stream, StreamConfig::rtsp_default());
        assert_eq!(cfg.rtsp.terminate_timeout, Duration::from_secs(5));
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_sections_fill_from_defaults() {
        let file: RelayConfigFile = toml::from_str(
            r#"
            [mjpeg]
            quality = 90

            [rtsp]
            bitrate = 2000000
            "#,
        )
        .unwrap();
        let cfg = RelayConfig::from_file(file);
        assert_eq!(cfg.mjpeg.stream.quality, 90);
        assert_eq!(cfg.mjpeg.stream.width, 640);
        assert_eq!(cfg.rtsp.stream.bitrate, 2_000_000);
        assert_eq!(cfg.rtsp.stream.width, 1280);
    }

    #[test]
    fn validation_rejects_bad_endpoints() {
        let mut cfg = RelayConfig::from_file(RelayConfigFile::default());
        cfg.mjpeg.bind = "not-an-address".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::from_file(RelayConfigFile::default());
        cfg.rtsp.url = "http://localhost/cam".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::from_file(RelayConfigFile::default());
        cfg.rtsp.stream.bitrate = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sections_validate_independently() {
        let mut cfg = RelayConfig::from_file(RelayConfigFile::default());
        cfg.rtsp.url = "http://localhost/cam".to_string();
        cfg.validate_mjpeg().unwrap();
        assert!(cfg.validate_rtsp().is_err());

        let mut cfg = RelayConfig::from_file(RelayConfigFile::default());
        cfg.mjpeg.stream.quality = 0;
        cfg.validate_rtsp().unwrap();
        assert!(cfg.validate_mjpeg().is_err());

        cfg.device = " ".to_string();
        assert!(cfg.validate_rtsp().is_err());
    }
}
