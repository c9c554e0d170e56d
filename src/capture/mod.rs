//! Camera capture source.
//!
//! `Camera` is the process-wide capture handle. It wraps one backend:
//! - `stub://<name>`: synthetic sensor producing real JPEG stills and an
//!   Annex-B H.264 elementary stream (tests, development hosts)
//! - a device node such as `/dev/video0` (feature: capture-v4l2)
//!
//! The handle is cheap to clone; every clone talks to the same session. All
//! backend access goes through one mutex, so a capture and the bytes it writes
//! into the caller's buffer are atomic with respect to every other caller, and
//! `stop()` always happens-after the last in-flight capture.
//!
//! The capture layer MUST NOT:
//! - Hand out references into backend-owned buffers
//! - Restart a session after `stop()`

mod encoder;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
mod v4l2;

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::CaptureError;
use crate::frame::FrameBuffer;

pub use encoder::{Encoder, EncoderReport};
pub use synthetic::SyntheticFaults;

use synthetic::SyntheticCamera;
#[cfg(feature = "capture-v4l2")]
use v4l2::DeviceCamera;

pub const MIN_DIMENSION: u32 = 32;
pub const MAX_WIDTH: u32 = 4096;
pub const MAX_HEIGHT: u32 = 3072;
pub const MAX_FRAME_RATE: f32 = 120.0;
/// The H.264 block tops out at 1080p.
pub const MAX_ENCODER_WIDTH: u32 = 1920;
pub const MAX_ENCODER_HEIGHT: u32 = 1080;
pub const MIN_BITRATE: u32 = 64_000;
pub const MAX_BITRATE: u32 = 25_000_000;

/// What the sensor pipeline produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncodingMode {
    /// One JPEG per `capture_frame` call.
    Still,
    /// Unbounded H.264 elementary stream via `start_encoder`.
    Continuous,
}

impl fmt::Display for EncodingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodingMode::Still => f.write_str("still"),
            EncodingMode::Continuous => f.write_str("continuous"),
        }
    }
}

/// Requested stream geometry and encoder settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    /// Target frames per second.
    pub frame_rate: f32,
    /// JPEG quality (1..=100), used in still mode.
    pub quality: u8,
    /// Encoder bitrate in bits per second, used in continuous mode.
    pub bitrate: u32,
}

impl StreamConfig {
    /// Defaults for the browser (MJPEG) path.
    pub fn mjpeg_default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 25.0,
            quality: 75,
            bitrate: 0,
        }
    }

    /// Defaults for the RTSP (H.264) path.
    pub fn rtsp_default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 25.0,
            quality: 0,
            bitrate: 4_000_000,
        }
    }

    /// Check the request against the supported envelope for `mode`.
    pub fn validate(&self, mode: EncodingMode) -> Result<(), CaptureError> {
        if self.width < MIN_DIMENSION || self.width > MAX_WIDTH {
            return Err(CaptureError::Configuration(format!(
                "width {} outside {}..={}",
                self.width, MIN_DIMENSION, MAX_WIDTH
            )));
        }
        if self.height < MIN_DIMENSION || self.height > MAX_HEIGHT {
            return Err(CaptureError::Configuration(format!(
                "height {} outside {}..={}",
                self.height, MIN_DIMENSION, MAX_HEIGHT
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CaptureError::Configuration(format!(
                "resolution {}x{} must have even dimensions",
                self.width, self.height
            )));
        }
        if !self.frame_rate.is_finite() || self.frame_rate <= 0.0 || self.frame_rate > MAX_FRAME_RATE
        {
            return Err(CaptureError::Configuration(format!(
                "frame rate {} outside (0, {}]",
                self.frame_rate, MAX_FRAME_RATE
            )));
        }
        match mode {
            EncodingMode::Still => {
                if self.quality == 0 || self.quality > 100 {
                    return Err(CaptureError::Configuration(format!(
                        "jpeg quality {} outside 1..=100",
                        self.quality
                    )));
                }
            }
            EncodingMode::Continuous => {
                if self.width > MAX_ENCODER_WIDTH || self.height > MAX_ENCODER_HEIGHT {
                    return Err(CaptureError::Configuration(format!(
                        "h264 encoder supports at most {}x{}, requested {}x{}",
                        MAX_ENCODER_WIDTH, MAX_ENCODER_HEIGHT, self.width, self.height
                    )));
                }
                if self.bitrate < MIN_BITRATE || self.bitrate > MAX_BITRATE {
                    return Err(CaptureError::Configuration(format!(
                        "bitrate {} outside {}..={}",
                        self.bitrate, MIN_BITRATE, MAX_BITRATE
                    )));
                }
            }
        }
        Ok(())
    }

    /// Time between two frames at the target rate.
    pub fn frame_interval(&self) -> Duration {
        if self.frame_rate <= 0.0 {
            return Duration::from_millis(0);
        }
        Duration::from_secs_f64(1.0 / self.frame_rate as f64)
    }
}

/// Counters for the capture session.
#[derive(Clone, Debug)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub chunks_encoded: u64,
    pub device: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Opened,
    Configured,
    Streaming,
    Stopped,
}

struct CameraState {
    device: String,
    backend: CameraBackend,
    phase: Phase,
    config: Option<(StreamConfig, EncodingMode)>,
    frames_captured: u64,
    chunks_encoded: u64,
}

enum CameraBackend {
    Synthetic(SyntheticCamera),
    #[cfg(feature = "capture-v4l2")]
    Device(DeviceCamera),
}

impl CameraBackend {
    fn configure(&mut self, config: &StreamConfig, mode: EncodingMode) -> Result<(), CaptureError> {
        match self {
            CameraBackend::Synthetic(camera) => camera.configure(config, mode),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::Device(camera) => camera.configure(config, mode),
        }
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        match self {
            CameraBackend::Synthetic(camera) => camera.start(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::Device(camera) => camera.start(),
        }
    }

    fn capture_still(&mut self, quality: u8, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        match self {
            CameraBackend::Synthetic(camera) => camera.capture_still(quality, out),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::Device(camera) => camera.capture_still(quality, out),
        }
    }

    fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CaptureError> {
        match self {
            CameraBackend::Synthetic(camera) => camera.set_bitrate(bitrate),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::Device(camera) => camera.set_bitrate(bitrate),
        }
    }

    fn read_chunk(&mut self, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        match self {
            CameraBackend::Synthetic(camera) => camera.read_chunk(out),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::Device(camera) => camera.read_chunk(out),
        }
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        match self {
            CameraBackend::Synthetic(camera) => camera.stop(),
            #[cfg(feature = "capture-v4l2")]
            CameraBackend::Device(camera) => camera.stop(),
        }
    }
}

/// Capture handle shared by every consumer in the process.
#[derive(Clone)]
pub struct Camera {
    state: Arc<Mutex<CameraState>>,
}

impl Camera {
    /// Open the capture source named by `device`.
    ///
    /// `stub://` names select the synthetic sensor. Anything else is treated as
    /// a V4L2 device node and needs the `capture-v4l2` feature.
    pub fn open(device: &str) -> Result<Self, CaptureError> {
        if device.starts_with("stub://") {
            return Ok(Self::synthetic(device, SyntheticFaults::default()));
        }
        #[cfg(feature = "capture-v4l2")]
        {
            Ok(Self::with_backend(
                device,
                CameraBackend::Device(DeviceCamera::new(device)),
            ))
        }
        #[cfg(not(feature = "capture-v4l2"))]
        {
            Err(CaptureError::Configuration(format!(
                "device {} requires the capture-v4l2 feature",
                device
            )))
        }
    }

    /// Synthetic sensor with optional fault injection.
    pub fn synthetic(name: &str, faults: SyntheticFaults) -> Self {
        Self::with_backend(name, CameraBackend::Synthetic(SyntheticCamera::new(name, faults)))
    }

    fn with_backend(device: &str, backend: CameraBackend) -> Self {
        Self {
            state: Arc::new(Mutex::new(CameraState {
                device: device.to_string(),
                backend,
                phase: Phase::Opened,
                config: None,
                frames_captured: 0,
                chunks_encoded: 0,
            })),
        }
    }

    // A panic while holding the lock must not wedge shutdown.
    fn lock(&self) -> MutexGuard<'_, CameraState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply resolution, frame rate and mode. Fatal on rejection.
    pub fn configure(&self, config: StreamConfig, mode: EncodingMode) -> Result<(), CaptureError> {
        config.validate(mode)?;
        let mut state = self.lock();
        match state.phase {
            Phase::Opened | Phase::Configured => {}
            Phase::Streaming => return Err(CaptureError::AlreadyStarted),
            Phase::Stopped => return Err(CaptureError::Stopped),
        }
        state.backend.configure(&config, mode)?;
        state.config = Some((config, mode));
        state.phase = Phase::Configured;
        log::info!(
            "Camera: configured {} {}x{} @ {:.1}fps ({} mode)",
            state.device,
            config.width,
            config.height,
            config.frame_rate,
            mode
        );
        Ok(())
    }

    /// Begin sensor streaming.
    pub fn start(&self) -> Result<(), CaptureError> {
        let mut state = self.lock();
        match state.phase {
            Phase::Configured => {}
            Phase::Opened => return Err(CaptureError::NotConfigured),
            Phase::Streaming => return Err(CaptureError::AlreadyStarted),
            Phase::Stopped => return Err(CaptureError::Stopped),
        }
        state.backend.start()?;
        state.phase = Phase::Streaming;
        log::info!("Camera: started {}", state.device);
        Ok(())
    }

    /// Capture one JPEG into `buffer`, replacing its previous contents.
    ///
    /// An empty buffer on `Ok` is a transient sensor fault; callers back off and
    /// retry. The camera lock is held for the whole capture.
    pub fn capture_frame(&self, quality: u8, buffer: &mut FrameBuffer) -> Result<(), CaptureError> {
        let mut state = self.lock();
        state.require_streaming(EncodingMode::Still)?;
        buffer.reset();
        state.backend.capture_still(quality, buffer.as_mut_vec())?;
        if !buffer.is_empty() {
            state.frames_captured += 1;
        }
        Ok(())
    }

    /// Start the hardware encoder, writing its output into `output`.
    ///
    /// May be called before `start()`; the pump idles until the sensor runs.
    pub fn start_encoder(
        &self,
        bitrate: u32,
        output: Box<dyn Write + Send>,
    ) -> Result<Encoder, CaptureError> {
        {
            let mut state = self.lock();
            match state.phase {
                Phase::Configured | Phase::Streaming => {}
                Phase::Opened => return Err(CaptureError::NotConfigured),
                Phase::Stopped => return Err(CaptureError::Stopped),
            }
            state.require_mode(EncodingMode::Continuous)?;
            if !(MIN_BITRATE..=MAX_BITRATE).contains(&bitrate) {
                return Err(CaptureError::Configuration(format!(
                    "bitrate {} outside {}..={}",
                    bitrate, MIN_BITRATE, MAX_BITRATE
                )));
            }
            state.backend.set_bitrate(bitrate)?;
            log::info!("Camera: h264 encoder at {} bit/s", bitrate);
        }
        Encoder::spawn(self.clone(), output)
    }

    /// Pull the next encoded chunk. Used by the encoder pump.
    pub(crate) fn read_chunk(&self, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        let mut state = self.lock();
        state.require_streaming(EncodingMode::Continuous)?;
        out.clear();
        state.backend.read_chunk(out)?;
        if !out.is_empty() {
            state.chunks_encoded += 1;
        }
        Ok(())
    }

    /// Halt streaming and release the device. Returns `true` for the call that
    /// actually stopped the session; later calls are no-ops.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        if state.phase == Phase::Stopped {
            return false;
        }
        if let Err(err) = state.backend.stop() {
            log::warn!("Camera: error while stopping {}: {}", state.device, err);
        }
        state.phase = Phase::Stopped;
        log::info!(
            "Camera: stopped {} ({} frames, {} chunks)",
            state.device,
            state.frames_captured,
            state.chunks_encoded
        );
        true
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().phase == Phase::Streaming
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().phase == Phase::Stopped
    }

    /// The configuration applied by `configure`, if any.
    pub fn stream_config(&self) -> Option<StreamConfig> {
        self.lock().config.map(|(config, _)| config)
    }

    pub fn stats(&self) -> CameraStats {
        let state = self.lock();
        CameraStats {
            frames_captured: state.frames_captured,
            chunks_encoded: state.chunks_encoded,
            device: state.device.clone(),
        }
    }
}

impl CameraState {
    fn require_mode(&self, expected: EncodingMode) -> Result<(), CaptureError> {
        let Some((_, actual)) = self.config else {
            return Err(CaptureError::NotConfigured);
        };
        if actual != expected {
            return Err(CaptureError::WrongMode { expected, actual });
        }
        Ok(())
    }

    fn require_streaming(&self, expected: EncodingMode) -> Result<(), CaptureError> {
        match self.phase {
            Phase::Streaming => self.require_mode(expected),
            Phase::Stopped => Err(CaptureError::Stopped),
            Phase::Opened => Err(CaptureError::NotConfigured),
            Phase::Configured => Err(CaptureError::NotStarted),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::is_jpeg;

    fn small_still() -> StreamConfig {
        StreamConfig {
            width: 64,
            height: 48,
            frame_rate: 100.0,
            quality: 70,
            bitrate: 0,
        }
    }

    #[test]
    fn configure_accepts_supported_envelope() -> anyhow::Result<()> {
        for (width, height, frame_rate) in [(32, 32, 1.0), (640, 480, 25.0), (1920, 1080, 30.0)] {
            let camera = Camera::open("stub://envelope")?;
            let config = StreamConfig {
                width,
                height,
                frame_rate,
                ..StreamConfig::mjpeg_default()
            };
            camera.configure(config, EncodingMode::Still)?;
            assert_eq!(camera.stream_config(), Some(config));
        }
        Ok(())
    }

    #[test]
    fn configure_rejects_values_outside_envelope() {
        let camera = Camera::synthetic("stub://reject", SyntheticFaults::default());
        let cases = [
            StreamConfig { width: 0, ..StreamConfig::mjpeg_default() },
            StreamConfig { width: 641, ..StreamConfig::mjpeg_default() },
            StreamConfig { height: 8000, ..StreamConfig::mjpeg_default() },
            StreamConfig { frame_rate: 0.0, ..StreamConfig::mjpeg_default() },
            StreamConfig { frame_rate: f32::NAN, ..StreamConfig::mjpeg_default() },
            StreamConfig { quality: 0, ..StreamConfig::mjpeg_default() },
        ];
        for config in cases {
            let err = camera
                .configure(config, EncodingMode::Still)
                .expect_err("configuration must fail");
            assert!(matches!(err, CaptureError::Configuration(_)), "{config:?}");
        }
    }

    #[test]
    fn continuous_mode_enforces_encoder_limits() {
        let camera = Camera::synthetic("stub://h264", SyntheticFaults::default());
        let too_big = StreamConfig {
            width: 2560,
            height: 1440,
            ..StreamConfig::rtsp_default()
        };
        assert!(matches!(
            camera.configure(too_big, EncodingMode::Continuous),
            Err(CaptureError::Configuration(_))
        ));
        let low_bitrate = StreamConfig {
            bitrate: 1_000,
            ..StreamConfig::rtsp_default()
        };
        assert!(matches!(
            camera.configure(low_bitrate, EncodingMode::Continuous),
            Err(CaptureError::Configuration(_))
        ));
        assert!(camera
            .configure(StreamConfig::rtsp_default(), EncodingMode::Continuous)
            .is_ok());
    }

    #[test]
    fn captured_frames_are_jpeg() -> anyhow::Result<()> {
        let camera = Camera::open("stub://jpeg")?;
        camera.configure(small_still(), EncodingMode::Still)?;
        camera.start()?;

        let mut buffer = FrameBuffer::new();
        for _ in 0..3 {
            camera.capture_frame(70, &mut buffer)?;
            assert!(!buffer.is_empty());
            assert_eq!(&buffer.as_bytes()[..2], &[0xFF, 0xD8]);
            assert!(is_jpeg(buffer.as_bytes()));
        }
        assert_eq!(camera.stats().frames_captured, 3);
        Ok(())
    }

    #[test]
    fn capture_requires_started_still_session() -> anyhow::Result<()> {
        let camera = Camera::open("stub://order")?;
        let mut buffer = FrameBuffer::new();
        assert!(matches!(
            camera.capture_frame(70, &mut buffer),
            Err(CaptureError::NotConfigured)
        ));
        camera.configure(small_still(), EncodingMode::Still)?;
        assert!(matches!(
            camera.capture_frame(70, &mut buffer),
            Err(CaptureError::NotStarted)
        ));
        camera.start()?;
        assert!(matches!(camera.start(), Err(CaptureError::AlreadyStarted)));
        Ok(())
    }

    #[test]
    fn stop_is_idempotent_and_safe_before_start() -> anyhow::Result<()> {
        let camera = Camera::open("stub://stop")?;
        assert!(camera.stop());
        assert!(!camera.stop());
        assert!(camera.is_stopped());

        let mut buffer = FrameBuffer::new();
        assert!(matches!(
            camera.capture_frame(70, &mut buffer),
            Err(CaptureError::Stopped)
        ));
        assert!(matches!(
            camera.configure(small_still(), EncodingMode::Still),
            Err(CaptureError::Stopped)
        ));
        Ok(())
    }

    #[test]
    fn encoder_requires_continuous_mode() -> anyhow::Result<()> {
        let camera = Camera::open("stub://mode")?;
        camera.configure(small_still(), EncodingMode::Still)?;
        let err = camera
            .start_encoder(1_000_000, Box::new(std::io::sink()))
            .err()
            .expect("still mode has no encoder");
        assert!(matches!(err, CaptureError::WrongMode { .. }));
        Ok(())
    }

    #[test]
    fn open_device_without_feature_is_configuration_error() {
        #[cfg(not(feature = "capture-v4l2"))]
        assert!(matches!(
            Camera::open("/dev/video0"),
            Err(CaptureError::Configuration(_))
        ));
    }
}
