//! RTSP publisher: camera H.264 encoder piped into a muxer sink.
//!
//! State machine:
//! `Unconfigured -> Configured -> Publishing -> ShuttingDown -> Stopped`.
//! Teardown order is fixed: close sink input, terminate sink (escalating to a
//! kill after the timeout), stop encoder, stop camera. It runs once; later
//! calls return the first report.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::sink::{Sink, SinkCommand, SinkLauncher, SinkWriter};
use crate::capture::{Camera, Encoder, EncoderReport, EncodingMode, StreamConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublisherState {
    Unconfigured,
    Configured,
    Publishing,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublisherState::Unconfigured => "unconfigured",
            PublisherState::Configured => "configured",
            PublisherState::Publishing => "publishing",
            PublisherState::ShuttingDown => "shutting down",
            PublisherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub stream: StreamConfig,
    pub url: String,
    /// Muxer executable, normally `ffmpeg`.
    pub muxer: String,
    /// Grace period between SIGTERM and kill.
    pub terminate_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::rtsp_default(),
            url: "rtsp://localhost:8554/cam".to_string(),
            muxer: "ffmpeg".to_string(),
            terminate_timeout: Duration::from_secs(5),
        }
    }
}

impl PublisherConfig {
    pub fn sink_command(&self) -> SinkCommand {
        SinkCommand::ffmpeg_rtsp(&self.muxer, self.stream.frame_rate, &self.url)
    }
}

/// What teardown did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// This teardown closed the sink input.
    pub input_closed: bool,
    /// The sink ignored SIGTERM and had to be killed.
    pub forced_kill: bool,
    pub sink_exit: Option<String>,
    pub encoder: Option<EncoderReport>,
    /// This teardown stopped the camera.
    pub camera_stopped: bool,
}

struct Inner {
    state: PublisherState,
    sink: Option<Arc<dyn Sink>>,
    encoder: Option<Encoder>,
    report: Option<ShutdownReport>,
}

pub struct RtspPublisher {
    config: PublisherConfig,
    camera: Camera,
    launcher: Box<dyn SinkLauncher>,
    inner: Mutex<Inner>,
}

impl RtspPublisher {
    pub fn new(config: PublisherConfig, camera: Camera, launcher: Box<dyn SinkLauncher>) -> Self {
        Self {
            config,
            camera,
            launcher,
            inner: Mutex::new(Inner {
                state: PublisherState::Unconfigured,
                sink: None,
                encoder: None,
                report: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> PublisherState {
        self.lock().state
    }

    /// The running sink, for the supervisor's watchdog.
    pub fn sink(&self) -> Option<Arc<dyn Sink>> {
        self.lock().sink.clone()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Put the camera into continuous mode at the configured resolution and rate.
    pub fn configure(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != PublisherState::Unconfigured {
            return Err(anyhow!("cannot configure publisher while {}", inner.state));
        }
        self.camera
            .configure(self.config.stream, EncodingMode::Continuous)
            .context("configure camera for h264")?;
        inner.state = PublisherState::Configured;
        Ok(())
    }

    /// Launch the sink, start the encoder into it, then start capture.
    ///
    /// Any failure tears down what was already started before returning.
    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state != PublisherState::Configured {
            return Err(anyhow!("cannot start publisher while {}", inner.state));
        }
        if let Err(err) = self.start_pipeline(&mut inner) {
            log::error!("RtspPublisher: startup failed: {:#}", err);
            self.teardown(&mut inner);
            return Err(err);
        }
        inner.state = PublisherState::Publishing;
        log::info!(
            "RtspPublisher: publishing {}x{} @ {} fps, {} bit/s to {}",
            self.config.stream.width,
            self.config.stream.height,
            self.config.stream.frame_rate,
            self.config.stream.bitrate,
            self.config.url
        );
        Ok(())
    }

    /// `configure` then `start`.
    pub fn publish(&self) -> Result<()> {
        self.configure()?;
        self.start()
    }

    fn start_pipeline(&self, inner: &mut Inner) -> Result<()> {
        let command = self.config.sink_command();
        let sink = self
            .launcher
            .launch(&command)
            .with_context(|| format!("launch muxer `{}`", command.program))?;
        inner.sink = Some(sink.clone());

        let encoder = self
            .camera
            .start_encoder(self.config.stream.bitrate, Box::new(SinkWriter::new(sink)))
            .context("start h264 encoder")?;
        inner.encoder = Some(encoder);

        self.camera.start().context("start camera")?;
        Ok(())
    }

    /// Tear everything down. Idempotent.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut inner = self.lock();
        self.teardown(&mut inner)
    }

    fn teardown(&self, inner: &mut Inner) -> ShutdownReport {
        if let Some(report) = &inner.report {
            log::debug!("RtspPublisher: shutdown already complete");
            return report.clone();
        }
        log::info!("RtspPublisher: shutting down (was {})", inner.state);
        inner.state = PublisherState::ShuttingDown;

        let mut report = ShutdownReport::default();
        if let Some(encoder) = inner.encoder.as_ref() {
            encoder.request_stop();
        }
        if let Some(sink) = inner.sink.as_ref() {
            report.input_closed = sink.close_input();
            match sink.terminate(self.config.terminate_timeout) {
                Ok(forced) => report.forced_kill = forced,
                Err(err) => log::error!("RtspPublisher: muxer termination failed: {:#}", err),
            }
            report.sink_exit = sink.try_exit();
        }
        if let Some(encoder) = inner.encoder.take() {
            report.encoder = Some(encoder.stop());
        }
        report.camera_stopped = self.camera.stop();

        inner.state = PublisherState::Stopped;
        log::info!(
            "RtspPublisher: stopped (input closed: {}, forced kill: {}, muxer exit: {}, bytes sent: {})",
            report.input_closed,
            report.forced_kill,
            report.sink_exit.as_deref().unwrap_or("unknown"),
            report
                .encoder
                .as_ref()
                .map(|encoder| encoder.bytes_written)
                .unwrap_or(0)
        );
        inner.report = Some(report.clone());
        report
    }
}

impl Drop for RtspPublisher {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|p| p.into_inner());
        if inner.report.is_none() && inner.state != PublisherState::Unconfigured {
            let mut inner = std::mem::replace(
                inner,
                Inner {
                    state: PublisherState::Stopped,
                    sink: None,
                    encoder: None,
                    report: None,
                },
            );
            self.teardown(&mut inner);
        }
    }
}
