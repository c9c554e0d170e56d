//! Typed failure taxonomy for the capture and delivery pipeline.
//!
//! Orchestration code works in `anyhow::Result`; these enums exist where callers
//! need to branch on the kind of failure (retry, give up, shut down).

use std::io;

use thiserror::Error;

use crate::capture::EncodingMode;

/// Errors raised by the capture source.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The hardware (or the envelope check in front of it) rejected the
    /// requested resolution / rate / bitrate. Fatal at startup.
    #[error("camera rejected configuration: {0}")]
    Configuration(String),

    #[error("camera is not configured")]
    NotConfigured,

    #[error("camera is configured for {actual} mode, operation requires {expected} mode")]
    WrongMode {
        expected: EncodingMode,
        actual: EncodingMode,
    },

    #[error("camera already started")]
    AlreadyStarted,

    #[error("camera is not streaming")]
    NotStarted,

    #[error("camera has been stopped")]
    Stopped,

    /// A single capture failed but the session is still usable.
    #[error("transient capture fault: {0}")]
    Transient(String),

    #[error("camera device error: {0}")]
    Device(String),
}

impl CaptureError {
    /// Whether a frame loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::Transient(_) | CaptureError::Device(_))
    }
}

/// Errors raised by the muxer sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The input stream was closed by shutdown. Writers must stop.
    #[error("sink input already closed")]
    InputClosed,

    #[error("sink process exited: {0}")]
    Exited(String),

    #[error("sink i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SinkError {
    /// True when the far side is gone and further writes are pointless.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            SinkError::InputClosed | SinkError::Exited(_) => true,
            SinkError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
            ),
        }
    }
}
