//! picam-relay
//!
//! Re-publishes a camera sensor over two delivery paths:
//!
//! - MJPEG over HTTP (`multipart/x-mixed-replace`) for browsers
//! - H.264 piped into an external muxer process that pushes RTSP to a media
//!   server
//!
//! # Module Structure
//!
//! - `capture`: camera handle, synthetic and V4L2 backends, H.264 encoder pump
//! - `frame`: per-consumer frame buffers and multipart framing
//! - `mjpeg`: HTTP server streaming JPEG frames
//! - `rtsp`: muxer sink abstraction and the publisher state machine
//! - `supervisor`: signal handling and run-once teardown
//! - `config`: TOML file plus environment overrides
//!
//! # Invariants
//!
//! 1. **One camera session per process**: every consumer shares one `Camera`
//!    handle; stopping it happens-after the last in-flight capture.
//! 2. **No shared frame bytes**: each MJPEG connection captures into its own
//!    `FrameBuffer`.
//! 3. **Bounded memory**: frames are overwritten in place; nothing queues
//!    between capture and delivery.
//! 4. **Teardown runs once**: the muxer input is closed once, the muxer is
//!    terminated (then killed), the encoder and camera are stopped, in order.

pub mod capture;
pub mod config;
pub mod error;
pub mod frame;
pub mod mjpeg;
pub mod rtsp;
pub mod supervisor;

pub use capture::{Camera, EncodingMode, StreamConfig, SyntheticFaults};
pub use config::RelayConfig;
pub use error::{CaptureError, SinkError};
pub use frame::FrameBuffer;
pub use mjpeg::{MjpegConfig, MjpegHandle, MjpegServer};
pub use rtsp::{ProcessLauncher, PublisherConfig, RtspPublisher, ShutdownReport};
pub use supervisor::{ShutdownGuard, ShutdownReason, Supervisor};
