//! RTSP delivery: H.264 from the camera piped into an external muxer.

pub mod publisher;
pub mod sink;

pub use publisher::{PublisherConfig, PublisherState, RtspPublisher, ShutdownReport};
pub use sink::{ProcessLauncher, ProcessSink, Sink, SinkCommand, SinkLauncher, SinkWriter};
