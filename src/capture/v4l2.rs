//! V4L2 camera backend.
//!
//! Drives a local device node (e.g. /dev/video0) that exposes on-sensor or
//! ISP encoding: fourcc `MJPG` for still mode, `H264` for continuous mode.
//! Frames are dequeued from mmap buffers and copied into the caller's buffer
//! before the buffer is handed back to the driver.

use ouroboros::self_referencing;
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;

use super::{EncodingMode, StreamConfig};
use crate::error::CaptureError;

const CID_JPEG_COMPRESSION_QUALITY: u32 = 0x009d_0903;
const CID_MPEG_VIDEO_BITRATE: u32 = 0x0099_09cf;
const STREAM_BUFFERS: u32 = 4;

#[self_referencing]
struct DeviceStream {
    device: v4l::Device,
    #[borrows(device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

pub(crate) struct DeviceCamera {
    path: String,
    device: Option<v4l::Device>,
    stream: Option<DeviceStream>,
    mode: Option<EncodingMode>,
    quality: Option<u8>,
    quality_supported: bool,
}

impl DeviceCamera {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            device: None,
            stream: None,
            mode: None,
            quality: None,
            quality_supported: true,
        }
    }

    pub(crate) fn configure(
        &mut self,
        config: &StreamConfig,
        mode: EncodingMode,
    ) -> Result<(), CaptureError> {
        let device = v4l::Device::with_path(&self.path).map_err(|e| {
            CaptureError::Configuration(format!("open v4l2 device {}: {}", self.path, e))
        })?;

        let fourcc = match mode {
            EncodingMode::Still => v4l::FourCC::new(b"MJPG"),
            EncodingMode::Continuous => v4l::FourCC::new(b"H264"),
        };
        let mut format = device
            .format()
            .map_err(|e| CaptureError::Configuration(format!("read v4l2 format: {}", e)))?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = fourcc;

        let applied = device.set_format(&format).map_err(|e| {
            CaptureError::Configuration(format!("set v4l2 format on {}: {}", self.path, e))
        })?;
        // Drivers silently substitute the nearest supported format.
        if applied.width != config.width
            || applied.height != config.height
            || applied.fourcc != fourcc
        {
            return Err(CaptureError::Configuration(format!(
                "{} offered {}x{} {} instead of {}x{} {}",
                self.path,
                applied.width,
                applied.height,
                applied.fourcc,
                config.width,
                config.height,
                fourcc
            )));
        }

        let fps = config.frame_rate.round().max(1.0) as u32;
        let params = v4l::video::capture::Parameters::with_fps(fps);
        device.set_params(&params).map_err(|e| {
            CaptureError::Configuration(format!("set {} fps on {}: {}", fps, self.path, e))
        })?;

        self.device = Some(device);
        self.mode = Some(mode);
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), CaptureError> {
        let device = self.device.take().ok_or(CaptureError::NotConfigured)?;
        let stream = DeviceStreamTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
            },
        }
        .try_build()
        .map_err(|e| CaptureError::Device(format!("create v4l2 buffer stream: {}", e)))?;
        self.stream = Some(stream);
        log::info!("Camera: {} streaming ({:?})", self.path, self.mode);
        Ok(())
    }

    pub(crate) fn capture_still(&mut self, quality: u8, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        if self.quality != Some(quality) && self.quality_supported {
            self.apply_quality(quality);
        }
        self.dequeue_into(out)
    }

    pub(crate) fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CaptureError> {
        let control = Control {
            id: CID_MPEG_VIDEO_BITRATE,
            value: Value::Integer(bitrate as i64),
        };
        self.with_device(|device| device.set_control(control))
            .map_err(|e| CaptureError::Configuration(format!("set encoder bitrate: {}", e)))
    }

    pub(crate) fn read_chunk(&mut self, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        self.dequeue_into(out)
    }

    pub(crate) fn stop(&mut self) -> Result<(), CaptureError> {
        // Dropping the stream issues STREAMOFF and unmaps the buffers.
        self.stream = None;
        self.device = None;
        Ok(())
    }

    fn apply_quality(&mut self, quality: u8) {
        let control = Control {
            id: CID_JPEG_COMPRESSION_QUALITY,
            value: Value::Integer(quality as i64),
        };
        match self.with_device(|device| device.set_control(control)) {
            Ok(()) => self.quality = Some(quality),
            Err(err) => {
                log::warn!(
                    "Camera: {} does not accept jpeg quality {}: {}",
                    self.path,
                    quality,
                    err
                );
                self.quality_supported = false;
            }
        }
    }

    fn with_device<T>(
        &mut self,
        f: impl FnOnce(&v4l::Device) -> std::io::Result<T>,
    ) -> std::io::Result<T> {
        if let Some(stream) = self.stream.as_ref() {
            return f(stream.borrow_device());
        }
        match self.device.as_ref() {
            Some(device) => f(device),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "v4l2 device not open",
            )),
        }
    }

    fn dequeue_into(&mut self, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        let stream = self.stream.as_mut().ok_or(CaptureError::NotStarted)?;
        stream.with_stream_mut(|stream| {
            let (buf, meta) = stream
                .next()
                .map_err(|e| CaptureError::Device(format!("dequeue v4l2 buffer: {}", e)))?;
            let used = (meta.bytesused as usize).min(buf.len());
            // bytesused == 0 is a dropped frame; the caller sees an empty buffer.
            out.extend_from_slice(&buf[..used]);
            Ok(())
        })
    }
}
