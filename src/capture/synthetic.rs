//! Synthetic sensor (`stub://`) for tests and hosts without a camera.
//!
//! Still mode encodes a moving test pattern to a real baseline JPEG at the
//! requested quality and tags it with a `COM` segment (`seq=<n>`) right after
//! SOI, so consumers can verify per-client ordering. Continuous mode emits one
//! Annex-B H.264 access unit per frame interval; chunk `n` depends only on
//! `(n, width, height)`, see [`h264_chunk`].
//!
//! Both modes pace themselves to the configured frame rate, the way a sensor
//! blocks until the next exposure completes.

use std::time::Instant;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::{EncodingMode, StreamConfig};
use crate::error::CaptureError;

const SEQ_TAG: &[u8] = b"seq=";
/// One IDR access unit (with SPS/PPS) per this many chunks.
const GOP_LENGTH: u64 = 25;
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Fault injection for the synthetic sensor. Counts are 1-based capture
/// attempts; `Some(3)` fires on attempts 3, 6, 9, ...
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyntheticFaults {
    /// Return an empty frame (transient sensor fault).
    pub empty_every: Option<u64>,
    /// Return `CaptureError::Transient`.
    pub error_every: Option<u64>,
}

pub(crate) struct SyntheticCamera {
    name: String,
    faults: SyntheticFaults,
    config: Option<(StreamConfig, EncodingMode)>,
    streaming: bool,
    bitrate: u32,
    attempts: u64,
    frame_seq: u64,
    chunk_seq: u64,
    next_due: Option<Instant>,
}

impl SyntheticCamera {
    pub(crate) fn new(name: &str, faults: SyntheticFaults) -> Self {
        Self {
            name: name.to_string(),
            faults,
            config: None,
            streaming: false,
            bitrate: 0,
            attempts: 0,
            frame_seq: 0,
            chunk_seq: 0,
            next_due: None,
        }
    }

    pub(crate) fn configure(
        &mut self,
        config: &StreamConfig,
        mode: EncodingMode,
    ) -> Result<(), CaptureError> {
        self.config = Some((*config, mode));
        self.bitrate = config.bitrate;
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), CaptureError> {
        if self.config.is_none() {
            return Err(CaptureError::NotConfigured);
        }
        self.streaming = true;
        self.next_due = None;
        match self.config {
            Some((_, EncodingMode::Continuous)) => log::info!(
                "Camera: {} streaming h264 at {} bit/s (synthetic)",
                self.name,
                self.bitrate
            ),
            _ => log::info!("Camera: {} streaming jpeg (synthetic)", self.name),
        }
        Ok(())
    }

    pub(crate) fn capture_still(&mut self, quality: u8, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        let config = self.active_config()?;
        self.wait_for_exposure(&config);
        self.attempts += 1;

        if fires(self.faults.error_every, self.attempts) {
            return Err(CaptureError::Transient(format!(
                "injected sensor fault on attempt {}",
                self.attempts
            )));
        }
        if fires(self.faults.empty_every, self.attempts) {
            return Ok(());
        }

        let pixels = test_pattern(config.width, config.height, self.frame_seq);
        let mut encoded = Vec::with_capacity(pixels.len() / 8);
        JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100))
            .encode(&pixels, config.width, config.height, ExtendedColorType::Rgb8)
            .map_err(|e| CaptureError::Device(format!("jpeg encode: {}", e)))?;

        tag_sequence(&encoded, self.frame_seq, out);
        self.frame_seq += 1;
        Ok(())
    }

    pub(crate) fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CaptureError> {
        self.bitrate = bitrate;
        Ok(())
    }

    pub(crate) fn read_chunk(&mut self, out: &mut Vec<u8>) -> Result<(), CaptureError> {
        let config = self.active_config()?;
        self.wait_for_exposure(&config);
        out.extend_from_slice(&h264_chunk(self.chunk_seq, config.width, config.height));
        self.chunk_seq += 1;
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<(), CaptureError> {
        self.streaming = false;
        Ok(())
    }

    fn active_config(&self) -> Result<StreamConfig, CaptureError> {
        if !self.streaming {
            return Err(CaptureError::NotStarted);
        }
        self.config
            .map(|(config, _)| config)
            .ok_or(CaptureError::NotConfigured)
    }

    fn wait_for_exposure(&mut self, config: &StreamConfig) {
        let interval = config.frame_interval();
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // Never schedule in the past, so a slow reader cannot cause a burst.
        self.next_due = Some(due.max(now) + interval);
    }
}

fn fires(every: Option<u64>, attempt: u64) -> bool {
    matches!(every, Some(n) if n > 0 && attempt % n == 0)
}

/// RGB gradient with a vertical bar that moves one step per frame.
fn test_pattern(width: u32, height: u32, seq: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let bar_width = (w / 16).max(1);
    let bar_x = (seq as usize * bar_width) % w;
    let mut pixels = vec![0u8; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) * 3;
            if x >= bar_x && x < bar_x + bar_width {
                pixels[i..i + 3].copy_from_slice(&[255, 255, 255]);
            } else {
                pixels[i] = (x * 255 / w.max(1)) as u8;
                pixels[i + 1] = (y * 255 / h.max(1)) as u8;
                pixels[i + 2] = (seq % 256) as u8;
            }
        }
    }
    pixels
}

/// Copy `jpeg` into `out` with a `COM seq=<n>` segment inserted after SOI.
fn tag_sequence(jpeg: &[u8], seq: u64, out: &mut Vec<u8>) {
    let mut comment = SEQ_TAG.to_vec();
    comment.extend_from_slice(seq.to_string().as_bytes());
    let segment_len = (comment.len() + 2) as u16;

    out.reserve(jpeg.len() + comment.len() + 4);
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(&[0xFF, 0xFE]);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(&comment);
    out.extend_from_slice(&jpeg[2..]);
}

/// Read back the sequence number written by the synthetic sensor.
pub fn frame_sequence(jpeg: &[u8]) -> Option<u64> {
    if jpeg.len() < 6 || jpeg[..4] != [0xFF, 0xD8, 0xFF, 0xFE] {
        return None;
    }
    let len = u16::from_be_bytes([jpeg[4], jpeg[5]]) as usize;
    let comment = jpeg.get(6..4 + len)?;
    let digits = comment.strip_prefix(SEQ_TAG)?;
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Synthetic H.264 access unit number `seq`.
///
/// Every `GOP_LENGTH`th unit starts with SPS, PPS and an IDR slice; the rest are
/// single non-IDR slices. Payload bytes always have the high bit set, so no
/// start code is ever emulated inside a NAL unit.
pub fn h264_chunk(seq: u64, width: u32, height: u32) -> Vec<u8> {
    let payload_len = ((width as usize * height as usize) / 256).clamp(16, 16 * 1024);
    let mut chunk = Vec::with_capacity(payload_len + 64);
    if seq % GOP_LENGTH == 0 {
        push_nal(&mut chunk, 0x67, &sps_payload(width, height));
        push_nal(&mut chunk, 0x68, &[0xCE, 0x3C, 0x80]);
        push_nal(&mut chunk, 0x65, &slice_payload(seq, payload_len * 4));
    } else {
        push_nal(&mut chunk, 0x41, &slice_payload(seq, payload_len));
    }
    chunk
}

fn push_nal(out: &mut Vec<u8>, header: u8, payload: &[u8]) {
    out.extend_from_slice(&START_CODE);
    out.push(header);
    out.extend_from_slice(payload);
}

fn sps_payload(width: u32, height: u32) -> Vec<u8> {
    let mut payload = vec![0xC2, 0x80, 0x9E];
    for value in [width, height] {
        payload.extend(value.to_be_bytes().iter().map(|b| b | 0x80));
    }
    payload
}

fn slice_payload(seq: u64, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| 0x80 | ((seq as usize).wrapping_add(i) & 0x7F) as u8)
        .collect()
}
