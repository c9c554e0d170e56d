//! Frame handoff between capture and delivery.
//!
//! - `FrameBuffer`: reusable byte buffer owned by exactly one consumer. The
//!   camera overwrites it in place on every capture; it is never shared.
//! - multipart framing for `multipart/x-mixed-replace` MJPEG responses.

use std::io::{self, Write};

/// Multipart boundary token used on `/video_feed`.
pub const BOUNDARY: &str = "frame";

/// Content type of the MJPEG response.
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

/// Header written before every JPEG part.
pub const PART_HEADER: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Terminator written after every JPEG part.
pub const PART_TRAILER: &[u8] = b"\r\n";

/// Smallest well-formed baseline JPEG (SOI, DQT, SOF0, DHT, SOS, EOI).
pub const MIN_JPEG_BYTES: usize = 125;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

/// Per-consumer frame buffer.
///
/// Capacity is kept between frames so steady-state streaming does not
/// allocate.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    data: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Drop the previous frame, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// True when `bytes` starts with SOI and ends with EOI.
pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..2] == SOI && bytes[bytes.len() - 2..] == EOI
}

/// Write one multipart part carrying `jpeg`.
pub fn write_part<W: Write>(out: &mut W, jpeg: &[u8]) -> io::Result<()> {
    out.write_all(PART_HEADER)?;
    out.write_all(jpeg)?;
    out.write_all(PART_TRAILER)?;
    out.flush()
}

/// Split a buffered multipart body into complete JPEG parts.
///
/// Returns the parts found and the number of bytes consumed; a trailing
/// partial part is left for the next call. Used by tests and tooling that
/// consume `/video_feed`.
pub fn split_parts(body: &[u8]) -> (Vec<Vec<u8>>, usize) {
    let mut parts = Vec::new();
    let mut offset = 0;
    loop {
        let rest = &body[offset..];
        if rest.len() < PART_HEADER.len() {
            break;
        }
        if !rest.starts_with(PART_HEADER) {
            break;
        }
        let payload = &rest[PART_HEADER.len()..];
        let Some(end) = find(payload, b"\r\n--frame\r\n").or_else(|| {
            payload
                .ends_with(PART_TRAILER)
                .then(|| payload.len() - PART_TRAILER.len())
                .filter(|&end| is_jpeg(&payload[..end]))
        }) else {
            break;
        };
        parts.push(payload[..end].to_vec());
        offset += PART_HEADER.len() + end + PART_TRAILER.len();
    }
    (parts, offset)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(fill: u8, len: usize) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xD8];
        bytes.extend(std::iter::repeat(fill).take(len));
        bytes.extend_from_slice(&[0xFF, 0xD9]);
        bytes
    }

    #[test]
    fn part_matches_wire_format() -> io::Result<()> {
        let jpeg = fake_jpeg(0x11, 4);
        let mut out = Vec::new();
        write_part(&mut out, &jpeg)?;

        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&jpeg);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(out, expected);
        Ok(())
    }

    #[test]
    fn split_parts_keeps_partial_tail() -> io::Result<()> {
        let a = fake_jpeg(0x21, 10);
        let b = fake_jpeg(0x22, 20);
        let mut body = Vec::new();
        write_part(&mut body, &a)?;
        write_part(&mut body, &b)?;
        body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8\x00");

        let (parts, consumed) = split_parts(&body);
        assert_eq!(parts, vec![a, b]);
        assert!(body[consumed..].starts_with(PART_HEADER));
        Ok(())
    }

    #[test]
    fn buffer_reset_keeps_capacity() {
        let mut buffer = FrameBuffer::with_capacity(1024);
        buffer.as_mut_vec().extend_from_slice(&[1, 2, 3]);
        assert_eq!(buffer.len(), 3);
        buffer.reset();
        assert!(buffer.is_empty());
        assert!(buffer.as_mut_vec().capacity() >= 1024);
    }

    #[test]
    fn jpeg_markers_are_checked() {
        assert!(is_jpeg(&fake_jpeg(0, 1)));
        assert!(!is_jpeg(&[0xFF, 0xD8]));
        assert!(!is_jpeg(&[0x89, 0x50, 0x4E, 0x47]));
    }
}
