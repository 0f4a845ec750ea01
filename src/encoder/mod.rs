//! JPEG encoding of captured frames
//!
//! [`JpegEncoder`] is the seam to the compression routine. It streams its
//! output through a callback in small pieces instead of returning one large
//! buffer, so the upload path can forward bytes while encoding is still in
//! progress. [`ImageJpegEncoder`] implements it on top of the `image` crate.
//!
//! [`EncoderTask`] runs one encode pass on its own thread and feeds the
//! pieces into a [`chunk_channel`](crate::channel::chunk_channel).

mod task;

pub use task::{EncodeReport, EncoderTask};

use bytes::Bytes;
use image::ExtendedColorType;
use image::codecs::jpeg;
use std::io::{self, Write};

use crate::types::{Frame, PixelFormat};
use crate::{CameraError, Result};

/// Default size of the pieces handed to the output callback
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Callback receiving encoder output in production order
pub type ChunkSink<'a> = dyn FnMut(&[u8]) -> Result<()> + 'a;

/// Streaming JPEG compressor
pub trait JpegEncoder: Send + Sync + 'static {
    /// Encode `frame` at `quality` (1-100), passing output to `sink` piece by piece.
    ///
    /// An error from `sink` aborts the encode and is returned unchanged.
    fn encode(&self, frame: &Frame, quality: u8, sink: &mut ChunkSink<'_>) -> Result<()>;

    /// Encode into a single buffer
    fn encode_to_bytes(&self, frame: &Frame, quality: u8) -> Result<Bytes> {
        let mut out = Vec::with_capacity(frame.len() / 4);
        self.encode(frame, quality, &mut |piece| {
            out.extend_from_slice(piece);
            Ok(())
        })?;
        Ok(Bytes::from(out))
    }
}

/// JPEG encoder backed by the `image` crate
#[derive(Debug, Clone)]
pub struct ImageJpegEncoder {
    chunk_size: usize,
}

impl ImageJpegEncoder {
    /// Create an encoder emitting pieces of at most `chunk_size` bytes
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size: chunk_size.max(1) }
    }
}

impl Default for ImageJpegEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl JpegEncoder for ImageJpegEncoder {
    fn encode(&self, frame: &Frame, quality: u8, sink: &mut ChunkSink<'_>) -> Result<()> {
        let mut writer = ChunkingWriter::new(self.chunk_size, sink);

        if frame.is_jpeg() {
            // Sensor already compressed the frame; just re-chunk it
            let written = writer.write_all(&frame.data);
            return writer.finish(written);
        }

        if frame.format == PixelFormat::Yuv422 && frame.width % 2 != 0 {
            // YUYV packs two pixels per macropixel
            return Err(CameraError::encode_failed(format!(
                "YUYV frame width {} is not even",
                frame.width
            )));
        }

        let expected = frame.expected_len().unwrap_or(0);
        if frame.len() < expected {
            return Err(CameraError::encode_failed(format!(
                "frame buffer holds {} bytes, {}x{} {:?} needs {}",
                frame.len(),
                frame.width,
                frame.height,
                frame.format,
                expected
            )));
        }

        let quality = quality.clamp(1, 100);
        let data = &frame.data[..expected];
        let encoded = match frame.format {
            PixelFormat::Rgb888 => jpeg::JpegEncoder::new_with_quality(&mut writer, quality)
                .encode(data, frame.width, frame.height, ExtendedColorType::Rgb8),
            PixelFormat::Grayscale => jpeg::JpegEncoder::new_with_quality(&mut writer, quality)
                .encode(data, frame.width, frame.height, ExtendedColorType::L8),
            PixelFormat::Rgb565 => {
                let rgb = rgb565_to_rgb888(data);
                jpeg::JpegEncoder::new_with_quality(&mut writer, quality).encode(
                    &rgb,
                    frame.width,
                    frame.height,
                    ExtendedColorType::Rgb8,
                )
            }
            PixelFormat::Yuv422 => {
                let rgb = yuyv_to_rgb888(data);
                jpeg::JpegEncoder::new_with_quality(&mut writer, quality).encode(
                    &rgb,
                    frame.width,
                    frame.height,
                    ExtendedColorType::Rgb8,
                )
            }
            PixelFormat::Jpeg => Ok(()),
        };

        writer.finish(encoded.map_err(|e| io::Error::other(e.to_string())))
    }
}

/// `io::Write` adapter cutting the encoder's output into fixed-size pieces
struct ChunkingWriter<'s, 'a> {
    pending: Vec<u8>,
    chunk_size: usize,
    sink: &'s mut ChunkSink<'a>,
    failure: Option<CameraError>,
}

impl<'s, 'a> ChunkingWriter<'s, 'a> {
    fn new(chunk_size: usize, sink: &'s mut ChunkSink<'a>) -> Self {
        Self { pending: Vec::with_capacity(chunk_size), chunk_size, sink, failure: None }
    }

    fn emit(&mut self, piece_len: usize) -> io::Result<()> {
        let piece: Vec<u8> = self.pending.drain(..piece_len).collect();
        if let Err(e) = (self.sink)(&piece) {
            self.failure = Some(e);
            return Err(io::Error::other("chunk sink rejected output"));
        }
        Ok(())
    }

    /// Flush the tail and turn the encode outcome into a crate error.
    ///
    /// A sink failure takes precedence over the I/O error it caused.
    fn finish(mut self, outcome: io::Result<()>) -> Result<()> {
        if let Some(failure) = self.failure.take() {
            return Err(failure);
        }
        outcome.map_err(|e| CameraError::encode_failed(e.to_string()))?;
        if !self.pending.is_empty() {
            let len = self.pending.len();
            if self.emit(len).is_err() {
                return Err(self
                    .failure
                    .take()
                    .unwrap_or_else(|| CameraError::encode_failed("chunk sink rejected output")));
            }
        }
        Ok(())
    }
}

impl Write for ChunkingWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.failure.is_some() {
            return Err(io::Error::other("chunk sink rejected output"));
        }
        self.pending.extend_from_slice(buf);
        while self.pending.len() >= self.chunk_size {
            self.emit(self.chunk_size)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Expand big-endian RGB565 to packed RGB888
fn rgb565_to_rgb888(data: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for px in data.chunks_exact(2) {
        let value = u16::from_be_bytes([px[0], px[1]]);
        let r = ((value >> 11) & 0x1F) as u8;
        let g = ((value >> 5) & 0x3F) as u8;
        let b = (value & 0x1F) as u8;
        rgb.push((r << 3) | (r >> 2));
        rgb.push((g << 2) | (g >> 4));
        rgb.push((b << 3) | (b >> 2));
    }
    rgb
}

/// Convert packed YUYV 4:2:2 to RGB888 (BT.601, integer math)
fn yuyv_to_rgb888(data: &[u8]) -> Vec<u8> {
    fn to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
        let c = i32::from(y) - 16;
        let d = i32::from(u) - 128;
        let e = i32::from(v) - 128;
        let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
        [clamp(298 * c + 409 * e), clamp(298 * c - 100 * d - 208 * e), clamp(298 * c + 516 * d)]
    }

    let mut rgb = Vec::with_capacity(data.len() / 2 * 3);
    for px in data.chunks_exact(4) {
        let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
        rgb.extend_from_slice(&to_rgb(y0, u, v));
        rgb.extend_from_slice(&to_rgb(y1, u, v));
    }
    rgb
}
