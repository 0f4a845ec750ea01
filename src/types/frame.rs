//! Captured frame types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Pixel layout of a captured frame buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Already JPEG-compressed by the sensor
    Jpeg,
    /// 16-bit RGB, big-endian byte order as delivered by the sensor DMA
    Rgb565,
    /// 24-bit packed RGB
    Rgb888,
    /// 8-bit luminance
    Grayscale,
    /// Packed YUYV 4:2:2
    Yuv422,
}

impl PixelFormat {
    /// Bytes per pixel for uncompressed formats, `None` for JPEG.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Jpeg => None,
            PixelFormat::Rgb565 => Some(2),
            PixelFormat::Rgb888 => Some(3),
            PixelFormat::Grayscale => Some(1),
            PixelFormat::Yuv422 => Some(2),
        }
    }
}

/// One raw capture from the sensor.
///
/// The buffer is immutable after capture. Ownership stays with the capture
/// subsystem until the frame is handed to exactly one encoder or consumer,
/// see [`FrameLease`](crate::capture::FrameLease).
#[derive(Debug)]
pub struct Frame {
    /// Frame buffer (reference-counted, never mutated)
    pub data: Bytes,

    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    /// Pixel layout of `data`
    pub format: PixelFormat,

    /// Monotonic capture counter assigned by the source
    pub sequence: u64,
}

impl Frame {
    /// Create a new frame
    pub fn new(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        Self { data: data.into(), width, height, format, sequence }
    }

    /// Length of the frame buffer in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the frame buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the sensor already delivered JPEG data
    pub fn is_jpeg(&self) -> bool {
        self.format == PixelFormat::Jpeg
    }

    /// Expected buffer length for uncompressed formats.
    pub fn expected_len(&self) -> Option<usize> {
        self.format
            .bytes_per_pixel()
            .map(|bpp| self.width as usize * self.height as usize * bpp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_len_follows_pixel_format() {
        let rgb565 = Frame::new(vec![0u8; 160 * 120 * 2], 160, 120, PixelFormat::Rgb565, 1);
        assert_eq!(rgb565.expected_len(), Some(rgb565.len()));

        let jpeg = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9], 160, 120, PixelFormat::Jpeg, 2);
        assert_eq!(jpeg.expected_len(), None);
        assert!(jpeg.is_jpeg());
    }

    #[test]
    fn pixel_format_uses_snake_case_names() {
        let yaml = serde_yaml_ng::to_string(&PixelFormat::Rgb565).unwrap();
        assert_eq!(yaml.trim(), "rgb565");
    }
}
