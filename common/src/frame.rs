use chrono::Utc;

/// Byte order of the three colour channels in a frame's pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Blue, green, red. What OpenCV capture devices hand out.
    Bgr8,
    Rgb8,
}

/// A raw camera frame with capture metadata.
///
/// Pixels are tightly packed, row-major, three bytes per pixel in the order
/// given by `layout`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    pub pixels: Vec<u8>,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, layout: PixelLayout, pixels: Vec<u8>, seq: u64) -> Self {
        Self {
            width,
            height,
            layout,
            pixels,
            captured_at_ms: Utc::now().timestamp_millis(),
            seq,
        }
    }

    /// Number of bytes the pixel buffer must hold for the frame dimensions.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    pub fn check(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Malformed(format!(
                "zero dimension {}x{}",
                self.width, self.height
            )));
        }
        if self.pixels.len() != self.expected_len() {
            return Err(FrameError::Malformed(format!(
                "pixel buffer holds {} bytes, {}x{} needs {}",
                self.pixels.len(),
                self.width,
                self.height,
                self.expected_len()
            )));
        }
        Ok(())
    }

    /// Pixel buffer reordered to RGB.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self.layout {
            PixelLayout::Rgb8 => self.pixels.clone(),
            PixelLayout::Bgr8 => {
                let mut rgb = Vec::with_capacity(self.pixels.len());
                for px in self.pixels.chunks_exact(3) {
                    rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                }
                rgb
            }
        }
    }
}

/// A frame compressed and text-encoded for embedding in a JSON request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    /// Base64 (standard alphabet) of the JPEG bytes.
    pub base64: String,
    pub width: u32,
    pub height: u32,
    /// Sequence number of the frame this image was derived from.
    pub seq: u64,
}

impl EncodedImage {
    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", self.base64)
    }

    pub fn payload_size(&self) -> usize {
        self.base64.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("failed to compress frame: {0}")]
    Compress(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgr_is_swapped_to_rgb() {
        let frame = Frame::new(2, 1, PixelLayout::Bgr8, vec![1, 2, 3, 4, 5, 6], 0);
        assert_eq!(frame.to_rgb(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn rgb_passes_through() {
        let frame = Frame::new(1, 1, PixelLayout::Rgb8, vec![9, 8, 7], 0);
        assert_eq!(frame.to_rgb(), vec![9, 8, 7]);
    }

    #[test]
    fn short_buffer_is_malformed() {
        let frame = Frame::new(4, 4, PixelLayout::Rgb8, vec![0; 10], 0);
        assert!(matches!(frame.check(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn zero_dimension_is_malformed() {
        let frame = Frame::new(0, 4, PixelLayout::Rgb8, Vec::new(), 0);
        assert!(matches!(frame.check(), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn data_url_has_jpeg_prefix() {
        let image = EncodedImage {
            base64: "AAAA".into(),
            width: 1,
            height: 1,
            seq: 3,
        };
        assert_eq!(image.data_url(), "data:image/jpeg;base64,AAAA");
    }
}
