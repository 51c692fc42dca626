use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use tracing::debug;

use crate::config::EncoderConfig;
use crate::frame::{EncodedImage, Frame, FrameError};

/// Turns raw frames into the JPEG/base64 payload the vision service accepts.
///
/// Steps, in order: reorder channels to RGB, shrink so that neither side
/// exceeds `max_dimension` (Lanczos3, aspect ratio kept), compress to JPEG at
/// `jpeg_quality`, base64-encode. Output is a pure function of the frame and
/// the settings.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    max_dimension: u32,
    jpeg_quality: u8,
}

impl FrameEncoder {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            max_dimension: config.max_dimension.max(1),
            jpeg_quality: config.jpeg_quality.clamp(1, 100),
        }
    }

    pub fn encode(&self, frame: &Frame) -> Result<EncodedImage, FrameError> {
        frame.check()?;

        let rgb = RgbImage::from_raw(frame.width, frame.height, frame.to_rgb()).ok_or_else(
            || FrameError::Malformed("pixel buffer does not fit frame dimensions".into()),
        )?;

        let (width, height) = bounded_dimensions(frame.width, frame.height, self.max_dimension);
        let image = if (width, height) != (frame.width, frame.height) {
            image::imageops::resize(&rgb, width, height, FilterType::Lanczos3)
        } else {
            rgb
        };

        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality)
            .encode_image(&image)
            .map_err(|e| FrameError::Compress(e.to_string()))?;

        debug!(
            seq = frame.seq,
            src_width = frame.width,
            src_height = frame.height,
            width,
            height,
            jpeg_bytes = jpeg.len(),
            "frame encoded"
        );

        Ok(EncodedImage {
            base64: STANDARD.encode(&jpeg),
            width,
            height,
            seq: frame.seq,
        })
    }
}

/// Target size for a `width`x`height` image so the longer side is at most
/// `max`. Images already within bounds are returned unchanged.
pub fn bounded_dimensions(width: u32, height: u32, max: u32) -> (u32, u32) {
    if width <= max && height <= max {
        return (width, height);
    }
    let scale = |short: u32, long: u32| -> u32 {
        let scaled = (short as f64 * max as f64 / long as f64).round() as u32;
        scaled.clamp(1, max)
    };
    if width >= height {
        (max, scale(height, width))
    } else {
        (scale(width, height), max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelLayout;

    fn gradient(width: u32, height: u32, layout: PixelLayout) -> Frame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.push((x % 256) as u8);
                pixels.push((y % 256) as u8);
                pixels.push(((x + y) % 256) as u8);
            }
        }
        Frame::new(width, height, layout, pixels, 7)
    }

    fn encoder() -> FrameEncoder {
        FrameEncoder::new(&EncoderConfig::default())
    }

    fn decode(image: &EncodedImage) -> image::DynamicImage {
        let jpeg = STANDARD.decode(&image.base64).unwrap();
        image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap()
    }

    #[test]
    fn encoding_is_deterministic() {
        let frame = gradient(640, 480, PixelLayout::Bgr8);
        let a = encoder().encode(&frame).unwrap();
        let b = encoder().encode(&frame).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn vga_frame_is_downscaled_to_512_wide() {
        let encoded = encoder().encode(&gradient(640, 480, PixelLayout::Bgr8)).unwrap();
        assert_eq!((encoded.width, encoded.height), (512, 384));
        let decoded = decode(&encoded);
        assert_eq!((decoded.width(), decoded.height()), (512, 384));
        assert_eq!(encoded.seq, 7);
    }

    #[test]
    fn small_frame_keeps_its_size() {
        let encoded = encoder().encode(&gradient(320, 240, PixelLayout::Rgb8)).unwrap();
        assert_eq!((encoded.width, encoded.height), (320, 240));
    }

    #[test]
    fn bounded_dimensions_never_exceed_max_and_keep_aspect() {
        let cases = [
            (640, 480),
            (1920, 1080),
            (1080, 1920),
            (513, 512),
            (4000, 3),
            (3, 4000),
            (800, 800),
            (1000, 200),
        ];
        for (w, h) in cases {
            let (nw, nh) = bounded_dimensions(w, h, 512);
            assert!(nw <= 512 && nh <= 512, "{w}x{h} -> {nw}x{nh}");
            assert!(nw >= 1 && nh >= 1);
            assert_eq!(nw.max(nh), 512, "longer side should hit the max for {w}x{h}");
            let (short, long, nshort) = if w >= h { (h, w, nh) } else { (w, h, nw) };
            let exact = short as f64 * 512.0 / long as f64;
            assert!(
                (nshort as f64 - exact).abs() <= 1.0,
                "{w}x{h} -> {nw}x{nh} drifts from aspect ratio"
            );
        }
    }

    #[test]
    fn channel_order_is_fixed_before_compression() {
        // pure blue in BGR must come out blue, not red
        let frame = Frame::new(8, 8, PixelLayout::Bgr8, [255u8, 0, 0].repeat(64), 0);
        let rgb = decode(&encoder().encode(&frame).unwrap()).to_rgb8();
        let px = rgb.get_pixel(4, 4).0;
        assert!(px[2] > 200 && px[0] < 60, "expected blue, got {px:?}");
    }

    #[test]
    fn malformed_frame_is_rejected() {
        let frame = Frame::new(10, 10, PixelLayout::Rgb8, vec![0; 12], 0);
        assert!(matches!(encoder().encode(&frame), Err(FrameError::Malformed(_))));
    }
}
