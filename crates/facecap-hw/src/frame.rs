//! Frame type and pixel conversion — YUYV/GREY/MJPG to RGB, dark detection, JPEG output.

use image::{ColorType, ImageFormat};
use std::path::Path;

/// A captured camera frame in packed RGB8.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Build a frame from RGB bytes, checking the buffer matches the dimensions.
    pub fn from_rgb(
        data: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u32,
    ) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// True when more than 95% of pixels fall in the darkest luma bucket.
    pub fn is_dark(&self) -> bool {
        is_dark_frame(&self.data, 0.95)
    }

    /// Encode the frame as JPEG and write it to `path`.
    pub fn save_jpeg(&self, path: &Path) -> Result<(), FrameError> {
        let expected = rgb_len(self.width, self.height);
        if self.data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.data.len(),
            });
        }
        image::save_buffer_with_format(
            path,
            &self.data,
            self.width,
            self.height,
            ColorType::Rgb8,
            ImageFormat::Jpeg,
        )
        .map_err(FrameError::Encode)?;
        tracing::debug!(path = %path.display(), seq = self.sequence, "wrote frame");
        Ok(())
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

/// Integer BT.601 luma.
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 77 + g as u32 * 150 + b as u32 * 29) >> 8) as u8
}

/// Convert packed YUYV (4:2:2) to RGB8 using the BT.601 integer transform.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let clamp = |v: i32| -> u8 { v.clamp(0, 255) as u8 };
    let mut rgb = Vec::with_capacity(rgb_len(width, height));

    for quad in yuyv[..expected].chunks_exact(4) {
        let u = quad[1] as i32 - 128;
        let v = quad[3] as i32 - 128;
        for y in [quad[0], quad[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp((c + 409 * v + 128) >> 8));
            rgb.push(clamp((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp((c + 516 * u + 128) >> 8));
        }
    }

    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB8.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    if gray.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: gray.len(),
        });
    }
    Ok(gray[..pixels].iter().flat_map(|&g| [g, g, g]).collect())
}

/// Decode a motion-JPEG buffer into RGB8, returning the decoded dimensions.
pub fn mjpeg_to_rgb(mjpg: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let decoded = image::load_from_memory_with_format(mjpg, ImageFormat::Jpeg)
        .map_err(FrameError::Decode)?
        .to_rgb8();
    let (w, h) = decoded.dimensions();
    Ok((decoded.into_raw(), w, h))
}

/// Check if an RGB buffer is dark.
///
/// Returns true if more than `threshold_pct` of pixels have luma below 32.
pub fn is_dark_frame(rgb: &[u8], threshold_pct: f32) -> bool {
    let pixels = rgb.len() / 3;
    if pixels == 0 {
        return true;
    }
    let dark_count = rgb
        .chunks_exact(3)
        .filter(|px| luma(px[0], px[1], px[2]) < 32)
        .count();
    (dark_count as f32 / pixels as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG decode failed: {0}")]
    Decode(image::ImageError),
    #[error("JPEG encode failed: {0}")]
    Encode(image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_black_and_white() {
        // 2x1 image: Y0=16 (black), Y1=235 (white), neutral chroma
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![0, 0, 0, 255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma_is_gray() {
        let yuyv = vec![126, 128, 126, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert!(rgb.iter().all(|&c| c == rgb[0]));
    }

    #[test]
    fn test_yuyv_to_rgb_red_chroma() {
        // Strong V pushes red up and green down.
        let yuyv = vec![81, 90, 81, 240];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert!(rgb[0] > 200, "red channel: {}", rgb[0]);
        assert!(rgb[1] < 50, "green channel: {}", rgb[1]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[10, 200], 2, 1).unwrap();
        assert_eq!(rgb, vec![10, 10, 10, 200, 200, 200]);
    }

    #[test]
    fn test_grey_to_rgb_too_short() {
        assert!(grey_to_rgb(&[10], 2, 1).is_err());
    }

    #[test]
    fn test_mjpeg_to_rgb_decodes_dimensions() {
        let img = image::RgbImage::from_pixel(8, 4, image::Rgb([120, 60, 30]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();

        let (rgb, w, h) = mjpeg_to_rgb(buf.get_ref()).unwrap();
        assert_eq!((w, h), (8, 4));
        assert_eq!(rgb.len(), 8 * 4 * 3);
    }

    #[test]
    fn test_mjpeg_to_rgb_garbage() {
        assert!(matches!(mjpeg_to_rgb(&[0, 1, 2, 3]), Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&[0u8; 300], 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&[128u8; 300], 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_from_rgb_rejects_wrong_length() {
        assert!(Frame::from_rgb(vec![0; 5], 2, 1, 0).is_err());
        assert!(Frame::from_rgb(vec![0; 6], 2, 1, 0).is_ok());
    }

    #[test]
    fn test_save_jpeg_roundtrips_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captured_image_1.jpg");
        let frame = Frame::from_rgb(vec![90; 16 * 8 * 3], 16, 8, 1).unwrap();

        frame.save_jpeg(&path).unwrap();

        let reread = image::open(&path).unwrap();
        assert_eq!((reread.width(), reread.height()), (16, 8));
    }
}
