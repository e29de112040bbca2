//! Frame type and YUYV to RGB conversion.

use thiserror::Error;

/// A captured RGB24 camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().map(|&b| b as f32).sum::<f32>() / self.data.len() as f32
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("YUYV requires an even width, got {0}")]
    OddWidth(u32),
}

/// Convert packed YUYV (4:2:2) to packed RGB24.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]. Both pixels of a
/// group share the chroma pair. Conversion uses the BT.601 limited
/// range coefficients.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    if width % 2 != 0 {
        return Err(FrameError::OddWidth(width));
    }
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for group in yuyv[..expected].chunks_exact(4) {
        push_rgb(&mut rgb, group[0], group[1], group[3]);
        push_rgb(&mut rgb, group[2], group[1], group[3]);
    }
    Ok(rgb)
}

fn push_rgb(rgb: &mut Vec<u8>, y: u8, u: u8, v: u8) {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    rgb.push(clamp_u8((298 * c + 409 * e + 128) >> 8));
    rgb.push(clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8));
    rgb.push(clamp_u8((298 * c + 516 * d + 128) >> 8));
}

fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
