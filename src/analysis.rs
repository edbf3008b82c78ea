//! Colour-range analysis: blur, convert to HSV, threshold.
//!
//! Output is a binary mask (255 inside the HSV box, 0 outside). All arithmetic is
//! fixed given the parameters, so identical frames always give identical masks.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, Mask, PixelFormat};

/// 8-bit HSV triple: hue 0..=179 (degrees / 2), saturation and value 0..=255.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hsv {
    pub h: u8,
    pub s: u8,
    pub v: u8,
}

impl Hsv {
    pub const fn new(h: u8, s: u8, v: u8) -> Self {
        Self { h, s, v }
    }
}

impl From<[u8; 3]> for Hsv {
    fn from(value: [u8; 3]) -> Self {
        Self::new(value[0], value[1], value[2])
    }
}

pub const DEFAULT_BLUR_KERNEL: u32 = 5;
/// Saturated reds.
pub const DEFAULT_HSV_LOWER: Hsv = Hsv::new(0, 100, 30);
pub const DEFAULT_HSV_UPPER: Hsv = Hsv::new(5, 255, 255);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnalysisParams {
    /// Gaussian kernel size, odd.
    pub blur_kernel: u32,
    pub lower: Hsv,
    pub upper: Hsv,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            blur_kernel: DEFAULT_BLUR_KERNEL,
            lower: DEFAULT_HSV_LOWER,
            upper: DEFAULT_HSV_UPPER,
        }
    }
}

impl AnalysisParams {
    pub fn validate(&self) -> PipelineResult<()> {
        if self.blur_kernel == 0 || self.blur_kernel % 2 == 0 {
            return Err(PipelineError::Config(format!(
                "blur kernel must be odd and positive, got {}",
                self.blur_kernel
            )));
        }
        if self.lower.h > 179 || self.upper.h > 179 {
            return Err(PipelineError::Config("hue bounds must be within 0..=179".into()));
        }
        if self.lower.h > self.upper.h || self.lower.s > self.upper.s || self.lower.v > self.upper.v {
            return Err(PipelineError::Config(format!(
                "lower HSV bound {:?} exceeds upper bound {:?}",
                self.lower, self.upper
            )));
        }
        Ok(())
    }
}

pub struct AnalysisStage {
    params: AnalysisParams,
    kernel: Vec<f32>,
}

impl AnalysisStage {
    pub fn new(params: AnalysisParams) -> PipelineResult<Self> {
        params.validate()?;
        Ok(Self {
            kernel: gaussian_kernel(params.blur_kernel),
            params,
        })
    }

    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    pub fn analyze(&self, frame: &Frame) -> PipelineResult<Mask> {
        let (w, h) = (frame.width as usize, frame.height as usize);
        let expected = w.checked_mul(h).and_then(|n| n.checked_mul(3));
        if w == 0 || h == 0 || expected != Some(frame.data().len()) {
            return Err(PipelineError::InvalidDimensions(format!(
                "{}x{} frame carries {} bytes",
                frame.width,
                frame.height,
                frame.data().len()
            )));
        }
        let red_first = match frame.format {
            PixelFormat::Rgb8 => true,
            PixelFormat::Bgr8 => false,
            other => {
                return Err(PipelineError::UnsupportedFormat {
                    from: other,
                    to: PixelFormat::Bgr8,
                })
            }
        };

        let smoothed = self.blur(frame.data(), w, h);
        let (lo, hi) = (self.params.lower, self.params.upper);
        let data = smoothed
            .chunks_exact(3)
            .map(|px| {
                let (r, g, b) = if red_first {
                    (px[0], px[1], px[2])
                } else {
                    (px[2], px[1], px[0])
                };
                let hsv = rgb_to_hsv(r, g, b);
                let inside = (lo.h..=hi.h).contains(&hsv.h)
                    && (lo.s..=hi.s).contains(&hsv.s)
                    && (lo.v..=hi.v).contains(&hsv.v);
                if inside {
                    255
                } else {
                    0
                }
            })
            .collect();

        let mut mask = Mask::new(data, frame.width, frame.height)?;
        mask.sequence = frame.sequence;
        mask.timestamp = frame.timestamp;
        Ok(mask)
    }

    /// Separable Gaussian over interleaved 3-channel data, reflect-101 borders.
    fn blur(&self, data: &[u8], w: usize, h: usize) -> Vec<u8> {
        let radius = (self.kernel.len() / 2) as isize;
        let mut horizontal = vec![0f32; data.len()];
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    let mut acc = 0f32;
                    for (k, weight) in self.kernel.iter().enumerate() {
                        let sx = reflect101(x as isize + k as isize - radius, w);
                        acc += weight * data[(y * w + sx) * 3 + c] as f32;
                    }
                    horizontal[(y * w + x) * 3 + c] = acc;
                }
            }
        }

        let mut out = vec![0u8; data.len()];
        for y in 0..h {
            for x in 0..w {
                for c in 0..3 {
                    let mut acc = 0f32;
                    for (k, weight) in self.kernel.iter().enumerate() {
                        let sy = reflect101(y as isize + k as isize - radius, h);
                        acc += weight * horizontal[(sy * w + x) * 3 + c];
                    }
                    out[(y * w + x) * 3 + c] = acc.round().clamp(0.0, 255.0) as u8;
                }
            }
        }
        out
    }
}

/// Normalised 1-D Gaussian; sigma derived from the size the usual way for
/// "sigma = 0" kernels.
fn gaussian_kernel(size: u32) -> Vec<f32> {
    let size = size.max(1) as usize;
    let sigma = 0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let centre = (size / 2) as f64;
    let raw: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - centre;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = raw.iter().sum();
    raw.iter().map(|v| (v / sum) as f32).collect()
}

/// Mirror an index into 0..n without repeating the edge pixel (`dcb|abcd|cba`).
fn reflect101(mut i: isize, n: usize) -> usize {
    let n = n as isize;
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}

pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> Hsv {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let diff = (max - min) as f32;
    let v = max;
    let s = if max == 0 {
        0
    } else {
        (255.0 * diff / max as f32).round() as u8
    };
    if diff == 0.0 {
        return Hsv::new(0, s, v);
    }
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let mut degrees = if max as f32 == r {
        60.0 * (g - b) / diff
    } else if max as f32 == g {
        120.0 + 60.0 * (b - r) / diff
    } else {
        240.0 + 60.0 * (r - g) / diff
    };
    if degrees < 0.0 {
        degrees += 360.0;
    }
    let h = (degrees / 2.0).round() as u16 % 180;
    Hsv::new(h as u8, s, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, bgr: [u8; 3]) -> Frame {
        let data = bgr.repeat((width * height) as usize);
        Frame::new(data, width, height, PixelFormat::Bgr8).unwrap()
    }

    #[test]
    fn kernel_is_normalised_and_symmetric() {
        let kernel = gaussian_kernel(5);
        assert_eq!(kernel.len(), 5);
        assert!((kernel.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(kernel[0], kernel[4]);
        assert!(kernel[2] > kernel[1]);
    }

    #[test]
    fn reflect101_mirrors_without_edge_repeat() {
        assert_eq!(reflect101(-1, 5), 1);
        assert_eq!(reflect101(-2, 5), 2);
        assert_eq!(reflect101(5, 5), 3);
        assert_eq!(reflect101(6, 5), 2);
        assert_eq!(reflect101(3, 1), 0);
    }

    #[test]
    fn hsv_matches_8bit_convention() {
        assert_eq!(rgb_to_hsv(255, 0, 0), Hsv::new(0, 255, 255));
        assert_eq!(rgb_to_hsv(0, 255, 0), Hsv::new(60, 255, 255));
        assert_eq!(rgb_to_hsv(0, 0, 255), Hsv::new(120, 255, 255));
        assert_eq!(rgb_to_hsv(90, 90, 90), Hsv::new(0, 0, 90));
    }

    #[test]
    fn red_frame_is_fully_masked() {
        let stage = AnalysisStage::new(AnalysisParams::default()).unwrap();
        let mask = stage.analyze(&solid(8, 6, [30, 30, 200])).unwrap();
        assert_eq!(mask.set_pixels(), 48);
    }

    #[test]
    fn gray_and_green_frames_are_empty() {
        let stage = AnalysisStage::new(AnalysisParams::default()).unwrap();
        assert_eq!(stage.analyze(&solid(8, 6, [90, 90, 90])).unwrap().set_pixels(), 0);
        assert_eq!(stage.analyze(&solid(8, 6, [0, 200, 0])).unwrap().set_pixels(), 0);
    }

    #[test]
    fn dark_red_is_below_value_bound() {
        let stage = AnalysisStage::new(AnalysisParams::default()).unwrap();
        let mask = stage.analyze(&solid(4, 4, [0, 0, 20])).unwrap();
        assert_eq!(mask.set_pixels(), 0);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let stage = AnalysisStage::new(AnalysisParams::default()).unwrap();
        let mut frame = solid(4, 4, [0, 0, 200]);
        frame.width = 5;
        assert_eq!(stage.analyze(&frame).unwrap_err().code(), "INVALID_DIMENSIONS");
    }

    #[test]
    fn invalid_params_are_rejected() {
        let even = AnalysisParams {
            blur_kernel: 4,
            ..AnalysisParams::default()
        };
        assert!(AnalysisStage::new(even).is_err());
        let inverted = AnalysisParams {
            lower: Hsv::new(10, 0, 0),
            upper: Hsv::new(5, 255, 255),
            ..AnalysisParams::default()
        };
        assert!(AnalysisStage::new(inverted).is_err());
    }
}
