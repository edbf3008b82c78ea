//! Raw sensor formats to a canonical 3-channel layout.
//!
//! Conversion always writes into a freshly allocated `Frame`, so the pool buffer
//! behind the `GrabResult` can be released as soon as `convert` returns.

use image::ImageFormat;

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, GrabResult, PixelFormat};

#[derive(Clone, Copy, Debug)]
pub struct FrameConverter {
    target: PixelFormat,
}

impl Default for FrameConverter {
    fn default() -> Self {
        Self {
            target: PixelFormat::Bgr8,
        }
    }
}

impl FrameConverter {
    /// `target` must be `Bgr8` or `Rgb8`.
    pub fn new(target: PixelFormat) -> PipelineResult<Self> {
        if !target.is_canonical() {
            return Err(PipelineError::UnsupportedFormat {
                from: target,
                to: target,
            });
        }
        Ok(Self { target })
    }

    pub fn target(&self) -> PixelFormat {
        self.target
    }

    pub fn convert(&self, grab: &GrabResult) -> PipelineResult<Frame> {
        let pixels = grab.payload()?;
        let data = self.convert_raw(pixels, grab.width(), grab.height(), grab.pixel_format())?;
        Ok(Frame::new(data, grab.width(), grab.height(), self.target)?
            .with_origin(grab.sequence(), grab.timestamp()))
    }

    pub fn convert_raw(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> PipelineResult<Vec<u8>> {
        if format == self.target {
            expect_len(pixels, width, height, format)?;
            return Ok(pixels.to_vec());
        }
        let mut rgb = match format {
            PixelFormat::Rgb8 => {
                expect_len(pixels, width, height, format)?;
                pixels.to_vec()
            }
            PixelFormat::Bgr8 => {
                expect_len(pixels, width, height, format)?;
                let mut rgb = pixels.to_vec();
                swap_red_blue(&mut rgb);
                rgb
            }
            PixelFormat::Mono8 => {
                expect_len(pixels, width, height, format)?;
                pixels.iter().flat_map(|&v| [v, v, v]).collect()
            }
            PixelFormat::Yuyv => yuyv_to_rgb(pixels, width, height)?,
            PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height)?,
            PixelFormat::BayerRg8 => bayer_rggb_to_rgb(pixels, width, height)?,
            PixelFormat::Mjpeg => mjpeg_to_rgb(pixels, width, height)?,
            PixelFormat::Unknown(_) => {
                return Err(PipelineError::UnsupportedFormat {
                    from: format,
                    to: self.target,
                })
            }
        };
        if self.target == PixelFormat::Bgr8 {
            swap_red_blue(&mut rgb);
        }
        Ok(rgb)
    }
}

fn expect_len(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> PipelineResult<usize> {
    let expected = format.frame_bytes(width, height).ok_or_else(|| {
        PipelineError::InvalidDimensions(format!("{} frame dimensions overflow", format))
    })?;
    if pixels.len() != expected {
        return Err(PipelineError::InvalidDimensions(format!(
            "{} frame length mismatch: expected {}, got {}",
            format,
            expected,
            pixels.len()
        )));
    }
    Ok(expected)
}

fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_to_u8(y + 1.402_f32 * v),
        clamp_to_u8(y - 0.344_136_f32 * u - 0.714_136_f32 * v),
        clamp_to_u8(y + 1.772_f32 * u),
    ]
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> PipelineResult<Vec<u8>> {
    if width % 2 != 0 {
        return Err(PipelineError::InvalidDimensions(format!(
            "YUYV needs an even width, got {}",
            width
        )));
    }
    expect_len(pixels, width, height, PixelFormat::Yuyv)?;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for quad in pixels.chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> PipelineResult<Vec<u8>> {
    if width % 2 != 0 || height % 2 != 0 {
        return Err(PipelineError::InvalidDimensions(format!(
            "NV12 needs even dimensions, got {}x{}",
            width, height
        )));
    }
    expect_len(pixels, width, height, PixelFormat::Nv12)?;
    let w = width as usize;
    let h = height as usize;
    let y_plane = w * h;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let px = yuv_to_rgb(pixels[j * w + i], pixels[uv_index], pixels[uv_index + 1]);
            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&px);
        }
    }
    Ok(rgb)
}

/// Block demosaic: every pixel of a 2x2 RGGB cell takes the cell's red, blue and
/// mean green.
fn bayer_rggb_to_rgb(pixels: &[u8], width: u32, height: u32) -> PipelineResult<Vec<u8>> {
    expect_len(pixels, width, height, PixelFormat::BayerRg8)?;
    let w = width as usize;
    let h = height as usize;
    let at = |x: usize, y: usize| pixels[y.min(h - 1) * w + x.min(w - 1)];

    let mut rgb = vec![0u8; w * h * 3];
    for y in 0..h {
        for x in 0..w {
            let (cx, cy) = (x & !1, y & !1);
            let r = at(cx, cy);
            let g = ((at(cx + 1, cy) as u16 + at(cx, cy + 1) as u16 + 1) / 2) as u8;
            let b = at(cx + 1, cy + 1);
            let offset = (y * w + x) * 3;
            rgb[offset..offset + 3].copy_from_slice(&[r, g, b]);
        }
    }
    Ok(rgb)
}

fn mjpeg_to_rgb(pixels: &[u8], width: u32, height: u32) -> PipelineResult<Vec<u8>> {
    let decoded = image::load_from_memory_with_format(pixels, ImageFormat::Jpeg)
        .map_err(|e| PipelineError::InvalidDimensions(format!("undecodable MJPEG payload: {}", e)))?
        .to_rgb8();
    if decoded.width() != width || decoded.height() != height {
        return Err(PipelineError::InvalidDimensions(format!(
            "MJPEG payload is {}x{}, device reported {}x{}",
            decoded.width(),
            decoded.height(),
            width,
            height
        )));
    }
    Ok(decoded.into_raw())
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgb() -> FrameConverter {
        FrameConverter::new(PixelFormat::Rgb8).unwrap()
    }

    #[test]
    fn nv12_conversion_produces_gray() {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let out = rgb().convert_raw(&nv12, 2, 2, PixelFormat::Nv12).unwrap();
        assert_eq!(out, vec![128u8; 12]);
    }

    #[test]
    fn rgb_pass_through_validates_length() {
        let pixels = vec![1u8; 9];
        assert_eq!(rgb().convert_raw(&pixels, 1, 3, PixelFormat::Rgb8).unwrap(), pixels);
        let err = rgb().convert_raw(&pixels, 2, 3, PixelFormat::Rgb8).unwrap_err();
        assert_eq!(err.code(), "INVALID_DIMENSIONS");
    }

    #[test]
    fn bgr_target_swaps_channels() {
        let bgr = FrameConverter::new(PixelFormat::Bgr8).unwrap();
        let out = bgr.convert_raw(&[10, 20, 30], 1, 1, PixelFormat::Rgb8).unwrap();
        assert_eq!(out, vec![30, 20, 10]);
    }

    #[test]
    fn yuyv_neutral_chroma_is_gray() {
        let out = rgb().convert_raw(&[50, 128, 200, 128], 2, 1, PixelFormat::Yuyv).unwrap();
        assert_eq!(out, vec![50, 50, 50, 200, 200, 200]);
    }

    #[test]
    fn bayer_cell_spreads_to_all_four_pixels() {
        // R G
        // G B
        let mosaic = [200, 100, 120, 40];
        let out = rgb().convert_raw(&mosaic, 2, 2, PixelFormat::BayerRg8).unwrap();
        for px in out.chunks_exact(3) {
            assert_eq!(px, &[200, 110, 40]);
        }
    }

    #[test]
    fn unknown_fourcc_is_unsupported() {
        let err = rgb()
            .convert_raw(&[0; 8], 2, 2, PixelFormat::Unknown(*b"Y16 "))
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
    }

    #[test]
    fn non_canonical_target_is_rejected() {
        assert!(FrameConverter::new(PixelFormat::Yuyv).is_err());
    }
}
