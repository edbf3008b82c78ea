//! Synthetic capture source for `stub://` URIs.
//!
//! Renders a noisy gray background with a red disc drifting across the frame, then
//! packs it into the configured raw pixel format. Sensor noise comes from a seeded
//! RNG so runs are reproducible. The URI query can inject faults:
//!
//! - `fail=5,17`: frames 5 and 17 are delivered as failed grabs
//! - `fault=40`: the device disappears when frame 40 is due
//! - `fps=0`: no pacing, frames are produced as fast as they are requested
//! - `format=yuyv`, `seed=7`

use std::io::Cursor;
use std::time::{Duration, Instant};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{CaptureOutcome, CaptureSettings, CaptureSource, DeviceInfo};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::PixelFormat;

/// Error code reported for injected per-frame failures.
pub const SYNTHETIC_FAILURE_CODE: u32 = 0xE100_0014;

const BACKGROUND: u8 = 90;
const NOISE: i16 = 8;
/// Disc colour in BGR order. Hue 0, well inside the default threshold.
const DISC_BGR: [u8; 3] = [30, 30, 200];

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Frames per second. 0 disables pacing.
    pub target_fps: u32,
    pub seed: u64,
    /// Frame numbers (1-based) delivered as failed grabs.
    pub fail_at: Vec<u64>,
    /// Frame number at which the device faults.
    pub fault_at: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub://camera".to_string(),
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Bgr8,
            target_fps: 30,
            seed: 0x5eed,
            fail_at: Vec::new(),
            fault_at: None,
        }
    }
}

impl SyntheticConfig {
    pub fn from_uri(uri: &str, settings: &CaptureSettings) -> PipelineResult<Self> {
        let (name, query) = match uri.split_once('?') {
            Some((name, query)) => (name, query),
            None => (uri, ""),
        };
        let mut config = Self {
            name: name.to_string(),
            width: settings.width,
            height: settings.height,
            pixel_format: settings.pixel_format,
            target_fps: settings.target_fps,
            ..Self::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bad_query(uri, pair))?;
            match key {
                "fail" => {
                    config.fail_at = value
                        .split(',')
                        .filter(|v| !v.is_empty())
                        .map(|v| v.parse::<u64>().map_err(|_| bad_query(uri, pair)))
                        .collect::<PipelineResult<Vec<_>>>()?;
                }
                "fault" => config.fault_at = Some(value.parse().map_err(|_| bad_query(uri, pair))?),
                "fps" => config.target_fps = value.parse().map_err(|_| bad_query(uri, pair))?,
                "seed" => config.seed = value.parse().map_err(|_| bad_query(uri, pair))?,
                "format" => {
                    config.pixel_format =
                        PixelFormat::parse(value).ok_or_else(|| bad_query(uri, pair))?
                }
                _ => return Err(bad_query(uri, pair)),
            }
        }
        Ok(config)
    }
}

fn bad_query(uri: &str, pair: &str) -> PipelineError {
    PipelineError::Config(format!("invalid stub parameter {:?} in {}", pair, uri))
}

pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    frame_count: u64,
    next_due: Option<Instant>,
    scene: Vec<u8>,
    opened: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            frame_count: 0,
            next_due: None,
            scene: Vec::new(),
            opened: false,
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn frame_interval(&self) -> Option<Duration> {
        if self.config.target_fps == 0 {
            None
        } else {
            Some(Duration::from_secs(1) / self.config.target_fps)
        }
    }

    /// Sleep until the next frame is due, like a free-running sensor.
    fn pace(&mut self) {
        let Some(interval) = self.frame_interval() else {
            return;
        };
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }

    /// Render the current scene into `self.scene` as packed BGR.
    fn render_scene(&mut self) {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        self.scene.resize(w * h * 3, 0);

        let radius = (w.min(h) / 8).max(1) as i64;
        let step = (w / 50).max(1) as u64;
        let cx = ((self.frame_count * step) % w as u64) as i64;
        let cy = (h / 2) as i64;

        for y in 0..h {
            for x in 0..w {
                let offset = (y * w + x) * 3;
                let dx = x as i64 - cx;
                let dy = y as i64 - cy;
                if dx * dx + dy * dy <= radius * radius {
                    self.scene[offset..offset + 3].copy_from_slice(&DISC_BGR);
                } else {
                    let noise = self.rng.gen_range(-NOISE..=NOISE);
                    let value = (BACKGROUND as i16 + noise).clamp(0, 255) as u8;
                    self.scene[offset..offset + 3].fill(value);
                }
            }
        }
    }

    fn pack(&self, out: &mut [u8]) -> Result<usize, String> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let scene = &self.scene;
        match self.config.pixel_format {
            PixelFormat::Bgr8 => copy_into(out, scene),
            PixelFormat::Rgb8 => {
                let rgb: Vec<u8> = scene.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect();
                copy_into(out, &rgb)
            }
            PixelFormat::Mono8 => {
                let mono: Vec<u8> = scene.chunks_exact(3).map(|p| luma(p[2], p[1], p[0])).collect();
                copy_into(out, &mono)
            }
            PixelFormat::Yuyv => {
                let mut packed = Vec::with_capacity(w * h * 2);
                for pair in scene.chunks_exact(6) {
                    let (y0, u0, v0) = bgr_to_yuv(&pair[0..3]);
                    let (y1, u1, v1) = bgr_to_yuv(&pair[3..6]);
                    packed.extend_from_slice(&[y0, avg(u0, u1), y1, avg(v0, v1)]);
                }
                copy_into(out, &packed)
            }
            PixelFormat::Nv12 => {
                let mut planes = vec![0u8; w * h + w * h / 2];
                for (i, px) in scene.chunks_exact(3).enumerate() {
                    planes[i] = bgr_to_yuv(px).0;
                }
                for j in (0..h).step_by(2) {
                    for i in (0..w).step_by(2) {
                        let (_, u, v) = bgr_to_yuv(&scene[(j * w + i) * 3..(j * w + i) * 3 + 3]);
                        let uv = w * h + (j / 2) * w + i;
                        if uv + 1 < planes.len() {
                            planes[uv] = u;
                            planes[uv + 1] = v;
                        }
                    }
                }
                copy_into(out, &planes)
            }
            PixelFormat::BayerRg8 => {
                let mut mosaic = vec![0u8; w * h];
                for y in 0..h {
                    for x in 0..w {
                        let px = &scene[(y * w + x) * 3..(y * w + x) * 3 + 3];
                        mosaic[y * w + x] = match (y % 2, x % 2) {
                            (0, 0) => px[2],
                            (1, 1) => px[0],
                            _ => px[1],
                        };
                    }
                }
                copy_into(out, &mosaic)
            }
            PixelFormat::Mjpeg => {
                let rgb: Vec<u8> = scene.chunks_exact(3).flat_map(|p| [p[2], p[1], p[0]]).collect();
                let mut jpeg = Cursor::new(Vec::new());
                JpegEncoder::new_with_quality(&mut jpeg, 90)
                    .encode(&rgb, w as u32, h as u32, ExtendedColorType::Rgb8)
                    .map_err(|e| format!("jpeg encode: {}", e))?;
                copy_into(out, jpeg.get_ref())
            }
            PixelFormat::Unknown(_) => {
                // Emit something of plausible size; conversion rejects it downstream.
                copy_into(out, &scene[..scene.len().min(out.len())])
            }
        }
    }
}

impl CaptureSource for SyntheticSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn open(&mut self) -> PipelineResult<DeviceInfo> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(PipelineError::DeviceError(format!(
                "{}: invalid geometry {}x{}",
                self.config.name, self.config.width, self.config.height
            )));
        }
        if self.config.pixel_format == PixelFormat::Nv12
            && (self.config.width % 2 != 0 || self.config.height % 2 != 0)
        {
            return Err(PipelineError::DeviceError(format!(
                "{}: NV12 needs even dimensions",
                self.config.name
            )));
        }
        let raw = self.config.width as usize * self.config.height as usize * 3;
        let max_frame_bytes = self
            .config
            .pixel_format
            .frame_bytes(self.config.width, self.config.height)
            .unwrap_or(raw + 4096);

        self.opened = true;
        self.next_due = None;
        log::info!("SyntheticSource: opened {} (synthetic)", self.config.name);
        Ok(DeviceInfo {
            vendor: "Synthetic".to_string(),
            model: self.config.name.clone(),
            width: self.config.width,
            height: self.config.height,
            pixel_format: self.config.pixel_format,
            max_frame_bytes,
        })
    }

    fn grab_into(&mut self, buf: &mut [u8]) -> PipelineResult<CaptureOutcome> {
        if !self.opened {
            return Err(PipelineError::DeviceError(format!(
                "{} is not open",
                self.config.name
            )));
        }
        self.pace();
        self.frame_count += 1;

        if self.config.fault_at.is_some_and(|n| self.frame_count >= n) {
            return Err(PipelineError::DeviceError(format!(
                "{}: device removed at frame {}",
                self.config.name, self.frame_count
            )));
        }

        self.render_scene();
        if self.config.fail_at.contains(&self.frame_count) {
            return Ok(CaptureOutcome::Failed {
                code: SYNTHETIC_FAILURE_CODE,
                description: format!("buffer incompletely grabbed (frame {})", self.frame_count),
            });
        }

        match self.pack(buf) {
            Ok(len) => Ok(CaptureOutcome::Frame {
                len,
                width: self.config.width,
                height: self.config.height,
            }),
            Err(description) => Ok(CaptureOutcome::Failed {
                code: SYNTHETIC_FAILURE_CODE,
                description,
            }),
        }
    }

    fn close(&mut self) {
        if self.opened {
            log::info!(
                "SyntheticSource: closed {} after {} frames",
                self.config.name,
                self.frame_count
            );
        }
        self.opened = false;
    }
}

fn copy_into(out: &mut [u8], src: &[u8]) -> Result<usize, String> {
    let out_len = out.len();
    let dst = out
        .get_mut(..src.len())
        .ok_or_else(|| format!("frame of {} bytes exceeds buffer of {}", src.len(), out_len))?;
    dst.copy_from_slice(src);
    Ok(src.len())
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

fn bgr_to_yuv(px: &[u8]) -> (u8, u8, u8) {
    let (b, g, r) = (px[0] as f32, px[1] as f32, px[2] as f32);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
    let to_u8 = |value: f32| value.round().clamp(0.0, 255.0) as u8;
    (to_u8(y), to_u8(u), to_u8(v))
}

fn avg(a: u8, b: u8) -> u8 {
    ((a as u16 + b as u16 + 1) / 2) as u8
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
