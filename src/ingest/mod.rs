//! Capture sources.
//!
//! A source fills pool buffers on the acquisition engine's producer thread:
//! - Synthetic source (`stub://` URIs), always available
//! - USB/V4L2 devices (feature: capture-v4l2)
//!
//! The engine owns buffer management and the grab strategy. A source only has to:
//! - Report the device geometry and pixel format on `open`
//! - Write one frame into the buffer it is given, paced by its own timing
//! - Report per-frame failures as `CaptureOutcome::Failed` and reserve `Err` for
//!   faults that end the session

mod synthetic;
#[cfg(feature = "capture-v4l2")]
pub mod v4l2;

pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "capture-v4l2")]
pub use v4l2::V4l2Source;

use crate::error::{PipelineError, PipelineResult};
use crate::frame::PixelFormat;

/// What the device reports once opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Upper bound for one frame's payload; sizes the pool buffers.
    pub max_frame_bytes: usize,
}

/// Requested capture parameters. Devices may negotiate different values; the
/// `DeviceInfo` returned by `open` is authoritative.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub target_fps: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            pixel_format: PixelFormat::Bgr8,
            target_fps: 30,
        }
    }
}

/// Result of one grab into a pool buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// `len` bytes of the buffer hold a frame of the given geometry.
    Frame { len: usize, width: u32, height: u32 },
    /// The device delivered a broken frame. Acquisition continues.
    Failed { code: u32, description: String },
}

pub trait CaptureSource: Send {
    /// Source identifier for logs.
    fn name(&self) -> &str;

    fn open(&mut self) -> PipelineResult<DeviceInfo>;

    /// Block until the next frame is captured and write it into `buf`.
    ///
    /// `Err` is reserved for unrecoverable device faults.
    fn grab_into(&mut self, buf: &mut [u8]) -> PipelineResult<CaptureOutcome>;

    fn close(&mut self) {}
}

/// Build a source from a URI: `stub://<name>[?query]` or a device path.
pub fn open_source(uri: &str, settings: &CaptureSettings) -> PipelineResult<Box<dyn CaptureSource>> {
    if uri.trim().is_empty() {
        return Err(PipelineError::Config("capture source must not be empty".into()));
    }
    if uri.starts_with("stub://") {
        let config = SyntheticConfig::from_uri(uri, settings)?;
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    #[cfg(feature = "capture-v4l2")]
    {
        Ok(Box::new(V4l2Source::new(uri, settings.clone())))
    }
    #[cfg(not(feature = "capture-v4l2"))]
    {
        Err(PipelineError::Config(format!(
            "capture source {} requires the capture-v4l2 feature",
            uri
        )))
    }
}
