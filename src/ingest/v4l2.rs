//! V4L2 capture source.
//!
//! Opens a local device node (e.g. /dev/video0), negotiates the requested geometry
//! and fourcc, and copies each mmap buffer into the pool buffer handed over by the
//! acquisition engine. Whatever format the driver settles on is reported as the
//! device pixel format; formats without a conversion are rejected downstream.

use ouroboros::self_referencing;

use super::{CaptureOutcome, CaptureSettings, CaptureSource, DeviceInfo};
use crate::error::{PipelineError, PipelineResult};
use crate::frame::PixelFormat;

/// Reported when the driver hands back a frame larger than a pool buffer.
pub const OVERSIZED_FRAME_CODE: u32 = 0xE100_0020;

const MMAP_BUFFERS: u32 = 4;

pub struct V4l2Source {
    device_path: String,
    settings: CaptureSettings,
    state: Option<DeviceV4l2State>,
    frame_count: u64,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(device_path: &str, settings: CaptureSettings) -> Self {
        Self {
            device_path: device_path.to_string(),
            active_width: settings.width,
            active_height: settings.height,
            settings,
            state: None,
            frame_count: 0,
        }
    }

    fn device_error(&self, what: &str, err: impl std::fmt::Display) -> PipelineError {
        PipelineError::DeviceError(format!("{}: {}: {}", self.device_path, what, err))
    }
}

impl CaptureSource for V4l2Source {
    fn name(&self) -> &str {
        &self.device_path
    }

    fn open(&mut self) -> PipelineResult<DeviceInfo> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.device_path)
            .map_err(|e| self.device_error("open v4l2 device", e))?;
        let caps = device
            .query_caps()
            .map_err(|e| self.device_error("query capabilities", e))?;

        let mut format = device
            .format()
            .map_err(|e| self.device_error("read v4l2 format", e))?;
        format.width = self.settings.width;
        format.height = self.settings.height;
        format.fourcc = v4l::FourCC::new(&self.settings.pixel_format.fourcc());

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.device_path,
                    err
                );
                device
                    .format()
                    .map_err(|e| self.device_error("read v4l2 format after set failure", e))?
            }
        };

        if self.settings.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.settings.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.device_path,
                    err
                );
            }
        }

        let state = DeviceV4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
            },
        }
        .try_build()
        .map_err(|e| self.device_error("create v4l2 buffer stream", e))?;
        self.state = Some(state);

        self.active_width = format.width;
        self.active_height = format.height;
        let pixel_format = PixelFormat::from_fourcc(format.fourcc.repr);
        let max_frame_bytes = (format.size as usize).max(
            pixel_format
                .frame_bytes(format.width, format.height)
                .unwrap_or(0),
        );

        log::info!(
            "V4l2Source: connected to {} ({}x{} {})",
            self.device_path,
            format.width,
            format.height,
            pixel_format
        );
        Ok(DeviceInfo {
            vendor: caps.driver,
            model: caps.card,
            width: format.width,
            height: format.height,
            pixel_format,
            max_frame_bytes,
        })
    }

    fn grab_into(&mut self, buf: &mut [u8]) -> PipelineResult<CaptureOutcome> {
        use v4l::io::traits::CaptureStream;

        let path = self.device_path.clone();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| PipelineError::DeviceError(format!("{} is not open", path)))?;

        let outcome = state.with_mut(|fields| -> PipelineResult<CaptureOutcome> {
            let (data, meta) = fields
                .stream
                .next()
                .map_err(|e| PipelineError::DeviceError(format!("{}: capture: {}", path, e)))?;
            let used = match meta.bytesused as usize {
                0 => data.len(),
                n => n.min(data.len()),
            };
            let Some(dst) = buf.get_mut(..used) else {
                return Ok(CaptureOutcome::Failed {
                    code: OVERSIZED_FRAME_CODE,
                    description: format!("frame of {} bytes exceeds pool buffer", used),
                });
            };
            dst.copy_from_slice(&data[..used]);
            Ok(CaptureOutcome::Frame {
                len: used,
                width: 0,
                height: 0,
            })
        })?;

        self.frame_count += 1;

        // Geometry is fixed at open time.
        Ok(match outcome {
            CaptureOutcome::Frame { len, .. } => CaptureOutcome::Frame {
                len,
                width: self.active_width,
                height: self.active_height,
            },
            failed => failed,
        })
    }

    fn close(&mut self) {
        if self.state.take().is_some() {
            log::info!(
                "V4l2Source: closed {} after {} frames",
                self.device_path,
                self.frame_count
            );
        }
    }
}
