//! Frame data model.
//!
//! - `GrabResult`: what the acquisition engine delivers. Holds a shared handle to a
//!   pool buffer; the buffer goes back to the pool when the last clone is dropped or
//!   `release` is called.
//! - `Frame`: owned pixels in a canonical layout. Never borrows from the pool.
//! - `Mask`: single-channel analysis output, same lifetime rules as `Frame`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PipelineError, PipelineResult};
use crate::pool::PooledBuffer;

// ----------------------------------------------------------------------------
// PixelFormat
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Mono8,
    Rgb8,
    Bgr8,
    /// Packed 4:2:2, Y0 U Y1 V.
    Yuyv,
    /// Planar Y followed by interleaved UV at quarter resolution.
    Nv12,
    /// Bayer mosaic, RGGB phase.
    BayerRg8,
    /// Compressed payload, one JPEG per frame.
    Mjpeg,
    /// A device format with no defined conversion.
    Unknown([u8; 4]),
}

impl PixelFormat {
    /// Exact payload size for uncompressed formats.
    pub fn frame_bytes(self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Mono8 | PixelFormat::BayerRg8 => Some(pixels),
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => pixels.checked_mul(3),
            PixelFormat::Yuyv => pixels.checked_mul(2),
            PixelFormat::Nv12 => pixels.checked_add(pixels / 2),
            PixelFormat::Mjpeg | PixelFormat::Unknown(_) => None,
        }
    }

    pub fn is_canonical(self) -> bool {
        matches!(self, PixelFormat::Rgb8 | PixelFormat::Bgr8)
    }

    pub fn from_fourcc(code: [u8; 4]) -> Self {
        match &code {
            b"GREY" => PixelFormat::Mono8,
            b"RGB3" => PixelFormat::Rgb8,
            b"BGR3" => PixelFormat::Bgr8,
            b"YUYV" => PixelFormat::Yuyv,
            b"NV12" => PixelFormat::Nv12,
            b"RGGB" => PixelFormat::BayerRg8,
            b"MJPG" => PixelFormat::Mjpeg,
            _ => PixelFormat::Unknown(code),
        }
    }

    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mono8 => *b"GREY",
            PixelFormat::Rgb8 => *b"RGB3",
            PixelFormat::Bgr8 => *b"BGR3",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::BayerRg8 => *b"RGGB",
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Unknown(code) => code,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mono8" | "grey" | "gray" => Some(PixelFormat::Mono8),
            "rgb8" | "rgb" => Some(PixelFormat::Rgb8),
            "bgr8" | "bgr" => Some(PixelFormat::Bgr8),
            "yuyv" => Some(PixelFormat::Yuyv),
            "nv12" => Some(PixelFormat::Nv12),
            "bayerrg8" | "rggb" => Some(PixelFormat::BayerRg8),
            "mjpeg" | "mjpg" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Mono8 => f.write_str("Mono8"),
            PixelFormat::Rgb8 => f.write_str("RGB8"),
            PixelFormat::Bgr8 => f.write_str("BGR8"),
            PixelFormat::Yuyv => f.write_str("YUYV"),
            PixelFormat::Nv12 => f.write_str("NV12"),
            PixelFormat::BayerRg8 => f.write_str("BayerRG8"),
            PixelFormat::Mjpeg => f.write_str("MJPEG"),
            PixelFormat::Unknown(code) => write!(f, "fourcc:{}", String::from_utf8_lossy(code)),
        }
    }
}

// ----------------------------------------------------------------------------
// GrabResult
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrabStatus {
    Succeeded,
    Failed { code: u32, description: String },
}

/// One delivery from the acquisition engine.
///
/// Immutable after creation. Clones share the same pool buffer; the buffer is
/// returned once the last clone goes away.
#[derive(Clone)]
pub struct GrabResult {
    status: GrabStatus,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    /// Device frame number. Gaps mean frames were dropped upstream.
    sequence: u64,
    /// Capture time relative to the start of grabbing.
    timestamp: Duration,
    payload_len: usize,
    buffer: Option<Arc<PooledBuffer>>,
}

impl GrabResult {
    pub(crate) fn succeeded(
        buffer: PooledBuffer,
        payload_len: usize,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        sequence: u64,
        timestamp: Duration,
    ) -> Self {
        Self {
            status: GrabStatus::Succeeded,
            width,
            height,
            pixel_format,
            sequence,
            timestamp,
            payload_len,
            buffer: Some(Arc::new(buffer)),
        }
    }

    /// A failed grab. The buffer that was being filled is returned immediately.
    pub(crate) fn failed(
        code: u32,
        description: String,
        pixel_format: PixelFormat,
        sequence: u64,
        timestamp: Duration,
    ) -> Self {
        Self {
            status: GrabStatus::Failed { code, description },
            width: 0,
            height: 0,
            pixel_format,
            sequence,
            timestamp,
            payload_len: 0,
            buffer: None,
        }
    }

    pub fn grab_succeeded(&self) -> bool {
        self.status == GrabStatus::Succeeded
    }

    pub fn status(&self) -> &GrabStatus {
        &self.status
    }

    pub fn error_code(&self) -> Option<u32> {
        match &self.status {
            GrabStatus::Succeeded => None,
            GrabStatus::Failed { code, .. } => Some(*code),
        }
    }

    pub fn error_description(&self) -> Option<&str> {
        match &self.status {
            GrabStatus::Succeeded => None,
            GrabStatus::Failed { description, .. } => Some(description),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Payload bytes. Failed results have no payload: check `grab_succeeded` first,
    /// or use `payload` to get the failure as an error.
    pub fn data(&self) -> Option<&[u8]> {
        match (&self.status, &self.buffer) {
            (GrabStatus::Succeeded, Some(buffer)) => Some(&buffer.as_slice()[..self.payload_len]),
            _ => None,
        }
    }

    pub fn payload(&self) -> PipelineResult<&[u8]> {
        match &self.status {
            GrabStatus::Failed { code, description } => Err(PipelineError::FrameFailure {
                code: *code,
                description: description.clone(),
            }),
            GrabStatus::Succeeded => self
                .data()
                .ok_or_else(|| PipelineError::InvalidDimensions("grab result has no buffer".into())),
        }
    }

    /// Drop this reference to the pool buffer now rather than at end of scope.
    pub fn release(self) {}
}

impl fmt::Debug for GrabResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrabResult")
            .field("status", &self.status)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixel_format", &self.pixel_format)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Owned, converted pixels in a canonical 3-channel layout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub sequence: u64,
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> PipelineResult<Self> {
        if !format.is_canonical() {
            return Err(PipelineError::UnsupportedFormat {
                from: format,
                to: PixelFormat::Bgr8,
            });
        }
        check_len(&data, width, height, 3)?;
        Ok(Self {
            data,
            width,
            height,
            format,
            sequence: 0,
            timestamp: Duration::ZERO,
        })
    }

    pub fn with_origin(mut self, sequence: u64, timestamp: Duration) -> Self {
        self.sequence = sequence;
        self.timestamp = timestamp;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Pixels in RGB order regardless of the stored layout.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Bgr8 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            _ => self.data.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Mask
// ----------------------------------------------------------------------------

/// Binary single-channel image: 255 where a pixel is in range, 0 elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mask {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub timestamp: Duration,
}

impl Mask {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> PipelineResult<Self> {
        check_len(&data, width, height, 1)?;
        Ok(Self {
            data,
            width,
            height,
            sequence: 0,
            timestamp: Duration::ZERO,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_pixels(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }

    /// Fraction of pixels set.
    pub fn coverage(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.set_pixels() as f32 / self.data.len() as f32
    }

    /// Centroid of the set pixels from first-order moments, `None` when empty.
    pub fn centroid(&self) -> Option<(f32, f32)> {
        let w = self.width as usize;
        let (mut m00, mut m10, mut m01) = (0u64, 0u64, 0u64);
        for (i, _) in self.data.iter().enumerate().filter(|&(_, &v)| v != 0) {
            m00 += 1;
            m10 += (i % w) as u64;
            m01 += (i / w) as u64;
        }
        if m00 == 0 {
            return None;
        }
        Some((m10 as f32 / m00 as f32, m01 as f32 / m00 as f32))
    }

    /// Expand to three identical channels (for sinks that need colour input).
    pub fn to_rgb(&self) -> Vec<u8> {
        self.data.iter().flat_map(|&v| [v, v, v]).collect()
    }
}

fn check_len(data: &[u8], width: u32, height: u32, channels: usize) -> PipelineResult<()> {
    if width == 0 || height == 0 {
        return Err(PipelineError::InvalidDimensions(format!(
            "{}x{} has no pixels",
            width, height
        )));
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(channels))
        .ok_or_else(|| PipelineError::InvalidDimensions("frame dimensions overflow".into()))?;
    if data.len() != expected {
        return Err(PipelineError::InvalidDimensions(format!(
            "{}x{}x{} expects {} bytes, got {}",
            width,
            height,
            channels,
            expected,
            data.len()
        )));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    #[test]
    fn failed_grab_has_no_payload() {
        let result = GrabResult::failed(
            0xe100_0014,
            "buffer incompletely grabbed".into(),
            PixelFormat::Bgr8,
            3,
            Duration::from_millis(100),
        );
        assert!(!result.grab_succeeded());
        assert!(result.data().is_none());
        assert_eq!(result.error_code(), Some(0xe100_0014));
        assert!(matches!(
            result.payload(),
            Err(PipelineError::FrameFailure { code: 0xe100_0014, .. })
        ));
    }

    #[test]
    fn last_clone_returns_buffer_to_pool() {
        let pool = BufferPool::new(2, 12);
        let buffer = pool.acquire().unwrap();
        let result = GrabResult::succeeded(buffer, 12, 2, 2, PixelFormat::Bgr8, 1, Duration::ZERO);
        let shared = result.clone();
        assert_eq!(pool.in_use(), 1);

        result.release();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(shared.data().map(|d| d.len()), Some(12));

        drop(shared);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn frame_rejects_wrong_length() {
        let err = Frame::new(vec![0; 10], 2, 2, PixelFormat::Rgb8).unwrap_err();
        assert_eq!(err.code(), "INVALID_DIMENSIONS");
    }

    #[test]
    fn bgr_frame_exports_rgb() {
        let frame = Frame::new(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Bgr8).unwrap();
        assert_eq!(frame.to_rgb(), vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn mask_centroid_uses_set_pixels() {
        let mut data = vec![0u8; 16];
        data[5] = 255; // (1, 1)
        data[7] = 255; // (3, 1)
        let mask = Mask::new(data, 4, 4).unwrap();
        assert_eq!(mask.set_pixels(), 2);
        assert_eq!(mask.centroid(), Some((2.0, 1.0)));
        assert!((mask.coverage() - 0.125).abs() < f32::EPSILON);
    }

    #[test]
    fn fourcc_round_trips_known_formats() {
        for format in [PixelFormat::Yuyv, PixelFormat::Mjpeg, PixelFormat::Mono8] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), format);
        }
        assert_eq!(
            PixelFormat::from_fourcc(*b"Y16 "),
            PixelFormat::Unknown(*b"Y16 ")
        );
    }
}
