//! Error taxonomy for the acquisition pipeline.
//!
//! Only device-level failures abort a run. Everything else is recovered where it
//! happens: the frame or the sink is skipped, the error is logged with its code,
//! and acquisition keeps going.

use thiserror::Error;

use crate::frame::PixelFormat;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// Unrecoverable device or driver fault.
    #[error("device error: {0}")]
    DeviceError(String),

    #[error("no frame ready within {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The engine is not grabbing (budget exhausted, stopped, or never started).
    #[error("acquisition stopped")]
    Stopped,

    /// A single grab result reported failure.
    #[error("grab failed: 0x{code:08x} {description}")]
    FrameFailure { code: u32, description: String },

    #[error("no conversion defined from {from} to {to}")]
    UnsupportedFormat { from: PixelFormat, to: PixelFormat },

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("write failed for {sink}: {message}")]
    WriteError { sink: String, message: String },

    #[error("frame size {got_width}x{got_height} does not match recorder size {width}x{height}")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("buffer pool exhausted ({capacity} buffers in use)")]
    Exhausted { capacity: usize },

    #[error("buffer slot {index} released twice")]
    DoubleRelease { index: usize },

    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Stable code for the diagnostic channel.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::DeviceError(_) => "DEVICE_ERROR",
            PipelineError::Timeout { .. } => "TIMEOUT",
            PipelineError::Stopped => "STOPPED",
            PipelineError::FrameFailure { .. } => "FRAME_FAILURE",
            PipelineError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            PipelineError::InvalidDimensions(_) => "INVALID_DIMENSIONS",
            PipelineError::WriteError { .. } => "WRITE_ERROR",
            PipelineError::FrameSizeMismatch { .. } => "FRAME_SIZE_MISMATCH",
            PipelineError::Exhausted { .. } => "EXHAUSTED",
            PipelineError::DoubleRelease { .. } => "DOUBLE_RELEASE",
            PipelineError::Config(_) => "CONFIG",
        }
    }

    /// Fatal errors terminate the processing loop.
    ///
    /// Pool exhaustion cannot happen under `LatestOnly` unless buffers leak, so
    /// it is treated with device severity.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::DeviceError(_) | PipelineError::Exhausted { .. }
        )
    }

    pub(crate) fn write(sink: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::WriteError {
            sink: sink.to_string(),
            message: err.to_string(),
        }
    }
}
