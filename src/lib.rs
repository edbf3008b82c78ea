//! Grab pipeline
//!
//! Continuous frame acquisition with a processing pipeline that never stalls the
//! capture device.
//!
//! # Architecture
//!
//! Data flows one way:
//!
//! 1. **Capture source** fills buffers checked out of a fixed-size `BufferPool`.
//! 2. **AcquisitionEngine** hands results to the consumer through a bounded
//!    handoff. Under `LatestOnly` the consumer always gets the freshest frame
//!    and stale ones are dropped, never queued.
//! 3. **FrameConverter** copies the raw payload into an owned canonical frame,
//!    after which the pool buffer goes straight back.
//! 4. **AnalysisStage** blurs, converts to HSV and thresholds into a mask.
//! 5. **SinkFanout** hands the pair to the file, video and display sinks, each
//!    failing on its own.
//!
//! `PipelineController` runs the loop under a frame budget and closes every
//! sink on the way out, whatever ended the run.
//!
//! # Module Structure
//!
//! - `pool`: buffer arena and handles
//! - `ingest`: capture sources (synthetic, V4L2)
//! - `acquisition`: producer thread, grab strategies, stop handling
//! - `convert`, `analysis`: per-frame transforms
//! - `sink`: fan-out and the three sinks, plus the AVI container
//! - `pipeline`: controller, run configuration and summary
//! - `config`: `grabd` configuration loading

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod convert;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod pool;
pub mod sink;

pub use acquisition::{AcquisitionEngine, AcquisitionStats, EngineState, GrabStrategy, StopHandle};
pub use analysis::{AnalysisParams, AnalysisStage, Hsv};
pub use config::GrabberConfig;
pub use convert::FrameConverter;
pub use error::{PipelineError, PipelineResult};
pub use frame::{Frame, GrabResult, GrabStatus, Mask, PixelFormat};
pub use ingest::{open_source, CaptureSettings, CaptureSource, DeviceInfo, SyntheticConfig, SyntheticSource};
#[cfg(feature = "capture-v4l2")]
pub use ingest::V4l2Source;
pub use pipeline::{ExitReason, PipelineConfig, PipelineController, RunSummary};
pub use pool::{BufferHandle, BufferPool, PooledBuffer};
pub use sink::{
    DispatchReport, FilePersister, FrameChoice, LiveDisplay, Sink, SinkFanout, SinkOutcome,
    VideoRecorder,
};
