//! Fan-out of processed frames to independent sinks.
//!
//! Every enabled sink sees every frame. A failing sink is reported in the
//! `DispatchReport` and the remaining sinks still run; nothing here ever stops
//! acquisition.

use std::borrow::Cow;

use image::ExtendedColorType;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::frame::{Frame, Mask};

pub mod avi;
mod display;
mod file;
#[cfg(feature = "video-gstreamer")]
mod gst_avi;
mod video;

pub use display::{
    DisplayMonitor, DisplayStats, DisplaySurface, LiveDisplay, NullSurface, PreviewFileSurface,
};
pub use file::{FilePersister, ImageFormatChoice, DEFAULT_JPEG_QUALITY};
#[cfg(feature = "video-gstreamer")]
pub use gst_avi::GstAviEncoder;
pub use video::{StreamColor, VideoEncoder, VideoRecorder, VideoStream, VIDEO_RECORDING};

/// Which image of the (original, mask) pair a sink consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameChoice {
    Original,
    Mask,
}

impl FrameChoice {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "original" | "frame" => Some(FrameChoice::Original),
            "mask" | "derived" => Some(FrameChoice::Mask),
            _ => None,
        }
    }

    pub fn select<'a>(self, frame: &'a Frame, mask: &'a Mask) -> SinkImage<'a> {
        match self {
            FrameChoice::Original => SinkImage::Original(frame),
            FrameChoice::Mask => SinkImage::Mask(mask),
        }
    }
}

/// Borrowed view of the image a sink was configured to consume.
#[derive(Clone, Copy, Debug)]
pub enum SinkImage<'a> {
    Original(&'a Frame),
    Mask(&'a Mask),
}

impl SinkImage<'_> {
    pub fn width(&self) -> u32 {
        match self {
            SinkImage::Original(frame) => frame.width,
            SinkImage::Mask(mask) => mask.width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            SinkImage::Original(frame) => frame.height,
            SinkImage::Mask(mask) => mask.height,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            SinkImage::Original(frame) => frame.sequence,
            SinkImage::Mask(mask) => mask.sequence,
        }
    }

    /// Pixels ready for an encoder: RGB for frames, luma for masks.
    pub fn encodable(&self) -> (Cow<'_, [u8]>, ExtendedColorType) {
        match self {
            SinkImage::Original(frame) => (Cow::Owned(frame.to_rgb()), ExtendedColorType::Rgb8),
            SinkImage::Mask(mask) => (Cow::Borrowed(mask.data()), ExtendedColorType::L8),
        }
    }

    /// Always three channels, for encoders that cannot take luma.
    pub fn to_rgb(&self) -> Vec<u8> {
        match self {
            SinkImage::Original(frame) => frame.to_rgb(),
            SinkImage::Mask(mask) => mask.to_rgb(),
        }
    }
}

/// What a sink did with one frame, when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Accepted in place of an older frame the sink had not got to yet; the
    /// older frame is discarded.
    Replaced,
}

pub trait Sink: Send {
    fn name(&self) -> &str;

    fn choice(&self) -> FrameChoice;

    fn write(&mut self, image: SinkImage<'_>) -> PipelineResult<Delivery>;

    /// Release the sink's resource. Called exactly once by the fan-out.
    fn close(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkOutcome {
    Delivered,
    Replaced,
    Failed(PipelineError),
}

#[derive(Clone, Debug)]
pub struct SinkReport {
    pub sink: String,
    pub outcome: SinkOutcome,
}

#[derive(Clone, Debug, Default)]
pub struct DispatchReport {
    pub entries: Vec<SinkReport>,
}

impl DispatchReport {
    pub fn outcome(&self, sink: &str) -> Option<&SinkOutcome> {
        self.entries
            .iter()
            .find(|entry| entry.sink == sink)
            .map(|entry| &entry.outcome)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &PipelineError)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            SinkOutcome::Failed(err) => Some((entry.sink.as_str(), err)),
            _ => None,
        })
    }

    /// Sinks that accepted the frame.
    pub fn delivered(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !matches!(entry.outcome, SinkOutcome::Failed(_)))
            .count()
    }
}

#[derive(Default)]
pub struct SinkFanout {
    sinks: Vec<Box<dyn Sink>>,
    closed: bool,
}

impl SinkFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Box<dyn Sink>) {
        log::info!(
            "SinkFanout: enabled {} ({:?})",
            sink.name(),
            sink.choice()
        );
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.sinks.iter().map(|sink| sink.name().to_string()).collect()
    }

    pub fn dispatch(&mut self, frame: &Frame, mask: &Mask) -> DispatchReport {
        let mut report = DispatchReport::default();
        for sink in self.sinks.iter_mut() {
            let image = sink.choice().select(frame, mask);
            let outcome = match sink.write(image) {
                Ok(Delivery::Delivered) => SinkOutcome::Delivered,
                Ok(Delivery::Replaced) => SinkOutcome::Replaced,
                Err(err) => {
                    log::warn!(
                        "SinkFanout: {} failed on frame {}: [{}] {}",
                        sink.name(),
                        frame.sequence,
                        err.code(),
                        err
                    );
                    SinkOutcome::Failed(err)
                }
            };
            report.entries.push(SinkReport {
                sink: sink.name().to_string(),
                outcome,
            });
        }
        report
    }

    /// Close every sink, once. Each failure is returned separately; a failing
    /// close never skips the others.
    pub fn close(&mut self) -> Vec<(String, PipelineError)> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut failures = Vec::new();
        for sink in self.sinks.iter_mut() {
            if let Err(err) = sink.close() {
                log::error!(
                    "SinkFanout: closing {} failed: [{}] {}",
                    sink.name(),
                    err.code(),
                    err
                );
                failures.push((sink.name().to_string(), err));
            }
        }
        failures
    }
}

impl Drop for SinkFanout {
    fn drop(&mut self) {
        self.close();
    }
}
