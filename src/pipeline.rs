//! The processing loop: retrieve, convert, release, analyze, fan out.
//!
//! `PipelineController::run` owns every resource for the duration of a run and
//! closes the sinks on every way out of the loop, including fatal errors. The
//! pool buffer behind each grab is released right after conversion, before any
//! sink sees the frame.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::acquisition::{AcquisitionEngine, AcquisitionStats, GrabStrategy, StopHandle};
use crate::analysis::{AnalysisParams, AnalysisStage};
use crate::convert::FrameConverter;
use crate::error::{PipelineError, PipelineResult};
use crate::frame::{GrabResult, PixelFormat};
use crate::ingest::{self, CaptureSettings, CaptureSource};
use crate::pool::DEFAULT_POOL_CAPACITY;
use crate::sink::{
    DisplayMonitor, DisplayStats, DisplaySurface, FilePersister, FrameChoice, ImageFormatChoice,
    LiveDisplay, NullSurface, PreviewFileSurface, Sink, SinkFanout, SinkOutcome, VideoRecorder,
    DEFAULT_JPEG_QUALITY, VIDEO_RECORDING,
};

pub const DEFAULT_FRAME_BUDGET: u64 = 100;
pub const DEFAULT_RETRIEVE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;
pub const DEFAULT_VIDEO_FPS: u32 = 30;
pub const DEFAULT_VIDEO_FILE: &str = "openCvVideo.avi";
pub const DEFAULT_IMAGE_PREFIX: &str = "image_";
pub const DEFAULT_SOURCE: &str = "stub://camera";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSinkConfig {
    pub prefix: String,
    pub format: ImageFormatChoice,
    pub jpeg_quality: u8,
    pub choice: FrameChoice,
}

impl Default for ImageSinkConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_IMAGE_PREFIX.to_string(),
            format: ImageFormatChoice::Jpg,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            choice: FrameChoice::Original,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoSinkConfig {
    pub file_name: String,
    pub fps: u32,
    pub jpeg_quality: u8,
    pub choice: FrameChoice,
    /// Recorder frame size; the device geometry when unset.
    pub frame_size: Option<(u32, u32)>,
}

impl Default for VideoSinkConfig {
    fn default() -> Self {
        Self {
            file_name: DEFAULT_VIDEO_FILE.to_string(),
            fps: DEFAULT_VIDEO_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            choice: FrameChoice::Original,
            frame_size: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisplaySinkConfig {
    /// PNG kept up to date with the latest frame; frames are discarded when unset.
    pub preview_path: Option<PathBuf>,
    pub choice: FrameChoice,
}

impl Default for DisplaySinkConfig {
    fn default() -> Self {
        Self {
            preview_path: None,
            choice: FrameChoice::Mask,
        }
    }
}

/// Everything a run needs, fixed before it starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub source: String,
    pub capture: CaptureSettings,
    pub frame_budget: u64,
    pub pool_capacity: usize,
    pub strategy: GrabStrategy,
    pub retrieve_timeout: Duration,
    /// Timeouts in a row after which the device is considered gone.
    pub max_consecutive_timeouts: u32,
    pub target_format: PixelFormat,
    pub analysis: AnalysisParams,
    pub output_dir: PathBuf,
    pub images: Option<ImageSinkConfig>,
    pub video: Option<VideoSinkConfig>,
    pub display: Option<DisplaySinkConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            capture: CaptureSettings::default(),
            frame_budget: DEFAULT_FRAME_BUDGET,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            strategy: GrabStrategy::LatestOnly,
            retrieve_timeout: DEFAULT_RETRIEVE_TIMEOUT,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            target_format: PixelFormat::Bgr8,
            analysis: AnalysisParams::default(),
            output_dir: PathBuf::from("."),
            images: Some(ImageSinkConfig::default()),
            video: VIDEO_RECORDING.then(VideoSinkConfig::default),
            display: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Summary
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Every budgeted frame was retrieved.
    BudgetExhausted,
    /// `stop()` was requested before the budget ran out.
    Stopped,
    Fatal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SinkCounters {
    pub delivered: u64,
    /// Accepted frames that pushed out an older, never-shown one.
    pub replaced: u64,
    pub failed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    pub exit: ExitReason,
    pub fatal_code: Option<String>,
    pub fatal_error: Option<String>,
    /// Frames that made it through conversion and analysis to the fan-out.
    pub processed: u64,
    pub frame_failures: u64,
    pub timeouts: u64,
    pub conversion_errors: u64,
    pub analysis_errors: u64,
    pub sinks: BTreeMap<String, SinkCounters>,
    pub close_errors: Vec<String>,
    pub display: Option<DisplayStats>,
    pub acquisition: AcquisitionStats,
    pub elapsed_ms: u64,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            exit: ExitReason::Stopped,
            fatal_code: None,
            fatal_error: None,
            processed: 0,
            frame_failures: 0,
            timeouts: 0,
            conversion_errors: 0,
            analysis_errors: 0,
            sinks: BTreeMap::new(),
            close_errors: Vec::new(),
            display: None,
            acquisition: AcquisitionStats::default(),
            elapsed_ms: 0,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.exit == ExitReason::Fatal
    }

    /// 0 on completion or stop, 1 on an unrecoverable device error.
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            1
        } else {
            0
        }
    }

    pub fn sink_errors(&self, sink: &str) -> u64 {
        self.sinks.get(sink).map_or(0, |counters| counters.failed)
    }

    fn set_fatal(&mut self, err: &PipelineError) {
        self.exit = ExitReason::Fatal;
        self.fatal_code = Some(err.code().to_string());
        self.fatal_error = Some(err.to_string());
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

pub struct PipelineController {
    config: PipelineConfig,
    engine: AcquisitionEngine,
    converter: FrameConverter,
    analysis: AnalysisStage,
    fanout: SinkFanout,
    display: Option<DisplayMonitor>,
}

impl PipelineController {
    /// Open the configured source and every enabled sink.
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        let source = ingest::open_source(&config.source, &config.capture)?;
        Self::with_source(config, source)
    }

    pub fn with_source(config: PipelineConfig, source: Box<dyn CaptureSource>) -> PipelineResult<Self> {
        let converter = FrameConverter::new(config.target_format)?;
        let analysis = AnalysisStage::new(config.analysis)?;
        let engine = AcquisitionEngine::open(source, config.pool_capacity)?;

        let mut fanout = SinkFanout::new();
        if let Some(images) = &config.images {
            fanout.add(Box::new(FilePersister::new(
                &config.output_dir,
                &images.prefix,
                images.format,
                images.jpeg_quality,
                images.choice,
            )?));
        }
        if let Some(video) = &config.video {
            let device = engine.device_info();
            let (width, height) = video.frame_size.unwrap_or((device.width, device.height));
            fanout.add(Box::new(VideoRecorder::open(
                &config.output_dir.join(&video.file_name),
                width,
                height,
                video.fps,
                video.jpeg_quality,
                video.choice,
            )?));
        }
        let mut display = None;
        if let Some(settings) = &config.display {
            let surface: Box<dyn DisplaySurface> = match &settings.preview_path {
                Some(path) => Box::new(PreviewFileSurface::new(path)),
                None => Box::new(NullSurface),
            };
            let live = LiveDisplay::spawn(surface, settings.choice)?;
            display = Some(live.monitor());
            fanout.add(Box::new(live));
        }

        Ok(Self {
            config,
            engine,
            converter,
            analysis,
            fanout,
            display,
        })
    }

    /// Add a sink beyond the configured ones.
    pub fn add_sink(&mut self, sink: Box<dyn Sink>) {
        self.fanout.add(sink);
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn engine(&self) -> &AcquisitionEngine {
        &self.engine
    }

    /// Handle for stopping the run from another thread (signal handler, UI).
    pub fn stop_handle(&self) -> StopHandle {
        self.engine.stop_handle()
    }

    pub fn run(self) -> RunSummary {
        self.run_with(|_| {})
    }

    /// Run to completion. `observe` sees the running summary after every
    /// retrieval attempt.
    pub fn run_with(mut self, mut observe: impl FnMut(&RunSummary)) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new();

        match self
            .engine
            .start(self.config.frame_budget, self.config.strategy)
        {
            Ok(()) => self.grab_loop(&mut summary, &mut observe),
            Err(err) => {
                log::error!(
                    "PipelineController: failed to start grabbing: [{}] {}",
                    err.code(),
                    err
                );
                summary.set_fatal(&err);
            }
        }

        self.engine.shutdown();
        for (sink, err) in self.fanout.close() {
            summary.close_errors.push(format!("{}: [{}] {}", sink, err.code(), err));
        }
        summary.display = self.display.as_ref().map(DisplayMonitor::snapshot);
        summary.acquisition = self.engine.stats();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        log::info!(
            "PipelineController: {:?} after {} frames ({} failed grabs, {} timeouts, {} stale drops)",
            summary.exit,
            summary.processed,
            summary.frame_failures,
            summary.timeouts,
            summary.acquisition.dropped_stale
        );
        summary
    }

    fn grab_loop(&mut self, summary: &mut RunSummary, observe: &mut impl FnMut(&RunSummary)) {
        let mut consecutive_timeouts = 0u32;
        loop {
            match self.engine.retrieve(self.config.retrieve_timeout) {
                Ok(grab) => {
                    consecutive_timeouts = 0;
                    self.process(grab, summary);
                }
                Err(PipelineError::Stopped) => {
                    summary.exit = if self.engine.stats().delivered >= self.config.frame_budget {
                        ExitReason::BudgetExhausted
                    } else {
                        ExitReason::Stopped
                    };
                    break;
                }
                Err(err @ PipelineError::Timeout { .. }) => {
                    summary.timeouts += 1;
                    consecutive_timeouts += 1;
                    log::warn!("PipelineController: [{}] {}", err.code(), err);
                    if consecutive_timeouts >= self.config.max_consecutive_timeouts {
                        let err = PipelineError::DeviceError(format!(
                            "no frame after {} consecutive timeouts",
                            consecutive_timeouts
                        ));
                        log::error!("PipelineController: [{}] {}", err.code(), err);
                        summary.set_fatal(&err);
                        break;
                    }
                }
                Err(err) if err.is_fatal() => {
                    log::error!("PipelineController: [{}] {}", err.code(), err);
                    summary.set_fatal(&err);
                    break;
                }
                Err(err) => {
                    log::warn!("PipelineController: [{}] {}", err.code(), err);
                }
            }
            observe(summary);
        }
        observe(summary);
    }

    fn process(&mut self, grab: GrabResult, summary: &mut RunSummary) {
        if !grab.grab_succeeded() {
            summary.frame_failures += 1;
            log::warn!(
                "PipelineController: frame {} failed: 0x{:08x} {}",
                grab.sequence(),
                grab.error_code().unwrap_or(0),
                grab.error_description().unwrap_or("")
            );
            return;
        }
        log::debug!(
            "PipelineController: frame {} SizeX: {} SizeY: {}",
            grab.sequence(),
            grab.width(),
            grab.height()
        );

        let converted = self.converter.convert(&grab);
        grab.release();
        let frame = match converted {
            Ok(frame) => frame,
            Err(err) => {
                summary.conversion_errors += 1;
                log::warn!("FrameConverter: [{}] {}", err.code(), err);
                return;
            }
        };

        let mask = match self.analysis.analyze(&frame) {
            Ok(mask) => mask,
            Err(err) => {
                summary.analysis_errors += 1;
                log::warn!("AnalysisStage: [{}] {}", err.code(), err);
                return;
            }
        };
        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "AnalysisStage: frame {} coverage {:.4} centroid {:?}",
                mask.sequence,
                mask.coverage(),
                mask.centroid()
            );
        }

        let report = self.fanout.dispatch(&frame, &mask);
        for entry in report.entries {
            let counters = summary.sinks.entry(entry.sink).or_default();
            match entry.outcome {
                SinkOutcome::Delivered => counters.delivered += 1,
                SinkOutcome::Replaced => counters.replaced += 1,
                SinkOutcome::Failed(_) => counters.failed += 1,
            }
        }
        summary.processed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{SyntheticConfig, SyntheticSource};

    fn quiet_config(budget: u64) -> PipelineConfig {
        PipelineConfig {
            frame_budget: budget,
            images: None,
            video: None,
            display: None,
            ..PipelineConfig::default()
        }
    }

    fn source(fail_at: Vec<u64>, fault_at: Option<u64>) -> Box<dyn CaptureSource> {
        Box::new(SyntheticSource::new(SyntheticConfig {
            width: 32,
            height: 24,
            target_fps: 200,
            fail_at,
            fault_at,
            ..SyntheticConfig::default()
        }))
    }

    #[test]
    fn runs_to_budget() {
        let controller = PipelineController::with_source(quiet_config(5), source(vec![], None)).unwrap();
        let summary = controller.run();
        assert_eq!(summary.exit, ExitReason::BudgetExhausted);
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.acquisition.buffers_in_use, 0);
    }

    #[test]
    fn failed_grabs_are_counted_and_skipped() {
        let config = PipelineConfig {
            strategy: GrabStrategy::AllFrames,
            ..quiet_config(6)
        };
        let controller = PipelineController::with_source(config, source(vec![2, 4], None)).unwrap();
        let summary = controller.run();
        assert_eq!(summary.frame_failures, 2);
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.exit, ExitReason::BudgetExhausted);
    }

    #[test]
    fn device_fault_is_fatal() {
        let controller =
            PipelineController::with_source(quiet_config(50), source(vec![], Some(3))).unwrap();
        let summary = controller.run();
        assert_eq!(summary.exit, ExitReason::Fatal);
        assert_eq!(summary.fatal_code.as_deref(), Some("DEVICE_ERROR"));
        assert_eq!(summary.exit_code(), 1);
        assert!(summary.processed < 50);
    }

    #[test]
    fn repeated_timeouts_become_a_device_error() {
        let config = PipelineConfig {
            retrieve_timeout: Duration::from_millis(20),
            max_consecutive_timeouts: 3,
            ..quiet_config(50)
        };
        let slow = Box::new(SyntheticSource::new(SyntheticConfig {
            width: 32,
            height: 24,
            target_fps: 1,
            ..SyntheticConfig::default()
        }));
        let summary = PipelineController::with_source(config, slow).unwrap().run();
        assert_eq!(summary.exit, ExitReason::Fatal);
        assert_eq!(summary.fatal_code.as_deref(), Some("DEVICE_ERROR"));
        assert_eq!(summary.timeouts, 3);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn zero_budget_processes_nothing() {
        let controller = PipelineController::with_source(quiet_config(0), source(vec![], None)).unwrap();
        let summary = controller.run();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.exit, ExitReason::BudgetExhausted);
    }
}
