use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::GrabStrategy;
use crate::analysis::{AnalysisParams, Hsv};
use crate::frame::PixelFormat;
use crate::ingest::CaptureSettings;
use crate::pipeline::{
    DisplaySinkConfig, ImageSinkConfig, PipelineConfig, VideoSinkConfig, DEFAULT_FRAME_BUDGET,
    DEFAULT_MAX_CONSECUTIVE_TIMEOUTS, DEFAULT_RETRIEVE_TIMEOUT, DEFAULT_SOURCE,
};
use crate::pool::DEFAULT_POOL_CAPACITY;
use crate::sink::{FrameChoice, ImageFormatChoice, VIDEO_RECORDING};

const DEFAULT_OUTPUT_DIR: &str = ".";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GrabberConfigFile {
    source: Option<String>,
    capture: Option<CaptureConfigFile>,
    acquisition: Option<AcquisitionConfigFile>,
    analysis: Option<AnalysisConfigFile>,
    output_dir: Option<PathBuf>,
    target_format: Option<String>,
    images: Option<ImagesConfigFile>,
    video: Option<VideoConfigFile>,
    display: Option<DisplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<String>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AcquisitionConfigFile {
    frame_budget: Option<u64>,
    pool_capacity: Option<usize>,
    strategy: Option<String>,
    retrieve_timeout_ms: Option<u64>,
    max_consecutive_timeouts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AnalysisConfigFile {
    blur_kernel: Option<u32>,
    hsv_lower: Option<[u8; 3]>,
    hsv_upper: Option<[u8; 3]>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ImagesConfigFile {
    enabled: Option<bool>,
    prefix: Option<String>,
    format: Option<String>,
    jpeg_quality: Option<u8>,
    frame: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct VideoConfigFile {
    enabled: Option<bool>,
    file: Option<String>,
    fps: Option<u32>,
    jpeg_quality: Option<u8>,
    frame: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DisplayConfigFile {
    enabled: Option<bool>,
    preview_path: Option<PathBuf>,
    frame: Option<String>,
}

/// Settings for `grabd`, loaded from `GRABBER_CONFIG` plus `GRABBER_*` overrides.
#[derive(Debug, Clone)]
pub struct GrabberConfig {
    pub source: String,
    pub capture: CaptureSettings,
    pub frame_budget: u64,
    pub pool_capacity: usize,
    pub strategy: GrabStrategy,
    pub retrieve_timeout: Duration,
    pub max_consecutive_timeouts: u32,
    pub analysis: AnalysisParams,
    pub target_format: PixelFormat,
    pub output_dir: PathBuf,
    pub save_images: bool,
    pub images: ImageSinkConfig,
    pub record_video: bool,
    pub video: VideoSinkConfig,
    pub display: bool,
    pub display_settings: DisplaySinkConfig,
}

impl GrabberConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GRABBER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document without consulting the environment.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: GrabberConfigFile =
            serde_json::from_str(raw).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GrabberConfigFile) -> Result<Self> {
        let defaults = CaptureSettings::default();
        let capture_file = file.capture.unwrap_or_default();
        let capture = CaptureSettings {
            width: capture_file.width.unwrap_or(defaults.width),
            height: capture_file.height.unwrap_or(defaults.height),
            pixel_format: match capture_file.pixel_format.as_deref() {
                Some(name) => parse_pixel_format("capture.pixel_format", name)?,
                None => defaults.pixel_format,
            },
            target_fps: capture_file.target_fps.unwrap_or(defaults.target_fps),
        };

        let acquisition = file.acquisition.unwrap_or_default();
        let strategy = match acquisition.strategy.as_deref() {
            Some(name) => parse_strategy("acquisition.strategy", name)?,
            None => GrabStrategy::default(),
        };

        let analysis_file = file.analysis.unwrap_or_default();
        let analysis_defaults = AnalysisParams::default();
        let analysis = AnalysisParams {
            blur_kernel: analysis_file
                .blur_kernel
                .unwrap_or(analysis_defaults.blur_kernel),
            lower: analysis_file
                .hsv_lower
                .map(Hsv::from)
                .unwrap_or(analysis_defaults.lower),
            upper: analysis_file
                .hsv_upper
                .map(Hsv::from)
                .unwrap_or(analysis_defaults.upper),
        };

        let target_format = match file.target_format.as_deref() {
            Some(name) => parse_pixel_format("target_format", name)?,
            None => PixelFormat::Bgr8,
        };

        let images_file = file.images.unwrap_or_default();
        let image_defaults = ImageSinkConfig::default();
        let images = ImageSinkConfig {
            prefix: images_file.prefix.unwrap_or(image_defaults.prefix),
            format: match images_file.format.as_deref() {
                Some(name) => ImageFormatChoice::parse(name)
                    .ok_or_else(|| anyhow!("images.format must be jpg or png, got {:?}", name))?,
                None => image_defaults.format,
            },
            jpeg_quality: images_file
                .jpeg_quality
                .unwrap_or(image_defaults.jpeg_quality),
            choice: match images_file.frame.as_deref() {
                Some(name) => parse_choice("images.frame", name)?,
                None => image_defaults.choice,
            },
        };

        let video_file = file.video.unwrap_or_default();
        let video_defaults = VideoSinkConfig::default();
        let video = VideoSinkConfig {
            file_name: video_file.file.unwrap_or(video_defaults.file_name),
            fps: video_file.fps.unwrap_or(video_defaults.fps),
            jpeg_quality: video_file
                .jpeg_quality
                .unwrap_or(video_defaults.jpeg_quality),
            choice: match video_file.frame.as_deref() {
                Some(name) => parse_choice("video.frame", name)?,
                None => video_defaults.choice,
            },
            frame_size: None,
        };

        let display_file = file.display.unwrap_or_default();
        let display_settings = DisplaySinkConfig {
            preview_path: display_file.preview_path,
            choice: match display_file.frame.as_deref() {
                Some(name) => parse_choice("display.frame", name)?,
                None => DisplaySinkConfig::default().choice,
            },
        };

        Ok(Self {
            source: file.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            capture,
            frame_budget: acquisition.frame_budget.unwrap_or(DEFAULT_FRAME_BUDGET),
            pool_capacity: acquisition.pool_capacity.unwrap_or(DEFAULT_POOL_CAPACITY),
            strategy,
            retrieve_timeout: acquisition
                .retrieve_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRIEVE_TIMEOUT),
            max_consecutive_timeouts: acquisition
                .max_consecutive_timeouts
                .unwrap_or(DEFAULT_MAX_CONSECUTIVE_TIMEOUTS),
            analysis,
            target_format,
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            save_images: images_file.enabled.unwrap_or(true),
            images,
            record_video: video_file.enabled.unwrap_or(VIDEO_RECORDING),
            video,
            display: display_file.enabled.unwrap_or(false),
            display_settings,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(source) = std::env::var("GRABBER_SOURCE") {
            if !source.trim().is_empty() {
                self.source = source;
            }
        }
        if let Ok(budget) = std::env::var("GRABBER_FRAME_BUDGET") {
            self.frame_budget = budget
                .trim()
                .parse()
                .map_err(|_| anyhow!("GRABBER_FRAME_BUDGET must be a non-negative integer"))?;
        }
        if let Ok(capacity) = std::env::var("GRABBER_POOL_CAPACITY") {
            self.pool_capacity = capacity
                .trim()
                .parse()
                .map_err(|_| anyhow!("GRABBER_POOL_CAPACITY must be a non-negative integer"))?;
        }
        if let Ok(strategy) = std::env::var("GRABBER_STRATEGY") {
            self.strategy = parse_strategy("GRABBER_STRATEGY", &strategy)?;
        }
        if let Ok(dir) = std::env::var("GRABBER_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(value) = std::env::var("GRABBER_SAVE_IMAGES") {
            self.save_images = parse_flag("GRABBER_SAVE_IMAGES", &value)?;
        }
        if let Ok(value) = std::env::var("GRABBER_RECORD_VIDEO") {
            self.record_video = parse_flag("GRABBER_RECORD_VIDEO", &value)?;
        }
        if let Ok(value) = std::env::var("GRABBER_DISPLAY") {
            self.display = parse_flag("GRABBER_DISPLAY", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(anyhow!("source must not be empty"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!(
                "capture size must be positive, got {}x{}",
                self.capture.width,
                self.capture.height
            ));
        }
        if self.pool_capacity == 0 {
            return Err(anyhow!("pool capacity must be at least 1"));
        }
        if self.retrieve_timeout.is_zero() {
            return Err(anyhow!("retrieve timeout must be greater than zero"));
        }
        if self.max_consecutive_timeouts == 0 {
            return Err(anyhow!("max consecutive timeouts must be at least 1"));
        }
        if self.record_video && !VIDEO_RECORDING {
            return Err(anyhow!(
                "video recording requested but this build lacks the video-gstreamer feature"
            ));
        }
        if self.video.fps == 0 {
            return Err(anyhow!("video fps must be greater than zero"));
        }
        if !self.target_format.is_canonical() {
            return Err(anyhow!(
                "target format must be BGR8 or RGB8, got {}",
                self.target_format
            ));
        }
        for (name, quality) in [
            ("images.jpeg_quality", self.images.jpeg_quality),
            ("video.jpeg_quality", self.video.jpeg_quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(anyhow!("{} must be within 1..=100, got {}", name, quality));
            }
        }
        self.analysis
            .validate()
            .context("invalid analysis parameters")?;
        Ok(())
    }

    /// Freeze into the configuration a run consumes.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            source: self.source.clone(),
            capture: self.capture.clone(),
            frame_budget: self.frame_budget,
            pool_capacity: self.pool_capacity,
            strategy: self.strategy,
            retrieve_timeout: self.retrieve_timeout,
            max_consecutive_timeouts: self.max_consecutive_timeouts,
            target_format: self.target_format,
            analysis: self.analysis,
            output_dir: self.output_dir.clone(),
            images: self.save_images.then(|| self.images.clone()),
            video: self.record_video.then(|| self.video.clone()),
            display: self.display.then(|| self.display_settings.clone()),
        }
    }
}

fn read_config_file(path: &Path) -> Result<GrabberConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

fn parse_pixel_format(field: &str, value: &str) -> Result<PixelFormat> {
    PixelFormat::parse(value).ok_or_else(|| anyhow!("{}: unknown pixel format {:?}", field, value))
}

fn parse_strategy(field: &str, value: &str) -> Result<GrabStrategy> {
    GrabStrategy::parse(value)
        .ok_or_else(|| anyhow!("{} must be latest_only or all_frames, got {:?}", field, value))
}

fn parse_choice(field: &str, value: &str) -> Result<FrameChoice> {
    FrameChoice::parse(value)
        .ok_or_else(|| anyhow!("{} must be original or mask, got {:?}", field, value))
}

fn parse_flag(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got {:?}", field, other)),
    }
}
