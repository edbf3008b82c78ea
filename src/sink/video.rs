use std::borrow::Cow;
use std::path::Path;

use super::{Delivery, FrameChoice, Sink, SinkImage};
use crate::error::{PipelineError, PipelineResult};

const SINK_NAME: &str = "video";

/// Whether this build can record video files.
pub const VIDEO_RECORDING: bool = cfg!(feature = "video-gstreamer");

/// Pixel layout pushed to the encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamColor {
    /// Packed 8-bit RGB.
    Rgb,
    /// One luma byte per pixel.
    Gray,
}

impl StreamColor {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            StreamColor::Rgb => 3,
            StreamColor::Gray => 1,
        }
    }
}

/// Geometry, rate and quality of a recording, fixed when it opens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoStream {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: u8,
    pub choice: FrameChoice,
}

impl VideoStream {
    pub fn new(width: u32, height: u32, fps: u32, quality: u8, choice: FrameChoice) -> PipelineResult<Self> {
        if fps == 0 {
            return Err(PipelineError::Config("video fps must be positive".into()));
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::Config(format!(
                "video frame size {}x{} is empty",
                width, height
            )));
        }
        if !(1..=100).contains(&quality) {
            return Err(PipelineError::Config(format!(
                "jpeg quality must be within 1..=100, got {}",
                quality
            )));
        }
        Ok(Self {
            width,
            height,
            fps,
            quality,
            choice,
        })
    }

    /// Masks are recorded as gray, frames as RGB.
    pub fn color(&self) -> StreamColor {
        match self.choice {
            FrameChoice::Original => StreamColor::Rgb,
            FrameChoice::Mask => StreamColor::Gray,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * self.color().bytes_per_pixel()
    }
}

/// Container backend behind a `VideoRecorder`.
pub trait VideoEncoder: Send {
    /// Append one frame of tightly packed pixels laid out as the stream's color.
    fn push(&mut self, pixels: &[u8]) -> PipelineResult<()>;

    /// Flush pending frames and finalize the container. Called once.
    fn finish(&mut self) -> PipelineResult<()>;
}

/// Appends frames to a video file at a fixed rate and size.
///
/// The size is fixed when the recorder opens. The container is finalized by
/// `close`, or by `Drop` when the owner never got that far.
pub struct VideoRecorder {
    encoder: Option<Box<dyn VideoEncoder>>,
    label: String,
    stream: VideoStream,
    frames: usize,
    mismatches: u64,
}

impl VideoRecorder {
    /// Record a Motion-JPEG AVI at `path`.
    pub fn open(
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
        quality: u8,
        choice: FrameChoice,
    ) -> PipelineResult<Self> {
        let stream = VideoStream::new(width, height, fps, quality, choice)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::write(SINK_NAME, format!("{}: {}", parent.display(), e)))?;
        }
        let encoder = open_encoder(path, &stream)?;
        Ok(Self::with_encoder(encoder, path.display().to_string(), stream))
    }

    /// Record through an already opened encoder.
    pub fn with_encoder(encoder: Box<dyn VideoEncoder>, label: impl Into<String>, stream: VideoStream) -> Self {
        let label = label.into();
        log::info!(
            "VideoRecorder: recording {}x{} @ {} fps ({:?}) to {}",
            stream.width,
            stream.height,
            stream.fps,
            stream.choice,
            label
        );
        Self {
            encoder: Some(encoder),
            label,
            stream,
            frames: 0,
            mismatches: 0,
        }
    }

    pub fn stream(&self) -> &VideoStream {
        &self.stream
    }

    pub fn fps(&self) -> u32 {
        self.stream.fps
    }

    pub fn frames_written(&self) -> usize {
        self.frames
    }

    pub fn size_mismatches(&self) -> u64 {
        self.mismatches
    }

    /// Finalize the container. Further writes fail with `WriteError`.
    pub fn finalize(&mut self) -> PipelineResult<()> {
        let Some(mut encoder) = self.encoder.take() else {
            return Ok(());
        };
        encoder.finish()
    }
}

#[cfg(feature = "video-gstreamer")]
fn open_encoder(path: &Path, stream: &VideoStream) -> PipelineResult<Box<dyn VideoEncoder>> {
    Ok(Box::new(super::gst_avi::GstAviEncoder::create(path, stream)?))
}

#[cfg(not(feature = "video-gstreamer"))]
fn open_encoder(path: &Path, _stream: &VideoStream) -> PipelineResult<Box<dyn VideoEncoder>> {
    Err(PipelineError::Config(format!(
        "recording {} requires the video-gstreamer feature",
        path.display()
    )))
}

impl Sink for VideoRecorder {
    fn name(&self) -> &str {
        SINK_NAME
    }

    fn choice(&self) -> FrameChoice {
        self.stream.choice
    }

    fn write(&mut self, image: SinkImage<'_>) -> PipelineResult<Delivery> {
        if image.width() != self.stream.width || image.height() != self.stream.height {
            self.mismatches += 1;
            return Err(PipelineError::FrameSizeMismatch {
                width: self.stream.width,
                height: self.stream.height,
                got_width: image.width(),
                got_height: image.height(),
            });
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(PipelineError::write(SINK_NAME, "recorder already closed"));
        };
        let pixels: Cow<'_, [u8]> = match (self.stream.color(), image) {
            (StreamColor::Gray, SinkImage::Mask(mask)) => Cow::Borrowed(mask.data()),
            (StreamColor::Gray, SinkImage::Original(_)) => {
                return Err(PipelineError::write(SINK_NAME, "gray stream cannot take a colour frame"))
            }
            (StreamColor::Rgb, image) => Cow::Owned(image.to_rgb()),
        };
        encoder.push(&pixels)?;
        self.frames += 1;
        Ok(Delivery::Delivered)
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.finalize()?;
        log::info!(
            "VideoRecorder: closed {} after {} frames",
            self.label,
            self.frames
        );
        Ok(())
    }
}

impl Drop for VideoRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.finalize() {
            log::error!(
                "VideoRecorder: failed to finalize {} on drop: [{}] {}",
                self.label,
                err.code(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Mask, PixelFormat};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Tape {
        frames: Vec<Vec<u8>>,
        finished: u32,
    }

    struct TapeEncoder(Arc<Mutex<Tape>>);

    impl VideoEncoder for TapeEncoder {
        fn push(&mut self, pixels: &[u8]) -> PipelineResult<()> {
            self.0.lock().unwrap().frames.push(pixels.to_vec());
            Ok(())
        }

        fn finish(&mut self) -> PipelineResult<()> {
            self.0.lock().unwrap().finished += 1;
            Ok(())
        }
    }

    fn recorder(width: u32, height: u32, choice: FrameChoice) -> (VideoRecorder, Arc<Mutex<Tape>>) {
        let tape = Arc::new(Mutex::new(Tape::default()));
        let stream = VideoStream::new(width, height, 30, 90, choice).unwrap();
        let recorder = VideoRecorder::with_encoder(Box::new(TapeEncoder(Arc::clone(&tape))), "tape", stream);
        (recorder, tape)
    }

    fn frame(width: u32, height: u32) -> Frame {
        Frame::new(vec![40; (width * height * 3) as usize], width, height, PixelFormat::Bgr8).unwrap()
    }

    #[test]
    fn records_and_finalizes_on_close() {
        let (mut recorder, tape) = recorder(16, 8, FrameChoice::Original);
        let frame = frame(16, 8);
        for _ in 0..3 {
            recorder.write(SinkImage::Original(&frame)).unwrap();
        }
        recorder.close().unwrap();
        recorder.close().unwrap();

        let tape = tape.lock().unwrap();
        assert_eq!(tape.frames.len(), 3);
        assert_eq!(tape.frames[0].len(), 16 * 8 * 3);
        assert_eq!(tape.finished, 1);
    }

    #[test]
    fn mismatched_frame_is_rejected_without_writing() {
        let (mut recorder, tape) = recorder(640, 480, FrameChoice::Original);
        let err = recorder.write(SinkImage::Original(&frame(320, 240))).unwrap_err();
        assert_eq!(
            err,
            PipelineError::FrameSizeMismatch {
                width: 640,
                height: 480,
                got_width: 320,
                got_height: 240
            }
        );
        assert_eq!(recorder.frames_written(), 0);
        assert_eq!(recorder.size_mismatches(), 1);
        assert!(tape.lock().unwrap().frames.is_empty());
    }

    #[test]
    fn mask_frames_are_recorded_as_gray() {
        let (mut recorder, tape) = recorder(4, 4, FrameChoice::Mask);
        let mask = Mask::new(vec![255; 16], 4, 4).unwrap();
        recorder.write(SinkImage::Mask(&mask)).unwrap();
        assert_eq!(recorder.stream().frame_bytes(), 16);
        drop(recorder);

        let tape = tape.lock().unwrap();
        assert_eq!(tape.frames, vec![vec![255; 16]]);
        assert_eq!(tape.finished, 1);
    }

    #[test]
    fn writes_after_close_fail() {
        let (mut recorder, _tape) = recorder(4, 4, FrameChoice::Original);
        recorder.close().unwrap();
        let err = recorder.write(SinkImage::Original(&frame(4, 4))).unwrap_err();
        assert_eq!(err.code(), "WRITE_ERROR");
    }

    #[test]
    fn stream_settings_are_validated() {
        assert!(VideoStream::new(4, 4, 0, 90, FrameChoice::Original).is_err());
        assert!(VideoStream::new(0, 4, 30, 90, FrameChoice::Original).is_err());
        assert!(VideoStream::new(4, 4, 30, 0, FrameChoice::Original).is_err());
    }

    #[cfg(not(feature = "video-gstreamer"))]
    #[test]
    fn opening_a_file_needs_the_gstreamer_backend() {
        let dir = tempfile::tempdir().unwrap();
        let err = VideoRecorder::open(&dir.path().join("out.avi"), 4, 4, 30, 90, FrameChoice::Original)
            .err()
            .unwrap();
        assert_eq!(err.code(), "CONFIG");
    }
}
