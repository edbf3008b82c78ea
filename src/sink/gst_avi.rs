//! Motion-JPEG AVI recording through GStreamer.
//!
//! Pipeline: `appsrc ! videoconvert ! jpegenc ! avimux ! filesink`
//!
//! Frames are pushed with timestamps derived from the stream rate. `avimux` only
//! writes the index and the final header fields when end-of-stream reaches it, so
//! `finish` sends EOS and waits for it on the bus before tearing the pipeline
//! down.

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use super::video::{StreamColor, VideoEncoder, VideoStream};
use crate::error::{PipelineError, PipelineResult};

const SINK_NAME: &str = "video";
const EOS_TIMEOUT_SECS: u64 = 5;

pub struct GstAviEncoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    info: gst_video::VideoInfo,
    row_bytes: usize,
    frame_ns: u64,
    path: PathBuf,
    pushed: u64,
    finished: bool,
}

impl GstAviEncoder {
    pub fn create(path: &Path, stream: &VideoStream) -> PipelineResult<Self> {
        gst::init().map_err(|e| fail(format!("initialize gstreamer: {}", e)))?;

        let format = match stream.color() {
            StreamColor::Rgb => gst_video::VideoFormat::Rgb,
            StreamColor::Gray => gst_video::VideoFormat::Gray8,
        };
        let info = gst_video::VideoInfo::builder(format, stream.width, stream.height)
            .fps(gst::Fraction::new(stream.fps as i32, 1))
            .build()
            .map_err(|e| fail(format!("video info: {}", e)))?;
        let caps = info
            .to_caps()
            .map_err(|e| fail(format!("video caps: {}", e)))?;

        let description = format!(
            "appsrc name=src ! videoconvert ! jpegenc quality={} ! avimux ! filesink name=sink",
            stream.quality
        );
        let pipeline = gst::parse::launch(&description)
            .map_err(|e| fail(format!("build recording pipeline: {}", e)))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| fail("recording pipeline is not a Pipeline"))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| fail("appsrc element missing from pipeline"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| fail("appsrc element has unexpected type"))?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_format(gst::Format::Time);

        let filesink = pipeline
            .by_name("sink")
            .ok_or_else(|| fail("filesink element missing from pipeline"))?;
        filesink.set_property("location", path.to_string_lossy().to_string());

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| fail(format!("start recording pipeline: {}", e)))?;
        log::debug!("GstAviEncoder: pipeline playing for {}", path.display());

        Ok(Self {
            pipeline,
            appsrc,
            info,
            row_bytes: stream.width as usize * stream.color().bytes_per_pixel(),
            frame_ns: 1_000_000_000 / u64::from(stream.fps),
            path: path.to_path_buf(),
            pushed: 0,
            finished: false,
        })
    }

    /// Surface an error posted by any element since the last frame.
    fn poll_bus(&self) -> PipelineResult<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = message.view() {
                return Err(fail(format!(
                    "{}: gstreamer error from {:?}: {}",
                    self.path.display(),
                    err.src().map(|s| s.path_string()),
                    err.error()
                )));
            }
        }
        Ok(())
    }

    fn wait_for_eos(&self) -> PipelineResult<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Err(fail("recording pipeline has no bus"));
        };
        for message in bus.iter_timed(gst::ClockTime::from_seconds(EOS_TIMEOUT_SECS)) {
            match message.view() {
                gst::MessageView::Eos(..) => return Ok(()),
                gst::MessageView::Error(err) => {
                    return Err(fail(format!(
                        "{}: gstreamer error from {:?}: {}",
                        self.path.display(),
                        err.src().map(|s| s.path_string()),
                        err.error()
                    )))
                }
                _ => {}
            }
        }
        Err(fail(format!(
            "{}: no end-of-stream within {} s",
            self.path.display(),
            EOS_TIMEOUT_SECS
        )))
    }

    /// Lay rows out at the stride GStreamer expects for this format.
    fn strided(&self, pixels: &[u8]) -> PipelineResult<Vec<u8>> {
        let height = self.info.height() as usize;
        if pixels.len() != self.row_bytes * height {
            return Err(PipelineError::InvalidDimensions(format!(
                "{} bytes for a {}x{} stream",
                pixels.len(),
                self.info.width(),
                height
            )));
        }
        let stride = self.info.stride()[0] as usize;
        if stride == self.row_bytes {
            return Ok(pixels.to_vec());
        }
        let mut out = vec![0u8; self.info.size()];
        for (row, src) in pixels.chunks_exact(self.row_bytes).enumerate() {
            out[row * stride..row * stride + self.row_bytes].copy_from_slice(src);
        }
        Ok(out)
    }
}

impl VideoEncoder for GstAviEncoder {
    fn push(&mut self, pixels: &[u8]) -> PipelineResult<()> {
        self.poll_bus()?;
        let mut buffer = gst::Buffer::from_mut_slice(self.strided(pixels)?);
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| fail("new frame buffer is shared"))?;
            buffer.set_pts(gst::ClockTime::from_nseconds(self.pushed * self.frame_ns));
            buffer.set_duration(gst::ClockTime::from_nseconds(self.frame_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| fail(format!("{}: push frame: {:?}", self.path.display(), e)))?;
        self.pushed += 1;
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let result = self
            .appsrc
            .end_of_stream()
            .map_err(|e| fail(format!("{}: send end-of-stream: {:?}", self.path.display(), e)))
            .and_then(|_| self.wait_for_eos());
        if let Err(err) = self.pipeline.set_state(gst::State::Null) {
            log::warn!("GstAviEncoder: stopping pipeline: {}", err);
        }
        if result.is_ok() {
            log::info!(
                "GstAviEncoder: finalized {} ({} frames)",
                self.path.display(),
                self.pushed
            );
        }
        result
    }
}

impl Drop for GstAviEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn fail(message: impl std::fmt::Display) -> PipelineError {
    PipelineError::write(SINK_NAME, message)
}

#[cfg(test)]
mod tests {
    use crate::frame::{Frame, PixelFormat};
    use crate::sink::{avi, FrameChoice, Sink, SinkImage, VideoRecorder};

    #[test]
    fn recorded_file_is_a_finalized_avi() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.avi");
        // Odd width, so RGB rows need stride padding.
        let mut recorder = VideoRecorder::open(&path, 15, 8, 30, 90, FrameChoice::Original).unwrap();
        let frame = Frame::new(vec![90; 15 * 8 * 3], 15, 8, PixelFormat::Bgr8).unwrap();
        for _ in 0..3 {
            recorder.write(SinkImage::Original(&frame)).unwrap();
        }
        recorder.close().unwrap();

        let info = avi::inspect(&path).unwrap();
        assert!(info.is_finalized());
        assert_eq!((info.width, info.height, info.fps, info.chunks), (15, 8, 30, 3));

        let first = &avi::read_frames(&path).unwrap()[0];
        let decoded = image::load_from_memory(first).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (15, 8));
    }
}
