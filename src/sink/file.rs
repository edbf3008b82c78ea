use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::ImageEncoder;
use serde::{Deserialize, Serialize};

use super::{Delivery, FrameChoice, Sink, SinkImage};
use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

const SINK_NAME: &str = "file";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormatChoice {
    Jpg,
    Png,
}

impl ImageFormatChoice {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormatChoice::Jpg => "jpg",
            ImageFormatChoice::Png => "png",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormatChoice::Jpg),
            "png" => Some(ImageFormatChoice::Png),
            _ => None,
        }
    }
}

/// Writes each frame to `<dir>/<prefix><n>.<ext>`.
///
/// `n` starts at 0 and only advances after a successful write, so a failed
/// write is retried under the same number and the sequence has no gaps.
pub struct FilePersister {
    dir: PathBuf,
    prefix: String,
    format: ImageFormatChoice,
    jpeg_quality: u8,
    choice: FrameChoice,
    next_index: u64,
}

impl FilePersister {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: &str,
        format: ImageFormatChoice,
        jpeg_quality: u8,
        choice: FrameChoice,
    ) -> PipelineResult<Self> {
        if !(1..=100).contains(&jpeg_quality) {
            return Err(PipelineError::Config(format!(
                "jpeg quality must be within 1..=100, got {}",
                jpeg_quality
            )));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            PipelineError::write(SINK_NAME, format!("create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            format,
            jpeg_quality,
            choice,
            next_index: 0,
        })
    }

    /// Number of files written so far.
    pub fn written(&self) -> u64 {
        self.next_index
    }

    pub fn path_for(&self, index: u64) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            self.prefix,
            index,
            self.format.extension()
        ))
    }

    fn encode_to(&self, path: &Path, image: &SinkImage<'_>) -> PipelineResult<()> {
        let (pixels, color) = image.encodable();
        let (w, h) = (image.width(), image.height());
        let file = File::create(path)
            .map_err(|e| PipelineError::write(SINK_NAME, format!("{}: {}", path.display(), e)))?;
        let mut out = BufWriter::new(file);
        let encoded = match self.format {
            ImageFormatChoice::Jpg => {
                JpegEncoder::new_with_quality(&mut out, self.jpeg_quality).encode(&pixels, w, h, color)
            }
            ImageFormatChoice::Png => PngEncoder::new(&mut out).write_image(&pixels, w, h, color),
        };
        encoded.map_err(|e| PipelineError::write(SINK_NAME, format!("{}: {}", path.display(), e)))?;
        out.flush()
            .map_err(|e| PipelineError::write(SINK_NAME, format!("{}: {}", path.display(), e)))
    }
}

impl Sink for FilePersister {
    fn name(&self) -> &str {
        SINK_NAME
    }

    fn choice(&self) -> FrameChoice {
        self.choice
    }

    fn write(&mut self, image: SinkImage<'_>) -> PipelineResult<Delivery> {
        let path = self.path_for(self.next_index);
        if let Err(err) = self.encode_to(&path, &image) {
            // Leave no half-written file under a number that will be reused.
            let _ = fs::remove_file(&path);
            return Err(err);
        }
        log::debug!(
            "FilePersister: frame {} -> {}",
            image.sequence(),
            path.display()
        );
        self.next_index += 1;
        Ok(Delivery::Delivered)
    }

    fn close(&mut self) -> PipelineResult<()> {
        log::info!(
            "FilePersister: wrote {} images to {}",
            self.next_index,
            self.dir.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Mask, PixelFormat};

    fn frame() -> Frame {
        // 2x1 BGR: pure red, pure blue.
        Frame::new(vec![0, 0, 255, 255, 0, 0], 2, 1, PixelFormat::Bgr8).unwrap()
    }

    #[test]
    fn png_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            FilePersister::new(dir.path(), "image_", ImageFormatChoice::Png, 95, FrameChoice::Original)
                .unwrap();
        let frame = frame();
        sink.write(SinkImage::Original(&frame)).unwrap();

        let decoded = image::open(dir.path().join("image_0.png")).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (2, 1));
        assert_eq!(decoded.into_raw(), vec![255, 0, 0, 0, 0, 255]);
    }

    #[test]
    fn numbering_is_sequential_without_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink =
            FilePersister::new(dir.path(), "image_", ImageFormatChoice::Jpg, 90, FrameChoice::Mask)
                .unwrap();
        let mask = Mask::new(vec![0, 255], 2, 1).unwrap();
        for _ in 0..3 {
            sink.write(SinkImage::Mask(&mask)).unwrap();
        }
        assert_eq!(sink.written(), 3);
        for n in 0..3 {
            assert!(dir.path().join(format!("image_{}.jpg", n)).exists());
        }
        assert!(!dir.path().join("image_3.jpg").exists());
    }

    #[test]
    fn failed_write_keeps_counter() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("frames");
        let mut sink =
            FilePersister::new(&out, "image_", ImageFormatChoice::Png, 95, FrameChoice::Original)
                .unwrap();
        fs::remove_dir(&out).unwrap();

        let frame = frame();
        let err = sink.write(SinkImage::Original(&frame)).unwrap_err();
        assert_eq!(err.code(), "WRITE_ERROR");
        assert_eq!(sink.written(), 0);

        fs::create_dir(&out).unwrap();
        sink.write(SinkImage::Original(&frame)).unwrap();
        assert!(out.join("image_0.png").exists());
    }

    #[test]
    fn rejects_out_of_range_quality() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            FilePersister::new(dir.path(), "image_", ImageFormatChoice::Jpg, 0, FrameChoice::Original)
                .is_err()
        );
    }
}
