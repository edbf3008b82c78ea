//! Live display sink.
//!
//! Rendering happens on its own thread. The pipeline hands frames over through a
//! one-slot channel and never waits: if the slot is still taken, the frame waiting
//! there is pulled back out and dropped so the surface always gets the newest one.
//! Surface errors stay on the render thread.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::Serialize;

use super::{Delivery, FrameChoice, Sink, SinkImage};
use crate::error::{PipelineError, PipelineResult};

const SINK_NAME: &str = "display";

/// Something that can show one RGB image at a time.
pub trait DisplaySurface: Send {
    fn name(&self) -> &str;

    fn show(&mut self, width: u32, height: u32, rgb: &[u8]) -> PipelineResult<()>;

    fn close(&mut self) {}
}

/// Discards everything. Used when no output surface is available.
#[derive(Debug, Default)]
pub struct NullSurface;

impl DisplaySurface for NullSurface {
    fn name(&self) -> &str {
        "null"
    }

    fn show(&mut self, _width: u32, _height: u32, _rgb: &[u8]) -> PipelineResult<()> {
        Ok(())
    }
}

/// Keeps a PNG on disk showing the latest frame, replaced atomically so an
/// external viewer never reads a partial image.
#[derive(Debug)]
pub struct PreviewFileSurface {
    path: PathBuf,
}

impl PreviewFileSurface {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DisplaySurface for PreviewFileSurface {
    fn name(&self) -> &str {
        "preview-file"
    }

    fn show(&mut self, width: u32, height: u32, rgb: &[u8]) -> PipelineResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let fail = |e: &dyn std::fmt::Display| {
            PipelineError::write(SINK_NAME, format!("{}: {}", self.path.display(), e))
        };
        {
            let file = File::create(&tmp_path).map_err(|e| fail(&e))?;
            let mut out = BufWriter::new(file);
            PngEncoder::new(&mut out)
                .write_image(rgb, width, height, ExtendedColorType::Rgb8)
                .map_err(|e| fail(&e))?;
            out.flush().map_err(|e| fail(&e))?;
        }
        fs::rename(&tmp_path, &self.path).map_err(|e| fail(&e))?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DisplayStats {
    pub rendered: u64,
    pub dropped: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    rendered: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Read-only view of a display's counters that outlives the sink being moved
/// into a fan-out.
#[derive(Clone)]
pub struct DisplayMonitor {
    counters: Arc<Counters>,
}

impl DisplayMonitor {
    pub fn snapshot(&self) -> DisplayStats {
        DisplayStats {
            rendered: self.counters.rendered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

struct DisplayFrame {
    sequence: u64,
    width: u32,
    height: u32,
    rgb: Vec<u8>,
}

pub struct LiveDisplay {
    tx: Option<Sender<DisplayFrame>>,
    /// Receiving end of the slot, used to evict a frame not yet rendered.
    pending_rx: Option<Receiver<DisplayFrame>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
    choice: FrameChoice,
}

impl LiveDisplay {
    pub fn spawn(mut surface: Box<dyn DisplaySurface>, choice: FrameChoice) -> PipelineResult<Self> {
        let (tx, rx) = crossbeam_channel::bounded::<DisplayFrame>(1);
        let pending_rx = rx.clone();
        let counters = Arc::new(Counters::default());
        let thread_counters = Arc::clone(&counters);
        let surface_name = surface.name().to_string();

        let worker = std::thread::Builder::new()
            .name("live-display".into())
            .spawn(move || {
                for frame in rx.iter() {
                    match surface.show(frame.width, frame.height, &frame.rgb) {
                        Ok(()) => {
                            thread_counters.rendered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            thread_counters.errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!(
                                "LiveDisplay: {} failed to show frame {}: [{}] {}",
                                surface.name(),
                                frame.sequence,
                                err.code(),
                                err
                            );
                        }
                    }
                }
                surface.close();
            })
            .map_err(|e| PipelineError::write(SINK_NAME, format!("spawn render thread: {}", e)))?;

        log::info!("LiveDisplay: rendering {:?} to {}", choice, surface_name);
        Ok(Self {
            tx: Some(tx),
            pending_rx: Some(pending_rx),
            worker: Some(worker),
            counters,
            choice,
        })
    }

    pub fn monitor(&self) -> DisplayMonitor {
        DisplayMonitor {
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn stats(&self) -> DisplayStats {
        self.monitor().snapshot()
    }
}

impl Sink for LiveDisplay {
    fn name(&self) -> &str {
        SINK_NAME
    }

    fn choice(&self) -> FrameChoice {
        self.choice
    }

    fn write(&mut self, image: SinkImage<'_>) -> PipelineResult<Delivery> {
        let (Some(tx), Some(pending_rx)) = (self.tx.as_ref(), self.pending_rx.as_ref()) else {
            return Err(PipelineError::write(SINK_NAME, "display closed"));
        };
        let frame = DisplayFrame {
            sequence: image.sequence(),
            width: image.width(),
            height: image.height(),
            rgb: image.to_rgb(),
        };
        let frame = match tx.try_send(frame) {
            Ok(()) => return Ok(Delivery::Delivered),
            Err(TrySendError::Disconnected(_)) => {
                return Err(PipelineError::write(SINK_NAME, "render thread exited"))
            }
            Err(TrySendError::Full(frame)) => frame,
        };

        // Only this sink sends, so once the pending frame is out the slot is free.
        let mut replaced = false;
        if let Ok(stale) = pending_rx.try_recv() {
            log::debug!(
                "LiveDisplay: frame {} replaced by {}",
                stale.sequence,
                frame.sequence
            );
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            replaced = true;
        }
        match tx.try_send(frame) {
            Ok(()) if replaced => Ok(Delivery::Replaced),
            Ok(()) => Ok(Delivery::Delivered),
            Err(TrySendError::Full(frame)) => {
                // Not reachable with a single sender; account for it as a drop.
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("LiveDisplay: frame {} dropped", frame.sequence);
                Ok(Delivery::Replaced)
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(PipelineError::write(SINK_NAME, "render thread exited"))
            }
        }
    }

    fn close(&mut self) -> PipelineResult<()> {
        self.tx = None;
        self.pending_rx = None;
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        if worker.join().is_err() {
            return Err(PipelineError::write(SINK_NAME, "render thread panicked"));
        }
        let stats = self.stats();
        log::info!(
            "LiveDisplay: closed ({} rendered, {} dropped, {} errors)",
            stats.rendered,
            stats.dropped,
            stats.errors
        );
        Ok(())
    }
}

impl Drop for LiveDisplay {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Mask;
    use std::sync::Mutex;
    use std::time::Duration;

    struct SlowSurface {
        delay: Duration,
        shown: Arc<Mutex<Vec<(u32, u32)>>>,
    }

    impl DisplaySurface for SlowSurface {
        fn name(&self) -> &str {
            "slow"
        }

        fn show(&mut self, width: u32, height: u32, rgb: &[u8]) -> PipelineResult<()> {
            std::thread::sleep(self.delay);
            assert_eq!(rgb.len(), (width * height * 3) as usize);
            self.shown.lock().unwrap().push((width, height));
            Ok(())
        }
    }

    struct BrokenSurface;

    impl DisplaySurface for BrokenSurface {
        fn name(&self) -> &str {
            "broken"
        }

        fn show(&mut self, _: u32, _: u32, _: &[u8]) -> PipelineResult<()> {
            Err(PipelineError::write("display", "no window"))
        }
    }

    #[test]
    fn slow_surface_gets_the_newest_frame_without_blocking() {
        let shown = Arc::new(Mutex::new(Vec::new()));
        let surface = SlowSurface {
            delay: Duration::from_millis(200),
            shown: Arc::clone(&shown),
        };
        let mut display = LiveDisplay::spawn(Box::new(surface), FrameChoice::Mask).unwrap();

        // Widths tell the frames apart on the surface side.
        let started = std::time::Instant::now();
        let outcomes: Vec<Delivery> = (1..=10u32)
            .map(|width| {
                let mask = Mask::new(vec![255; width as usize], width, 1).unwrap();
                display.write(SinkImage::Mask(&mask)).unwrap()
            })
            .collect();
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(outcomes.contains(&Delivery::Replaced));

        display.close().unwrap();
        let stats = display.stats();
        let shown = shown.lock().unwrap();
        assert_eq!(shown.last(), Some(&(10, 1)));
        assert_eq!(stats.rendered, shown.len() as u64);
        assert_eq!(stats.rendered + stats.dropped, 10);
        let replaced = outcomes.iter().filter(|o| **o == Delivery::Replaced).count() as u64;
        assert_eq!(stats.dropped, replaced);
    }

    #[test]
    fn surface_errors_stay_on_render_thread() {
        let mut display = LiveDisplay::spawn(Box::new(BrokenSurface), FrameChoice::Mask).unwrap();
        let mask = Mask::new(vec![0; 4], 2, 2).unwrap();
        assert!(display.write(SinkImage::Mask(&mask)).is_ok());
        display.close().unwrap();
        assert_eq!(display.stats().errors, 1);
    }

    #[test]
    fn preview_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preview.png");
        let mut surface = PreviewFileSurface::new(&path);
        surface.show(1, 1, &[255, 0, 0]).unwrap();
        surface.show(2, 1, &[0, 0, 255, 0, 255, 0]).unwrap();
        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (2, 1));
        assert!(!path.with_extension("tmp").exists());
    }
}
