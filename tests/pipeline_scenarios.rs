use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use grab_pipeline::pipeline::{DisplaySinkConfig, ImageSinkConfig};
use grab_pipeline::sink::{Delivery, ImageFormatChoice, SinkImage, VideoEncoder, VideoStream};
use grab_pipeline::{
    ExitReason, FrameChoice, GrabStrategy, PipelineConfig, PipelineController, PipelineResult, Sink,
    SyntheticConfig, SyntheticSource, VideoRecorder,
};

/// Records what it is given, optionally taking its time about it.
struct Collector {
    choice: FrameChoice,
    delay: Duration,
    seen: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
}

impl Collector {
    fn new(choice: FrameChoice, delay: Duration) -> (Self, Arc<Mutex<Vec<(u64, Vec<u8>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                choice,
                delay,
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

impl Sink for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    fn choice(&self) -> FrameChoice {
        self.choice
    }

    fn write(&mut self, image: SinkImage<'_>) -> PipelineResult<Delivery> {
        std::thread::sleep(self.delay);
        let pixels = match image {
            SinkImage::Original(frame) => frame.to_rgb(),
            SinkImage::Mask(mask) => mask.data().to_vec(),
        };
        self.seen.lock().unwrap().push((image.sequence(), pixels));
        Ok(Delivery::Delivered)
    }
}

/// What a recording received, in place of an encoded file.
#[derive(Default)]
struct Tape {
    frames: usize,
    finished: u32,
}

struct TapeEncoder(Arc<Mutex<Tape>>);

impl VideoEncoder for TapeEncoder {
    fn push(&mut self, _pixels: &[u8]) -> PipelineResult<()> {
        self.0.lock().unwrap().frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        self.0.lock().unwrap().finished += 1;
        Ok(())
    }
}

fn tape_recorder(width: u32, height: u32) -> (VideoRecorder, Arc<Mutex<Tape>>) {
    let tape = Arc::new(Mutex::new(Tape::default()));
    let stream = VideoStream::new(width, height, 30, 90, FrameChoice::Original).unwrap();
    let recorder = VideoRecorder::with_encoder(Box::new(TapeEncoder(Arc::clone(&tape))), "tape", stream);
    (recorder, tape)
}

fn synthetic(width: u32, height: u32, fps: u32) -> SyntheticConfig {
    SyntheticConfig {
        width,
        height,
        target_fps: fps,
        ..SyntheticConfig::default()
    }
}

fn config(budget: u64, out: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        frame_budget: budget,
        output_dir: out.to_path_buf(),
        images: None,
        video: None,
        display: None,
        ..PipelineConfig::default()
    }
}

#[test]
fn latest_only_keeps_up_with_slow_consumer() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = config(100, dir.path());
    let capacity = cfg.pool_capacity;
    let source = SyntheticSource::new(synthetic(32, 24, 150));
    let mut controller = PipelineController::with_source(cfg, Box::new(source))?;
    // Three frame intervals per frame.
    let (collector, seen) = Collector::new(FrameChoice::Mask, Duration::from_millis(20));
    controller.add_sink(Box::new(collector));

    let summary = controller.run();

    assert_eq!(summary.exit, ExitReason::BudgetExhausted);
    assert_eq!(summary.processed, 100);
    assert!(summary.fatal_error.is_none());
    assert!(summary.acquisition.dropped_stale > 0);
    assert!(summary.acquisition.peak_buffers_in_use <= capacity);
    assert_eq!(summary.acquisition.buffers_in_use, 0);
    assert_eq!(summary.acquisition.rejected_releases, 0);

    let sequences: Vec<u64> = seen.lock().unwrap().iter().map(|(seq, _)| *seq).collect();
    assert_eq!(sequences.len(), 100);
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    Ok(())
}

#[test]
fn injected_failures_are_reported_and_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = PipelineConfig {
        strategy: GrabStrategy::AllFrames,
        ..config(10, dir.path())
    };
    let source = SyntheticSource::new(SyntheticConfig {
        fail_at: vec![3, 7],
        ..synthetic(32, 24, 200)
    });
    let mut controller = PipelineController::with_source(cfg, Box::new(source))?;
    let (collector, seen) = Collector::new(FrameChoice::Original, Duration::ZERO);
    controller.add_sink(Box::new(collector));

    let summary = controller.run();
    assert_eq!(summary.frame_failures, 2);
    assert_eq!(summary.processed, 8);
    assert_eq!(summary.exit_code(), 0);
    let sequences: Vec<u64> = seen.lock().unwrap().iter().map(|(seq, _)| *seq).collect();
    assert!(!sequences.contains(&3) && !sequences.contains(&7));
    Ok(())
}

#[test]
fn video_size_mismatch_leaves_other_sinks_running() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = PipelineConfig {
        strategy: GrabStrategy::AllFrames,
        images: Some(ImageSinkConfig::default()),
        display: Some(DisplaySinkConfig::default()),
        ..config(5, dir.path())
    };
    let source = SyntheticSource::new(synthetic(320, 240, 200));
    let mut controller = PipelineController::with_source(cfg, Box::new(source))?;
    let (recorder, tape) = tape_recorder(640, 480);
    controller.add_sink(Box::new(recorder));
    let summary = controller.run();

    assert_eq!(summary.processed, 5);
    assert_eq!(summary.sink_errors("video"), 5);
    assert_eq!(summary.sinks["file"].delivered, 5);
    let display = &summary.sinks["display"];
    assert_eq!(display.delivered + display.replaced, 5);
    assert_eq!(display.failed, 0);
    assert_eq!(summary.exit_code(), 0);
    for n in 0..5 {
        assert!(dir.path().join(format!("image_{}.jpg", n)).exists());
    }

    let tape = tape.lock().unwrap();
    assert_eq!(tape.frames, 0);
    assert_eq!(tape.finished, 1);
    Ok(())
}

#[test]
fn stop_interrupts_a_waiting_retrieve() -> Result<()> {
    let dir = tempfile::tempdir()?;
    // One frame per second, so the loop is parked in retrieve most of the time.
    let source = SyntheticSource::new(synthetic(32, 24, 1));
    let mut controller = PipelineController::with_source(config(100, dir.path()), Box::new(source))?;
    let (recorder, tape) = tape_recorder(32, 24);
    controller.add_sink(Box::new(recorder));
    let stop = controller.stop_handle();

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        stop.stop();
    });
    let started = Instant::now();
    // The last observation happens when the loop exits, before the producer
    // thread (asleep until its next frame) is joined.
    let mut loop_exit = started;
    let summary = controller.run_with(|_| loop_exit = Instant::now());
    stopper.join().unwrap();

    assert_eq!(summary.exit, ExitReason::Stopped);
    let elapsed = loop_exit - started;
    assert!(elapsed < Duration::from_millis(900), "took {:?}", elapsed);
    assert_eq!(summary.timeouts, 0);

    let tape = tape.lock().unwrap();
    assert_eq!(tape.finished, 1);
    assert_eq!(tape.frames as u64, summary.sinks["video"].delivered);
    Ok(())
}

#[test]
fn device_fault_exits_nonzero_with_finalized_video() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = SyntheticSource::new(SyntheticConfig {
        fault_at: Some(6),
        ..synthetic(32, 24, 200)
    });
    let mut controller = PipelineController::with_source(config(100, dir.path()), Box::new(source))?;
    let (recorder, tape) = tape_recorder(32, 24);
    controller.add_sink(Box::new(recorder));
    let summary = controller.run();

    assert_eq!(summary.exit, ExitReason::Fatal);
    assert_eq!(summary.exit_code(), 1);
    assert!(summary.processed <= 5);
    let tape = tape.lock().unwrap();
    assert_eq!(tape.finished, 1);
    assert_eq!(tape.frames as u64, summary.processed);
    Ok(())
}

#[test]
fn zero_budget_still_closes_sinks() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let source = SyntheticSource::new(synthetic(32, 24, 30));
    let mut controller = PipelineController::with_source(config(0, dir.path()), Box::new(source))?;
    let (recorder, tape) = tape_recorder(32, 24);
    controller.add_sink(Box::new(recorder));
    let summary = controller.run();

    assert_eq!(summary.processed, 0);
    assert_eq!(summary.exit, ExitReason::BudgetExhausted);
    let tape = tape.lock().unwrap();
    assert_eq!(tape.finished, 1);
    assert_eq!(tape.frames, 0);
    Ok(())
}

#[cfg(feature = "video-gstreamer")]
#[test]
fn recorded_run_leaves_a_finalized_avi() -> Result<()> {
    use grab_pipeline::pipeline::VideoSinkConfig;
    use grab_pipeline::sink::avi;

    let dir = tempfile::tempdir()?;
    let cfg = PipelineConfig {
        strategy: GrabStrategy::AllFrames,
        video: Some(VideoSinkConfig::default()),
        ..config(5, dir.path())
    };
    let source = SyntheticSource::new(synthetic(32, 24, 200));
    let summary = PipelineController::with_source(cfg, Box::new(source))?.run();
    assert_eq!(summary.sinks["video"].delivered, 5);

    let info = avi::inspect(&dir.path().join("openCvVideo.avi"))?;
    assert!(info.is_finalized());
    assert_eq!((info.width, info.height, info.chunks), (32, 24, 5));
    Ok(())
}

#[test]
fn identical_input_gives_identical_masks() -> Result<()> {
    let mut runs = Vec::new();
    for _ in 0..2 {
        let dir = tempfile::tempdir()?;
        let cfg = PipelineConfig {
            strategy: GrabStrategy::AllFrames,
            ..config(8, dir.path())
        };
        let source = SyntheticSource::new(synthetic(48, 32, 100));
        let mut controller = PipelineController::with_source(cfg, Box::new(source))?;
        let (collector, seen) = Collector::new(FrameChoice::Mask, Duration::ZERO);
        controller.add_sink(Box::new(collector));
        controller.run();
        let masks = seen.lock().unwrap().clone();
        runs.push(masks);
    }

    let (first, second) = (&runs[0], &runs[1]);
    assert!(!first.is_empty());
    for (seq, mask) in first {
        if let Some((_, other)) = second.iter().find(|(s, _)| s == seq) {
            assert_eq!(mask, other, "mask for frame {} differs", seq);
        }
    }
    // The red disc is found.
    assert!(first.iter().any(|(_, mask)| mask.iter().any(|&v| v == 255)));
    Ok(())
}

#[test]
fn saved_png_matches_dispatched_frame() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = PipelineConfig {
        strategy: GrabStrategy::AllFrames,
        images: Some(ImageSinkConfig {
            format: ImageFormatChoice::Png,
            ..ImageSinkConfig::default()
        }),
        ..config(3, dir.path())
    };
    let source = SyntheticSource::new(synthetic(24, 16, 100));
    let mut controller = PipelineController::with_source(cfg, Box::new(source))?;
    let (collector, seen) = Collector::new(FrameChoice::Original, Duration::ZERO);
    controller.add_sink(Box::new(collector));
    let summary = controller.run();
    assert_eq!(summary.sinks["file"].delivered, 3);

    let seen = seen.lock().unwrap();
    for (n, (_, rgb)) in seen.iter().enumerate() {
        let decoded = image::open(dir.path().join(format!("image_{}.png", n)))?.to_rgb8();
        assert_eq!(decoded.dimensions(), (24, 16));
        assert_eq!(&decoded.into_raw(), rgb);
    }
    Ok(())
}
