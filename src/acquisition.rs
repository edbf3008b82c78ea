//! Acquisition engine.
//!
//! A producer thread drives the capture source: it checks a buffer out of the pool,
//! lets the source fill it, wraps it in a `GrabResult` and hands it to the consumer
//! over a bounded channel. The consumer side is `retrieve`, the only place the
//! processing loop waits.
//!
//! ```text
//!   CaptureSource ──grab_into──► producer thread ──try_send──► [handoff] ──► retrieve()
//!        ▲                           │  ▲                                       │
//!        │                      acquire  │ stale result dropped (LatestOnly)    │
//!        └──────────── BufferPool ◄──────┴──────────── buffer released ◄────────┘
//! ```
//!
//! Under `LatestOnly` the handoff holds a single result. When a newer frame is ready
//! and the slot is still occupied, the producer pulls the stale result out itself
//! and drops it, which returns its buffer before the next `acquire`. Under
//! `AllFrames` the handoff holds up to pool-capacity results; when it is full or no
//! buffer is free the new frame is skipped and counted. The producer never blocks
//! on the consumer.
//!
//! `stop` drops the stop sender. Both the producer and any in-flight `retrieve`
//! observe the disconnect immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::frame::GrabResult;
use crate::ingest::{CaptureOutcome, CaptureSource, DeviceInfo};
use crate::pool::{BufferPool, PooledBuffer};

/// Which pending frame `retrieve` hands out when several are ready.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabStrategy {
    /// Every captured frame is queued, oldest first.
    AllFrames,
    /// Only the freshest frame is kept; older ones are discarded.
    #[default]
    LatestOnly,
}

impl GrabStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "allframes" | "all" => Some(GrabStrategy::AllFrames),
            "latestonly" | "latest" => Some(GrabStrategy::LatestOnly),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Grabbing,
    Stopped,
    Error,
}

/// Engine counters, readable at any time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AcquisitionStats {
    /// Results handed out by `retrieve`, failed grabs included.
    pub delivered: u64,
    pub failed_grabs: u64,
    /// Frames discarded under `LatestOnly` because a newer one arrived first.
    pub dropped_stale: u64,
    /// Frames skipped under `AllFrames` because the queue or pool was full.
    pub skipped_no_buffer: u64,
    pub buffers_in_use: usize,
    pub peak_buffers_in_use: usize,
    pub rejected_releases: u64,
}

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

struct EngineShared {
    inner: Mutex<SharedState>,
    dropped_stale: AtomicU64,
    skipped_no_buffer: AtomicU64,
}

struct SharedState {
    state: EngineState,
    error: Option<PipelineError>,
    stop_tx: Option<Sender<()>>,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SharedState {
                state: EngineState::Idle,
                error: None,
                stop_tx: None,
            }),
            dropped_stale: AtomicU64::new(0),
            skipped_no_buffer: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> EngineState {
        self.lock().state
    }

    fn request_stop(&self) {
        let mut inner = self.lock();
        if inner.state == EngineState::Grabbing {
            inner.state = EngineState::Stopped;
        }
        // Dropping the sender disconnects every stop receiver.
        inner.stop_tx.take();
    }

    /// Record an unrecoverable fault. The first fault wins.
    fn fail(&self, err: PipelineError) {
        let mut inner = self.lock();
        if inner.state == EngineState::Grabbing {
            log::error!("AcquisitionEngine: {} ({})", err, err.code());
            inner.state = EngineState::Error;
            inner.error = Some(err);
        } else {
            log::warn!("AcquisitionEngine: fault after stop ignored: {}", err);
        }
        inner.stop_tx.take();
    }

    fn error(&self) -> Option<PipelineError> {
        self.lock().error.clone()
    }
}

/// Cloneable handle that stops grabbing from any thread.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<EngineShared>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }
}

// ----------------------------------------------------------------------------
// AcquisitionEngine
// ----------------------------------------------------------------------------

pub struct AcquisitionEngine {
    source: Option<Box<dyn CaptureSource>>,
    device: DeviceInfo,
    pool: BufferPool,
    shared: Arc<EngineShared>,
    frames: Option<Receiver<GrabResult>>,
    stop_rx: Option<Receiver<()>>,
    producer: Option<JoinHandle<Box<dyn CaptureSource>>>,
    strategy: GrabStrategy,
    frame_budget: u64,
    delivered: u64,
    failed_grabs: u64,
}

impl AcquisitionEngine {
    /// Open the device and size a pool of `pool_capacity` buffers for its frames.
    pub fn open(mut source: Box<dyn CaptureSource>, pool_capacity: usize) -> PipelineResult<Self> {
        if pool_capacity == 0 {
            return Err(PipelineError::Config(
                "buffer pool capacity must be at least 1".into(),
            ));
        }
        let device = source.open()?;
        log::info!("Using device {} {}", device.vendor, device.model);
        log::info!(
            "AcquisitionEngine: {}x{} {}, {} buffers of {} bytes",
            device.width,
            device.height,
            device.pixel_format,
            pool_capacity,
            device.max_frame_bytes
        );
        let pool = BufferPool::new(pool_capacity, device.max_frame_bytes);
        Ok(Self {
            source: Some(source),
            device,
            pool,
            shared: Arc::new(EngineShared::new()),
            frames: None,
            stop_rx: None,
            producer: None,
            strategy: GrabStrategy::default(),
            frame_budget: 0,
            delivered: 0,
            failed_grabs: 0,
        })
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_grabbing(&self) -> bool {
        self.state() == EngineState::Grabbing
    }

    pub fn strategy(&self) -> GrabStrategy {
        self.strategy
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start grabbing. Grabbing stops by itself after `frame_budget` retrievals;
    /// a budget of zero leaves the engine stopped straight away.
    pub fn start(&mut self, frame_budget: u64, strategy: GrabStrategy) -> PipelineResult<()> {
        match self.state() {
            EngineState::Grabbing => {
                return Err(PipelineError::Config("engine is already grabbing".into()))
            }
            EngineState::Error => {
                return Err(self
                    .shared
                    .error()
                    .unwrap_or_else(|| PipelineError::DeviceError("engine faulted".into())))
            }
            EngineState::Idle | EngineState::Stopped => {}
        }
        self.join_producer();

        self.strategy = strategy;
        self.frame_budget = frame_budget;
        self.delivered = 0;
        self.failed_grabs = 0;

        if frame_budget == 0 {
            self.shared.lock().state = EngineState::Stopped;
            log::info!("AcquisitionEngine: frame budget is zero, nothing to grab");
            return Ok(());
        }

        let source = self
            .source
            .take()
            .ok_or_else(|| PipelineError::DeviceError("capture source unavailable".into()))?;

        let depth = match strategy {
            GrabStrategy::LatestOnly => 1,
            GrabStrategy::AllFrames => self.pool.capacity(),
        };
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(depth);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        {
            let mut inner = self.shared.lock();
            inner.state = EngineState::Grabbing;
            inner.error = None;
            inner.stop_tx = Some(stop_tx);
        }

        let producer = Producer {
            pool: self.pool.clone(),
            shared: Arc::clone(&self.shared),
            strategy,
            frame_tx,
            stale_rx: frame_rx.clone(),
            stop_rx: stop_rx.clone(),
            format: self.device.pixel_format,
            started: Instant::now(),
        };
        let handle = std::thread::Builder::new()
            .name("grab-producer".into())
            .spawn(move || producer.run(source));
        match handle {
            Ok(handle) => self.producer = Some(handle),
            Err(err) => {
                let err = PipelineError::DeviceError(format!("spawn producer thread: {}", err));
                self.shared.fail(err.clone());
                return Err(err);
            }
        }

        self.frames = Some(frame_rx);
        self.stop_rx = Some(stop_rx);
        log::info!(
            "AcquisitionEngine: grabbing {} frames ({:?})",
            frame_budget,
            strategy
        );
        Ok(())
    }

    /// Wait up to `timeout` for the next result.
    ///
    /// Failed grabs are delivered as results (check `grab_succeeded`); `Err` means
    /// nothing was delivered: `Timeout`, `Stopped`, or the fault that ended
    /// grabbing.
    pub fn retrieve(&mut self, timeout: Duration) -> PipelineResult<GrabResult> {
        match self.state() {
            EngineState::Grabbing => {}
            EngineState::Error => return Err(self.fault()),
            EngineState::Idle | EngineState::Stopped => return Err(PipelineError::Stopped),
        }
        let (Some(frames), Some(stop_rx)) = (self.frames.as_ref(), self.stop_rx.as_ref()) else {
            return Err(PipelineError::Stopped);
        };

        let received = crossbeam_channel::select! {
            recv(frames) -> msg => msg.ok(),
            recv(stop_rx) -> _ => None,
            default(timeout) => {
                return Err(PipelineError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        // A result that raced with stop is discarded.
        let result = match (received, self.state()) {
            (Some(result), EngineState::Grabbing) => result,
            (_, EngineState::Error) => return Err(self.fault()),
            _ => return Err(PipelineError::Stopped),
        };

        self.delivered += 1;
        if !result.grab_succeeded() {
            self.failed_grabs += 1;
        }
        if self.delivered >= self.frame_budget {
            log::info!(
                "AcquisitionEngine: frame budget of {} reached",
                self.frame_budget
            );
            self.shared.request_stop();
        }
        Ok(result)
    }

    /// Stop grabbing. Safe to call from any thread through a `StopHandle`; an
    /// in-flight `retrieve` returns `Stopped` promptly.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Stop, wait for the producer, and close the device.
    pub fn shutdown(&mut self) {
        self.stop();
        self.join_producer();
        if let Some(source) = self.source.as_mut() {
            source.close();
        }
    }

    pub fn stats(&self) -> AcquisitionStats {
        AcquisitionStats {
            delivered: self.delivered,
            failed_grabs: self.failed_grabs,
            dropped_stale: self.shared.dropped_stale.load(Ordering::Relaxed),
            skipped_no_buffer: self.shared.skipped_no_buffer.load(Ordering::Relaxed),
            buffers_in_use: self.pool.in_use(),
            peak_buffers_in_use: self.pool.peak_in_use(),
            rejected_releases: self.pool.rejected_releases(),
        }
    }

    fn fault(&self) -> PipelineError {
        self.shared
            .error()
            .unwrap_or_else(|| PipelineError::DeviceError("engine faulted".into()))
    }

    fn join_producer(&mut self) {
        // Pending results hold pool buffers; release them with the channel.
        self.frames = None;
        self.stop_rx = None;
        let Some(handle) = self.producer.take() else {
            return;
        };
        match handle.join() {
            Ok(source) => self.source = Some(source),
            Err(_) => {
                self.shared
                    .fail(PipelineError::DeviceError("producer thread panicked".into()));
                log::error!("AcquisitionEngine: producer thread panicked; source lost");
            }
        }
    }
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ----------------------------------------------------------------------------
// Producer
// ----------------------------------------------------------------------------

struct Producer {
    pool: BufferPool,
    shared: Arc<EngineShared>,
    strategy: GrabStrategy,
    frame_tx: Sender<GrabResult>,
    /// Receiving end of the handoff, used to evict stale results.
    stale_rx: Receiver<GrabResult>,
    stop_rx: Receiver<()>,
    format: crate::frame::PixelFormat,
    started: Instant,
}

impl Producer {
    fn stop_requested(&self) -> bool {
        matches!(self.stop_rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn run(self, mut source: Box<dyn CaptureSource>) -> Box<dyn CaptureSource> {
        let mut sequence = 0u64;
        let mut scratch: Vec<u8> = Vec::new();

        while !self.stop_requested() {
            let mut buffer = match self.acquire(sequence + 1) {
                Ok(buffer) => buffer,
                Err(err) if self.strategy == GrabStrategy::LatestOnly => {
                    self.shared.fail(err);
                    break;
                }
                Err(_) => {
                    // No buffer: the device still exposes a frame, which is lost.
                    scratch.resize(self.pool.buffer_len(), 0);
                    match source.grab_into(&mut scratch) {
                        Ok(_) => {
                            sequence += 1;
                            self.shared.skipped_no_buffer.fetch_add(1, Ordering::Relaxed);
                            log::warn!("AcquisitionEngine: no free buffer, frame {} skipped", sequence);
                            continue;
                        }
                        Err(err) => {
                            self.shared.fail(err);
                            break;
                        }
                    }
                }
            };

            let outcome = match source.grab_into(buffer.as_mut_slice()) {
                Ok(outcome) => outcome,
                Err(err) => {
                    drop(buffer);
                    self.shared.fail(err);
                    break;
                }
            };
            sequence += 1;
            let timestamp = self.started.elapsed();

            let result = match outcome {
                CaptureOutcome::Frame { len, width, height } => GrabResult::succeeded(
                    buffer, len, width, height, self.format, sequence, timestamp,
                ),
                CaptureOutcome::Failed { code, description } => {
                    drop(buffer);
                    GrabResult::failed(code, description, self.format, sequence, timestamp)
                }
            };

            if !self.deliver(result) {
                break;
            }
        }

        log::debug!("AcquisitionEngine: producer exiting after {} frames", sequence);
        source
    }

    /// Check out a buffer. Under `LatestOnly` the result still waiting in the
    /// handoff is about to be superseded anyway, so when the pool is empty it is
    /// evicted first and its buffer reused. `Exhausted` then means the consumer
    /// itself holds every other buffer.
    fn acquire(&self, next: u64) -> PipelineResult<PooledBuffer> {
        match self.pool.acquire() {
            Err(PipelineError::Exhausted { .. }) if self.strategy == GrabStrategy::LatestOnly => {
                self.evict_stale(next);
                self.pool.acquire()
            }
            other => other,
        }
    }

    fn evict_stale(&self, next: u64) {
        if let Ok(stale) = self.stale_rx.try_recv() {
            log::debug!(
                "AcquisitionEngine: frame {} superseded by {}",
                stale.sequence(),
                next
            );
            self.shared.dropped_stale.fetch_add(1, Ordering::Relaxed);
            drop(stale);
        }
    }

    /// Hand a result to the consumer. Returns false when the consumer is gone.
    fn deliver(&self, result: GrabResult) -> bool {
        let result = match self.frame_tx.try_send(result) {
            Ok(()) => return true,
            Err(TrySendError::Disconnected(_)) => return false,
            Err(TrySendError::Full(result)) => result,
        };

        match self.strategy {
            GrabStrategy::LatestOnly => {
                self.evict_stale(result.sequence());
                match self.frame_tx.try_send(result) {
                    Ok(()) => true,
                    Err(TrySendError::Disconnected(_)) => false,
                    Err(TrySendError::Full(result)) => {
                        self.shared.dropped_stale.fetch_add(1, Ordering::Relaxed);
                        drop(result);
                        true
                    }
                }
            }
            GrabStrategy::AllFrames => {
                self.shared.skipped_no_buffer.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "AcquisitionEngine: handoff queue full, frame {} skipped",
                    result.sequence()
                );
                true
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use crate::ingest::{SyntheticConfig, SyntheticSource};

    fn engine(fps: u32, pool: usize) -> AcquisitionEngine {
        let source = SyntheticSource::new(SyntheticConfig {
            width: 16,
            height: 12,
            pixel_format: PixelFormat::Bgr8,
            target_fps: fps,
            ..SyntheticConfig::default()
        });
        AcquisitionEngine::open(Box::new(source), pool).unwrap()
    }

    #[test]
    fn strategy_names_parse() {
        assert_eq!(GrabStrategy::parse("LatestOnly"), Some(GrabStrategy::LatestOnly));
        assert_eq!(GrabStrategy::parse("all_frames"), Some(GrabStrategy::AllFrames));
        assert_eq!(GrabStrategy::parse("newest"), None);
    }

    #[test]
    fn zero_budget_is_stopped_immediately() {
        let mut engine = engine(0, 4);
        engine.start(0, GrabStrategy::LatestOnly).unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(
            engine.retrieve(Duration::from_millis(10)).unwrap_err(),
            PipelineError::Stopped
        );
        assert_eq!(engine.stats().delivered, 0);
    }

    #[test]
    fn retrieve_before_start_is_stopped() {
        let mut engine = engine(0, 4);
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(
            engine.retrieve(Duration::from_millis(10)).unwrap_err(),
            PipelineError::Stopped
        );
    }

    #[test]
    fn budget_auto_stops() {
        let mut engine = engine(0, 4);
        engine.start(5, GrabStrategy::LatestOnly).unwrap();
        for _ in 0..5 {
            let result = engine.retrieve(Duration::from_secs(2)).unwrap();
            assert!(result.grab_succeeded());
        }
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(
            engine.retrieve(Duration::from_millis(10)).unwrap_err(),
            PipelineError::Stopped
        );
        assert_eq!(engine.stats().delivered, 5);
    }

    #[test]
    fn timeout_when_no_frame_is_ready() {
        // One frame per second: the first retrieve has to wait for it.
        let mut engine = engine(1, 4);
        engine.start(10, GrabStrategy::LatestOnly).unwrap();
        let _first = engine.retrieve(Duration::from_secs(3)).unwrap();
        let err = engine.retrieve(Duration::from_millis(20)).unwrap_err();
        assert_eq!(err, PipelineError::Timeout { timeout_ms: 20 });
        assert!(engine.is_grabbing());
    }

    #[test]
    fn latest_only_reuses_the_stale_buffer_when_the_pool_is_tight() {
        // One buffer held by the consumer, one parked in the handoff.
        let mut engine = engine(200, 2);
        engine.start(100, GrabStrategy::LatestOnly).unwrap();
        let held = engine.retrieve(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let next = engine.retrieve(Duration::from_secs(2)).unwrap();
        assert!(next.grab_succeeded());
        assert!(next.sequence() > held.sequence() + 1);
        assert_eq!(engine.state(), EngineState::Grabbing);

        let stats = engine.stats();
        assert!(stats.dropped_stale > 0);
        assert!(stats.peak_buffers_in_use <= 2);
        drop(held);
        drop(next);
        engine.shutdown();
        assert_eq!(engine.pool().in_use(), 0);
    }

    #[test]
    fn shutdown_returns_every_buffer() {
        let mut engine = engine(0, 4);
        engine.start(100, GrabStrategy::AllFrames).unwrap();
        let held = engine.retrieve(Duration::from_secs(2)).unwrap();
        engine.shutdown();
        assert_eq!(engine.pool().in_use(), 1);
        drop(held);
        assert_eq!(engine.pool().in_use(), 0);
    }

    #[test]
    fn engine_can_restart_after_stop() {
        let mut engine = engine(0, 2);
        engine.start(1, GrabStrategy::LatestOnly).unwrap();
        engine.retrieve(Duration::from_secs(2)).unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start(2, GrabStrategy::AllFrames).unwrap();
        engine.retrieve(Duration::from_secs(2)).unwrap();
        engine.retrieve(Duration::from_secs(2)).unwrap();
        assert_eq!(engine.stats().delivered, 2);
    }
}
