//! Per-source stream worker.
//!
//! A `VideoStream` owns one `FrameBuffer` and one `CaptureBackend`. `start()`
//! launches a background acquisition thread that fills the buffer; failures
//! accumulate into a countdown that ends in either a reconnect (run on its own
//! supervisor thread) or a self-stop once the buffer has drained.
//!
//! States: `Stopped` -> `Streaming` <-> `CountingDown` -> `Reconnecting` -> `Streaming`.
//! At most one acquisition thread is active per worker: every loop carries the
//! generation it was launched with and exits as soon as that generation is stale,
//! and the reconnect supervisor joins the previous loop before touching the backend.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::frame::{BufferCapacity, CropRect, Frame, FrameBuffer, ResizeFn};
use crate::ingest::{
    open_backend, BackendKind, BackendOptions, CaptureBackend, CaptureMethod, SourceDescriptor,
};
use crate::record::{mjpeg_recorder_factory, RecorderFactory, RecordingRequest, RecordingSink};

/// Frame rate assumed when neither the caller nor the source provides one.
pub const FALLBACK_FPS: f64 = 30.0;

const NOTICE_INTERVAL: Duration = Duration::from_secs(1);
const STOP_POLL_SLICE: Duration = Duration::from_millis(50);

/// Worker configuration.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Continuous failure time before reconnecting (or stopping).
    pub reconnect_threshold: Duration,
    pub do_reconnect: bool,
    /// Applied to every captured frame before it is buffered.
    pub frame_crop: Option<CropRect>,
    pub buffer_capacity: BufferCapacity,
    /// Buffer occupancy above which the loop stops capturing until the consumer catches up.
    pub producer_pause_threshold: usize,
    /// Overrides the source-reported frame rate.
    pub manual_fps: Option<f64>,
    /// Archive captured frames here when set.
    pub recording_dir: Option<PathBuf>,
    pub rtsp_tcp: bool,
    /// Pause between retries once the countdown expired but frames are still buffered.
    pub drain_poll_interval: Duration,
    pub producer_pause_interval: Duration,
    pub reconnect_retry_interval: Duration,
    /// Pause after each failed capture.
    pub failure_backoff: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect_threshold: Duration::from_secs(20),
            do_reconnect: true,
            frame_crop: None,
            buffer_capacity: BufferCapacity::default(),
            producer_pause_threshold: 10,
            manual_fps: None,
            recording_dir: None,
            rtsp_tcp: true,
            drain_poll_interval: Duration::from_secs(1),
            producer_pause_interval: Duration::from_millis(10),
            reconnect_retry_interval: Duration::from_secs(1),
            failure_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Stopped,
    Streaming,
    CountingDown,
    Reconnecting,
}

/// Per-source metadata exposed to aggregator callers.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VideoInfo {
    pub video_feed_name: String,
    pub height: u32,
    pub width: u32,
    pub manual_fps_inputted: bool,
    pub fps: f64,
    pub inited: bool,
}

// ----------------------------------------------------------------------------
// Failure countdown
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Countdown {
    started: Option<Instant>,
    last_notice: Option<Instant>,
}

#[derive(Debug, PartialEq)]
struct CountdownTick {
    /// This failure started the countdown.
    first: bool,
    remaining: Duration,
    /// Progress worth reporting (at most once per second).
    notify: bool,
    expired: bool,
}

impl Countdown {
    fn reset(&mut self) {
        self.started = None;
        self.last_notice = None;
    }

    fn tick(&mut self, now: Instant, threshold: Duration) -> CountdownTick {
        let first = self.started.is_none();
        let started = *self.started.get_or_insert(now);
        let elapsed = now.saturating_duration_since(started);
        let notify = !first
            && self
                .last_notice
                .is_none_or(|last| now.saturating_duration_since(last) >= NOTICE_INTERVAL);
        if first || notify {
            self.last_notice = Some(now);
        }
        CountdownTick {
            first,
            remaining: threshold.saturating_sub(elapsed),
            notify,
            expired: elapsed > threshold,
        }
    }
}

// ----------------------------------------------------------------------------
// VideoStream
// ----------------------------------------------------------------------------

/// One source's acquisition worker.
pub struct VideoStream {
    core: Arc<StreamCore>,
}

#[derive(Default)]
struct Tasks {
    acquisition: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct StreamCore {
    name: String,
    descriptor: SourceDescriptor,
    config: StreamConfig,
    kind: BackendKind,
    backend: Mutex<Box<dyn CaptureBackend>>,
    buffer: FrameBuffer,
    stopped: AtomicBool,
    inited: AtomicBool,
    reconnecting: AtomicBool,
    generation: AtomicU64,
    state: Mutex<StreamState>,
    info: Mutex<VideoInfo>,
    recorder: Mutex<Option<Box<dyn RecordingSink>>>,
    recorder_factory: Mutex<RecorderFactory>,
    recorder_failed: AtomicBool,
    resize: Mutex<Option<ResizeFn>>,
    current_frame: Mutex<Option<Frame>>,
    tasks: Mutex<Tasks>,
    frames_captured: AtomicU64,
    reconnects: AtomicU64,
}

impl VideoStream {
    /// Build a worker whose backend is selected by `method`.
    pub fn new(
        name: impl Into<String>,
        descriptor: SourceDescriptor,
        config: StreamConfig,
        method: CaptureMethod,
    ) -> Self {
        let name = name.into();
        let options = BackendOptions {
            feed_name: name.clone(),
            rtsp_tcp: config.rtsp_tcp,
            target_fps: config.manual_fps,
            recording_dir: config.recording_dir.clone(),
        };
        let backend = open_backend(method, &descriptor, options);
        Self::with_backend(name, descriptor, config, backend)
    }

    /// Build a worker around an already constructed backend.
    pub fn with_backend(
        name: impl Into<String>,
        descriptor: SourceDescriptor,
        config: StreamConfig,
        backend: Box<dyn CaptureBackend>,
    ) -> Self {
        let name = name.into();
        let info = VideoInfo {
            video_feed_name: name.clone(),
            manual_fps_inputted: config.manual_fps.is_some(),
            fps: config.manual_fps.unwrap_or(0.0),
            ..VideoInfo::default()
        };
        let core = StreamCore {
            kind: backend.kind(),
            backend: Mutex::new(backend),
            buffer: FrameBuffer::new(config.buffer_capacity),
            name,
            descriptor,
            config,
            stopped: AtomicBool::new(true),
            inited: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            state: Mutex::new(StreamState::Stopped),
            info: Mutex::new(info),
            recorder: Mutex::new(None),
            recorder_factory: Mutex::new(mjpeg_recorder_factory()),
            recorder_failed: AtomicBool::new(false),
            resize: Mutex::new(None),
            current_frame: Mutex::new(None),
            tasks: Mutex::new(Tasks::default()),
            frames_captured: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        };
        Self {
            core: Arc::new(core),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Hook applied to every frame handed out by `read()`.
    pub fn set_resize_fn(&self, resize: Option<ResizeFn>) {
        *lock(&self.core.resize) = resize;
    }

    /// Replace the sink factory used when recording is enabled.
    pub fn set_recorder_factory(&self, factory: RecorderFactory) {
        *lock(&self.core.recorder_factory) = factory;
    }

    /// Open the source if that has not succeeded yet. Returns the initialised flag.
    pub fn ensure_inited(&self) -> bool {
        self.core.inited.load(Ordering::SeqCst) || self.core.init_source()
    }

    /// Launch the acquisition loop. No-op while already running.
    pub fn start(&self) -> Result<()> {
        let core = &self.core;
        let stale = {
            let mut tasks = core.lock_tasks()?;
            if !core.stopped.load(Ordering::SeqCst) {
                return Ok(());
            }
            (tasks.reconnect.take(), tasks.acquisition.take())
        };
        join_task(&core.name, stale.0);
        join_task(&core.name, stale.1);
        // A capture that panicked leaves the backend unusable.
        drop(core.lock_backend()?);

        self.ensure_inited();
        core.start_recorder();
        core.buffer.clear();
        core.reconnecting.store(false, Ordering::SeqCst);

        {
            let _tasks = core.lock_tasks()?;
            if !core.stopped.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }
        StreamCore::launch_loop(core)?;
        log::info!("{}: started streaming {}", core.name, core.descriptor);
        Ok(())
    }

    /// Stop the worker, release the backend and drop buffered frames. Idempotent.
    pub fn stop(&self) {
        self.core.shutdown();
    }

    /// Tear down the current session and restart acquisition on a supervisor thread.
    pub fn reconnect(&self) -> Result<()> {
        if self.core.stopped.load(Ordering::SeqCst) {
            return Err(anyhow!("{} is stopped", self.core.name));
        }
        StreamCore::spawn_reconnect(&self.core)
    }

    /// Pop the oldest buffered frame, apply the resize hook and remember it.
    pub fn read(&self) -> Option<Frame> {
        let frame = self.core.buffer.pop_oldest()?;
        let resize = lock(&self.core.resize).clone();
        let frame = match resize {
            Some(resize) => resize(frame),
            None => frame,
        };
        *lock(&self.core.current_frame) = Some(frame.clone());
        Some(frame)
    }

    /// Last frame handed out by `read()`.
    pub fn current_frame(&self) -> Option<Frame> {
        lock(&self.core.current_frame).clone()
    }

    pub fn more(&self) -> bool {
        !self.core.buffer.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.core.buffer.len()
    }

    pub fn buffer_capacity(&self) -> BufferCapacity {
        self.core.buffer.capacity()
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.core.state)
    }

    pub fn is_stopped(&self) -> bool {
        self.core.stopped.load(Ordering::SeqCst)
    }

    pub fn is_inited(&self) -> bool {
        self.core.inited.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> VideoInfo {
        lock(&self.core.info).clone()
    }

    pub fn frames_captured(&self) -> u64 {
        self.core.frames_captured.load(Ordering::SeqCst)
    }

    /// Reconnect cycles run since the worker was built.
    pub fn reconnect_count(&self) -> u64 {
        self.core.reconnects.load(Ordering::SeqCst)
    }
}

impl Drop for VideoStream {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

impl StreamCore {
    fn lock_backend(&self) -> Result<MutexGuard<'_, Box<dyn CaptureBackend>>> {
        self.backend
            .lock()
            .map_err(|_| anyhow!("{} backend lock poisoned", self.name))
    }

    fn lock_tasks(&self) -> Result<MutexGuard<'_, Tasks>> {
        self.tasks
            .lock()
            .map_err(|_| anyhow!("{} task lock poisoned", self.name))
    }

    fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
    }

    fn is_current(&self, generation: u64) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.generation.load(Ordering::SeqCst) == generation
    }

    /// Open the backend and derive the stream metadata from what it reports.
    fn init_source(&self) -> bool {
        let opened = self.lock_backend().and_then(|mut backend| {
            let source = backend.open()?;
            Ok((backend.name(), source))
        });
        let (backend_name, source) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                log::error!("{}: failed to open {}: {:#}", self.name, self.descriptor, err);
                return false;
            }
        };

        let fps = match self.config.manual_fps {
            Some(fps) => fps,
            None if source.fps > 0.0 => source.fps,
            None if source.is_ready() => {
                log::warn!(
                    "{}: source reports 0 fps, using {}",
                    self.name,
                    FALLBACK_FPS
                );
                FALLBACK_FPS
            }
            None => 0.0,
        };

        let (width, height) = match &self.config.frame_crop {
            Some(crop) if source.is_ready() => {
                if !crop.fits_within(source.width, source.height) {
                    log::error!(
                        "{}: crop {:?} does not fit {}x{} frames",
                        self.name,
                        crop,
                        source.width,
                        source.height
                    );
                    return false;
                }
                (crop.width(), crop.height())
            }
            _ => (source.width, source.height),
        };

        let inited = source.is_ready();
        *lock(&self.info) = VideoInfo {
            video_feed_name: self.name.clone(),
            height,
            width,
            manual_fps_inputted: self.config.manual_fps.is_some(),
            fps,
            inited,
        };
        self.inited.store(inited, Ordering::SeqCst);
        if inited {
            log::info!(
                "{}: initialised {} via {} backend ({}x{} at {:.1} fps)",
                self.name,
                self.descriptor,
                backend_name,
                width,
                height,
                fps
            );
        }
        inited
    }

    /// Attach a recorder once the source is initialised, unless the backend archives itself.
    fn start_recorder(&self) {
        let Some(dir) = &self.config.recording_dir else {
            return;
        };
        if !self.inited.load(Ordering::SeqCst) {
            return;
        }
        let archives = self
            .lock_backend()
            .map(|backend| backend.archives_source())
            .unwrap_or(false);
        let mut recorder = lock(&self.recorder);
        if archives || recorder.is_some() {
            return;
        }
        let info = lock(&self.info).clone();
        let request = RecordingRequest {
            dir: dir.clone(),
            feed_name: self.name.clone(),
            fps: info.fps,
            width: info.width,
            height: info.height,
        };
        let factory = lock(&self.recorder_factory).clone();
        match factory(&request) {
            Ok(sink) => {
                self.recorder_failed.store(false, Ordering::SeqCst);
                *recorder = Some(sink);
            }
            Err(err) => log::warn!("{}: recording disabled: {:#}", self.name, err),
        }
    }

    fn record(&self, frame: &Frame) {
        let mut recorder = lock(&self.recorder);
        if let Some(sink) = recorder.as_mut() {
            if let Err(err) = sink.write(frame) {
                if !self.recorder_failed.swap(true, Ordering::SeqCst) {
                    log::warn!("{}: recording write failed: {:#}", self.name, err);
                }
            }
        }
    }

    fn release_recorder(&self) {
        if let Some(mut sink) = lock(&self.recorder).take() {
            if let Err(err) = sink.release() {
                log::warn!("{}: recording release failed: {:#}", self.name, err);
            }
        }
    }

    fn capture(&self) -> Result<Frame> {
        let frame = self.lock_backend()?.capture_one()?;
        match &self.config.frame_crop {
            Some(crop) => frame.crop(crop),
            None => Ok(frame),
        }
    }

    fn frame_interval(&self) -> Duration {
        let fps = lock(&self.info).fps;
        let fps = if fps > 0.0 { fps } else { FALLBACK_FPS };
        Duration::from_secs_f64(1.0 / fps)
    }

    /// Sleep for `duration`, returning early once the worker is stopped.
    fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_POLL_SLICE));
        }
    }

    fn launch_loop(core: &Arc<Self>) -> Result<()> {
        let mut tasks = core.lock_tasks()?;
        if core.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let generation = core.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = Arc::clone(core);
        let handle = thread::Builder::new()
            .name(format!("acquire-{}", core.name))
            .spawn(move || worker.acquisition_loop(generation))
            .with_context(|| format!("spawn acquisition thread for {}", core.name))?;
        tasks.acquisition = Some(handle);
        core.set_state(StreamState::Streaming);
        Ok(())
    }

    fn acquisition_loop(self: Arc<Self>, generation: u64) {
        let threshold = self.config.reconnect_threshold;
        let mut countdown = Countdown::default();

        while self.is_current(generation) {
            if self.buffer.len() > self.config.producer_pause_threshold {
                thread::sleep(self.config.producer_pause_interval);
                continue;
            }

            let err = match self.capture() {
                Ok(frame) => {
                    countdown.reset();
                    self.set_state(StreamState::Streaming);
                    self.record(&frame);
                    self.buffer.push(frame);
                    self.frames_captured.fetch_add(1, Ordering::SeqCst);
                    if self.kind == BackendKind::Continuous {
                        self.sleep_unless_stopped(self.frame_interval());
                    }
                    continue;
                }
                Err(err) => err,
            };

            thread::sleep(self.config.failure_backoff);
            let tick = countdown.tick(Instant::now(), threshold);
            if tick.first {
                self.set_state(StreamState::CountingDown);
                log::warn!("{}: grab error: {:#}", self.name, err);
                log::info!(
                    "No frames for {}, starting {} sec countdown",
                    self.name,
                    threshold.as_secs_f64()
                );
            } else if tick.notify {
                log::debug!(
                    "{}: {:.0} sec left in countdown ({:#})",
                    self.name,
                    tick.remaining.as_secs_f64(),
                    err
                );
            }
            if !tick.expired {
                continue;
            }
            if !self.is_current(generation) {
                break;
            }

            if self.config.do_reconnect {
                self.set_state(StreamState::Reconnecting);
                if let Err(err) = Self::spawn_reconnect(&self) {
                    log::error!("{}: {:#}", self.name, err);
                }
                break;
            }
            if self.buffer.is_empty() {
                log::info!("{}: Not reconnecting. Stopping..", self.name);
                self.stop_from_loop();
                break;
            }
            log::debug!(
                "{}: countdown reached but still have {} unconsumed frames",
                self.name,
                self.buffer.len()
            );
            self.sleep_unless_stopped(self.config.drain_poll_interval);
        }
    }

    fn spawn_reconnect(core: &Arc<Self>) -> Result<()> {
        if core
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let spawned = core.lock_tasks().and_then(|mut tasks| {
            if core.stopped.load(Ordering::SeqCst) {
                return Ok(false);
            }
            // Retire the running loop before the supervisor touches the backend.
            core.generation.fetch_add(1, Ordering::SeqCst);
            let worker = Arc::clone(core);
            let handle = thread::Builder::new()
                .name(format!("reconnect-{}", core.name))
                .spawn(move || worker.supervise_reconnect())
                .with_context(|| format!("spawn reconnect thread for {}", core.name))?;
            tasks.reconnect = Some(handle);
            Ok(true)
        });
        if !matches!(spawned, Ok(true)) {
            core.reconnecting.store(false, Ordering::SeqCst);
        }
        spawned.map(|_| ())
    }

    fn supervise_reconnect(self: Arc<Self>) {
        let previous = lock(&self.tasks).acquisition.take();
        join_task(&self.name, previous);

        if self.stopped.load(Ordering::SeqCst) {
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        self.set_state(StreamState::Reconnecting);
        log::info!("{}: reconnecting to {}", self.name, self.descriptor);

        if let Ok(mut backend) = self.lock_backend() {
            backend.close();
        }
        self.buffer.clear();

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            match self.lock_backend().and_then(|mut backend| backend.reconnect()) {
                Ok(()) => break,
                Err(err) => {
                    log::warn!("{}: reconnect failed: {:#}", self.name, err);
                    self.sleep_unless_stopped(self.config.reconnect_retry_interval);
                }
            }
        }

        if !self.inited.load(Ordering::SeqCst) {
            self.init_source();
        }
        self.start_recorder();
        log::info!("{}: reinitialised", self.name);
        self.reconnecting.store(false, Ordering::SeqCst);
        if let Err(err) = Self::launch_loop(&self) {
            log::error!("{}: {:#}", self.name, err);
        }
    }

    fn shutdown(&self) {
        let (reconnect, acquisition) = {
            let mut tasks = lock(&self.tasks);
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            let current = thread::current().id();
            (
                take_unless_current(&mut tasks.reconnect, current),
                take_unless_current(&mut tasks.acquisition, current),
            )
        };
        join_task(&self.name, reconnect);
        join_task(&self.name, acquisition);
        self.release_session();
    }

    /// Self-stop from the acquisition thread. Never joins: a reconnect supervisor
    /// may be waiting on this very loop. `start` joins the leftover handles.
    fn stop_from_loop(&self) {
        {
            let _tasks = lock(&self.tasks);
            if self.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.release_session();
    }

    fn release_session(&self) {
        if let Ok(mut backend) = self.lock_backend() {
            backend.close();
        }
        self.buffer.clear();
        self.release_recorder();
        self.reconnecting.store(false, Ordering::SeqCst);
        self.set_state(StreamState::Stopped);
        log::info!("{}: stopped", self.name);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn take_unless_current(
    slot: &mut Option<JoinHandle<()>>,
    current: ThreadId,
) -> Option<JoinHandle<()>> {
    match slot {
        Some(handle) if handle.thread().id() == current => None,
        _ => slot.take(),
    }
}

fn join_task(name: &str, handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::error!("{}: worker thread panicked", name);
        }
    }
}
