// wastewatch-detect/src/session.rs
// One camera ⇄ one model: the throttled detection loop and its
// state machine (Idle → Verifying → Active → Stopping → Idle).

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use wastewatch_camera::{now_ms, CameraHandle, CameraId, Frame};

use crate::{
    render_detections, validate, Confidence, DetectError, DetectionRing, Detector, OrtYolo,
    Result, Stats, StatsSnapshot,
};

/// Loop throttle, independent of the capture rate.
const LOOP_DELAY: Duration = Duration::from_millis(10);
/// Consecutive soft or hard failures tolerated before the loop gives up.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const SOFT_ERROR_BACKOFF: Duration = Duration::from_millis(500);
const HARD_ERROR_BACKOFF: Duration = Duration::from_secs(1);
/// Camera-readiness check at start: attempts and backoff between them.
const READY_ATTEMPTS: u32 = 3;
const READY_BACKOFF: Duration = Duration::from_millis(300);
/// Grace period for the loop thread to report in after spawn.
const START_GRACE: Duration = Duration::from_millis(500);
/// How long `stop()` waits for the loop thread before reporting
/// `LoopTimeout`.
const JOIN_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Verifying,
    Active,
    Stopping,
}

/// Ring, counters, and failure note share one lock so every reader
/// sees them move together.
struct SessionState {
    ring: DetectionRing,
    stats: Stats,
    phase: SessionPhase,
    last_error: Option<String>,
}

/// Binds one camera to one loaded model, a confidence threshold, a
/// detection ring, and counters.  At most one session per camera; the
/// registry enforces that.
pub struct DetectorSession {
    camera_id: CameraId,
    threshold: Confidence,
    model: Arc<Mutex<Box<dyn Detector>>>,
    camera: Arc<Mutex<Option<Arc<CameraHandle>>>>,
    state: Arc<Mutex<SessionState>>,
    active: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DetectorSession {
    pub fn new(camera_id: CameraId, model: Box<dyn Detector>, threshold: Confidence) -> Self {
        Self {
            camera_id,
            threshold,
            model: Arc::new(Mutex::new(model)),
            camera: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(SessionState {
                ring: DetectionRing::new(),
                stats: Stats::default(),
                phase: SessionPhase::Idle,
                last_error: None,
            })),
            active: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Load the ONNX model at `model_path` and wrap it in a session.
    /// Model problems are fatal here, before any thread exists.
    pub fn with_model(
        camera_id: CameraId,
        model_path: impl AsRef<Path>,
        threshold: Confidence,
    ) -> Result<Self> {
        let model = OrtYolo::load(model_path)?;
        Ok(Self::new(camera_id, Box::new(model), threshold))
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> SessionPhase {
        lock(&self.state).phase
    }

    /// Failure note from a loop that terminated itself, if any.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).last_error.clone()
    }

    /// Verify the camera is producing and the model answers, then start
    /// the detection loop.  Starting an already-active session is a
    /// no-op success.  On any failure the camera is left untouched and
    /// the session returns to `Idle` so the caller may retry.
    pub fn start(&self, camera: Arc<CameraHandle>) -> Result<()> {
        if self.is_active() {
            info!("detector for camera {} already active", self.camera_id);
            return Ok(());
        }
        // Reap a loop that terminated itself earlier.
        if let Some(stale) = lock(&self.worker).take() {
            let _ = bounded_join(stale, JOIN_BUDGET);
        }
        lock(&self.state).phase = SessionPhase::Verifying;

        let test_frame = match self.await_frame(&camera) {
            Ok(frame) => frame,
            Err(err) => {
                lock(&self.state).phase = SessionPhase::Idle;
                return Err(err);
            }
        };

        // One synchronous inference to prove the model produces usable
        // output before committing to a background loop.
        if let Err(err) = lock(&self.model).detect(&test_frame) {
            lock(&self.state).phase = SessionPhase::Idle;
            return Err(DetectError::SmokeTest(err.to_string()));
        }
        debug!("camera {}: smoke inference passed", self.camera_id);

        {
            let mut state = lock(&self.state);
            state.ring.clear();
            state.stats.reset();
            state.last_error = None;
        }
        *lock(&self.camera) = Some(camera);
        self.active.store(true, Ordering::Release);

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<()>(1);
        let spawned = thread::Builder::new()
            .name(format!("detect-{}", self.camera_id))
            .spawn({
                let camera_id = self.camera_id;
                let model = self.model.clone();
                let camera = self.camera.clone();
                let state = self.state.clone();
                let active = self.active.clone();
                let threshold = self.threshold;
                move || detection_loop(camera_id, model, camera, state, active, threshold, ready_tx)
            });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                error!("camera {}: failed to spawn detection loop: {err}", self.camera_id);
                self.abort_start();
                return Err(DetectError::LoopTimeout);
            }
        };

        match ready_rx.recv_timeout(START_GRACE) {
            Ok(()) => {
                *lock(&self.worker) = Some(worker);
                lock(&self.state).phase = SessionPhase::Active;
                info!(
                    "detection started for camera {} (threshold {:.2})",
                    self.camera_id,
                    self.threshold.value()
                );
                Ok(())
            }
            Err(_) => {
                error!(
                    "camera {}: detection loop not alive after {START_GRACE:?}",
                    self.camera_id
                );
                self.abort_start();
                let _ = bounded_join(worker, JOIN_BUDGET);
                Err(DetectError::LoopTimeout)
            }
        }
    }

    /// Stop from any state.  Releases the camera reference first so the
    /// loop notices on its own, then joins it with a bounded wait.  A
    /// hit timeout is reported, never masked or escalated to a forced
    /// kill.
    pub fn stop(&self) -> Result<()> {
        lock(&self.state).phase = SessionPhase::Stopping;
        *lock(&self.camera) = None;
        self.active.store(false, Ordering::Release);

        let worker = lock(&self.worker).take();
        let joined = match worker {
            Some(handle) => bounded_join(handle, JOIN_BUDGET),
            None => Ok(()),
        };
        lock(&self.state).phase = SessionPhase::Idle;
        if joined.is_ok() {
            info!("detector for camera {} stopped", self.camera_id);
        }
        joined
    }

    /// Counters and ring contents under the same lock the loop writes
    /// with, so a caller never sees a count without its ring entry.
    pub fn stats(&self) -> StatsSnapshot {
        let state = lock(&self.state);
        StatsSnapshot {
            active: self.is_active(),
            total: state.stats.total,
            organic: state.stats.organic,
            inorganic: state.stats.inorganic,
            recent: state.ring.to_vec(),
        }
    }

    /// Annotated copy of `frame` from the current ring + counters.
    pub fn render(&self, frame: &Frame) -> Result<Frame> {
        let (detections, stats) = {
            let state = lock(&self.state);
            (state.ring.to_vec(), state.stats)
        };
        render_detections(frame, &detections, &stats)
    }

    fn abort_start(&self) {
        self.active.store(false, Ordering::Release);
        *lock(&self.camera) = None;
        lock(&self.state).phase = SessionPhase::Idle;
    }

    /// Bounded wait for the camera to produce a usable frame.
    fn await_frame(&self, camera: &CameraHandle) -> Result<Arc<Frame>> {
        for attempt in 1..=READY_ATTEMPTS {
            if let Some(frame) = camera.processed_frame().or_else(|| camera.frame()) {
                if !frame.is_empty() {
                    return Ok(frame);
                }
            }
            if attempt < READY_ATTEMPTS {
                warn!(
                    "camera {} not ready, retrying ({attempt}/{READY_ATTEMPTS})",
                    self.camera_id
                );
                thread::sleep(READY_BACKOFF);
            }
        }
        Err(DetectError::CameraNotReady(self.camera_id))
    }
}

fn detection_loop(
    camera_id: CameraId,
    model: Arc<Mutex<Box<dyn Detector>>>,
    camera: Arc<Mutex<Option<Arc<CameraHandle>>>>,
    state: Arc<Mutex<SessionState>>,
    active: Arc<AtomicBool>,
    threshold: Confidence,
    ready_tx: crossbeam_channel::Sender<()>,
) {
    let _ = ready_tx.send(());
    debug!("camera {camera_id}: detection loop running");

    let mut soft_errors: u32 = 0;
    let mut hard_errors: u32 = 0;
    let mut window_frames: u64 = 0;
    let mut window_start = Instant::now();

    while active.load(Ordering::Acquire) {
        thread::sleep(LOOP_DELAY);

        let Some(cam) = lock(&camera).clone() else {
            debug!("camera {camera_id}: reference released, detection loop exiting");
            break;
        };

        let Some(frame) = cam.processed_frame() else {
            soft_errors += 1;
            warn!("camera {camera_id}: no processed frame ({soft_errors}/{MAX_CONSECUTIVE_ERRORS})");
            if soft_errors >= MAX_CONSECUTIVE_ERRORS {
                give_up(&state, &active, "camera stopped producing frames");
                break;
            }
            thread::sleep(SOFT_ERROR_BACKOFF);
            continue;
        };

        match run_iteration(&model, &state, &frame, threshold) {
            Ok(accepted) => {
                soft_errors = 0;
                hard_errors = 0;
                window_frames += 1;
                if accepted > 0 {
                    debug!("camera {camera_id}: {accepted} detections this frame");
                }
                let elapsed = window_start.elapsed();
                if elapsed >= Duration::from_secs(10) {
                    info!(
                        "camera {camera_id}: detector at {:.2} fps ({window_frames} frames)",
                        window_frames as f64 / elapsed.as_secs_f64()
                    );
                    window_frames = 0;
                    window_start = Instant::now();
                }
            }
            Err(err) => {
                hard_errors += 1;
                error!(
                    "camera {camera_id}: detection iteration failed ({hard_errors}/{MAX_CONSECUTIVE_ERRORS}): {err}"
                );
                if hard_errors >= MAX_CONSECUTIVE_ERRORS {
                    give_up(&state, &active, "too many consecutive inference failures");
                    break;
                }
                thread::sleep(HARD_ERROR_BACKOFF);
            }
        }
    }

    lock(&state).phase = SessionPhase::Idle;
    debug!("camera {camera_id}: detection loop exited");
}

/// One inference pass: run the model, validate every candidate, and
/// apply ring + counter updates under a single lock acquisition.
fn run_iteration(
    model: &Mutex<Box<dyn Detector>>,
    state: &Mutex<SessionState>,
    frame: &Frame,
    threshold: Confidence,
) -> Result<usize> {
    let raw = lock(model).detect(frame)?;
    let now = now_ms();
    let mut accepted = 0;
    let mut guard = lock(state);
    for candidate in &raw {
        if let Some(detection) = validate(candidate, threshold, frame.width, frame.height, now) {
            guard.stats.record(detection.category);
            guard.ring.push(detection);
            accepted += 1;
        }
    }
    Ok(accepted)
}

fn give_up(state: &Mutex<SessionState>, active: &AtomicBool, reason: &str) {
    error!("detection loop terminating: {reason}");
    lock(state).last_error = Some(reason.to_string());
    active.store(false, Ordering::Release);
}

fn bounded_join(handle: JoinHandle<()>, budget: Duration) -> Result<()> {
    let deadline = Instant::now() + budget;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(DetectError::LoopTimeout);
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
    Ok(())
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
