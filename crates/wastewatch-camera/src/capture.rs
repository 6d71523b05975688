// wastewatch-camera/src/capture.rs
// Tick-paced capture loop publishing raw + processed frame slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use opencv::core::{self, Mat, Size};
use opencv::imgproc;

use crate::{lock, CameraError, CameraId, Frame, FrameSlot, Result, SourceGeometry, VideoSource};

/// Fixed working resolution frames are down-sampled to before they
/// reach the detector.
pub const PROCESSED_WIDTH: i32 = 640;
pub const PROCESSED_HEIGHT: i32 = 480;

/// How long `stop()` waits for the loop thread before reporting
/// `LoopTimeout` instead of hanging.
const JOIN_BUDGET: Duration = Duration::from_secs(5);

/// The loop observes cancellation at least this often, even while
/// waiting out a long tick.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Requested capture parameters.  What the device actually honours is
/// reported through [`SourceGeometry`].
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_depth: u32,
    /// Compute the processed variant every Nth successful frame.
    pub frame_skip: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
            buffer_depth: 1,
            frame_skip: 2,
        }
    }
}

/// One running camera: the capture thread plus its published slots.
///
/// The device handle is owned by the loop thread and released there
/// when the loop exits; `stop()` blocks on the join, so no caller can
/// race a read against the release.
pub struct CameraHandle {
    id: CameraId,
    geometry: SourceGeometry,
    raw: Arc<FrameSlot>,
    processed: Arc<FrameSlot>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraHandle {
    /// Spawn the capture loop over an already-opened, already-configured
    /// source.  Open/configure failures belong to the caller so that a
    /// failed start leaves nothing running.
    pub fn start(
        id: CameraId,
        source: Box<dyn VideoSource>,
        config: CaptureConfig,
    ) -> Result<Arc<Self>> {
        let geometry = source.geometry();
        let raw = Arc::new(FrameSlot::new());
        let processed = Arc::new(FrameSlot::new());
        let running = Arc::new(AtomicBool::new(true));

        let worker = thread::Builder::new()
            .name(format!("capture-{id}"))
            .spawn({
                let raw = raw.clone();
                let processed = processed.clone();
                let running = running.clone();
                move || capture_loop(id, source, config, raw, processed, running)
            })
            .map_err(|err| {
                CameraError::Backend(opencv::Error::new(
                    core::StsError,
                    format!("failed to spawn capture thread: {err}"),
                ))
            })?;

        Ok(Arc::new(Self {
            id,
            geometry,
            raw,
            processed,
            running,
            worker: Mutex::new(Some(worker)),
        }))
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    /// Geometry the device negotiated at start.
    pub fn geometry(&self) -> SourceGeometry {
        self.geometry
    }

    /// Latest raw frame, if one has been captured.
    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.raw.snapshot()
    }

    /// Latest detection-ready frame (resized + contrast-normalized).
    pub fn processed_frame(&self) -> Option<Arc<Frame>> {
        self.processed.snapshot()
    }

    /// Latest raw frame encoded as JPEG.
    pub fn jpeg(&self, quality: i32) -> Option<Vec<u8>> {
        let frame = self.frame()?;
        match frame.encode_jpeg(quality) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!("camera {}: JPEG encode failed: {err}", self.id);
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Cooperative stop: flag the loop, then block until the thread has
    /// fully exited (and with it, released the device).  Idempotent.
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let worker = lock(&self.worker).take();
        if let Some(handle) = worker {
            bounded_join(handle, JOIN_BUDGET)?;
        }
        Ok(())
    }
}

/// Wait for a thread with a deadline; a hit deadline is an error the
/// caller sees, never a silent hang.
pub(crate) fn bounded_join(handle: JoinHandle<()>, budget: Duration) -> Result<()> {
    let deadline = Instant::now() + budget;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(CameraError::LoopTimeout);
        }
        thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
    Ok(())
}

fn capture_loop(
    id: CameraId,
    mut source: Box<dyn VideoSource>,
    config: CaptureConfig,
    raw: Arc<FrameSlot>,
    processed: Arc<FrameSlot>,
    running: Arc<AtomicBool>,
) {
    let tick = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
    let frame_skip = config.frame_skip.max(1) as u64;
    let mut next_tick = Instant::now();
    let mut captured: u64 = 0;
    let mut window_frames: u32 = 0;
    let mut window_start = Instant::now();

    debug!("camera {id}: capture loop running (tick {tick:?}, frame_skip {frame_skip})");

    while running.load(Ordering::Acquire) {
        if !sleep_until(next_tick, &running) {
            break;
        }
        next_tick += tick;
        // A slow read can push us past several tick boundaries; don't
        // try to catch up with a burst.
        if next_tick < Instant::now() {
            next_tick = Instant::now() + tick;
        }

        match source.read() {
            Ok(frame) => {
                captured += 1;
                window_frames += 1;
                let frame = Arc::new(frame);
                if captured % frame_skip == 0 {
                    match preprocess(&frame) {
                        Ok(prepped) => processed.store(Arc::new(prepped)),
                        Err(err) => warn!("camera {id}: preprocess failed: {err}"),
                    }
                }
                raw.store(frame);
            }
            Err(err) => {
                // Transient: log and keep going.  Only cancellation
                // stops this loop.
                warn!("camera {id}: frame read failed: {err}");
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            debug!(
                "camera {id}: capture {:.1} fps, processed {:.1} fps",
                window_frames as f64 / elapsed.as_secs_f64(),
                window_frames as f64 / elapsed.as_secs_f64() / frame_skip as f64,
            );
            window_frames = 0;
            window_start = Instant::now();
        }
    }

    source.close();
    raw.clear();
    processed.clear();
    debug!("camera {id}: capture loop exited after {captured} frames");
}

/// Sleep until `deadline`, waking often enough to observe cancellation.
/// Returns false if cancelled while waiting.
fn sleep_until(deadline: Instant, running: &AtomicBool) -> bool {
    loop {
        if !running.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

/// Down-sample to the working resolution and stretch contrast, keeping
/// the capture timestamp of the source frame.
fn preprocess(frame: &Frame) -> Result<Frame> {
    let mat = frame.to_mat()?;
    let mut resized = Mat::default();
    imgproc::resize(
        &mat,
        &mut resized,
        Size::new(PROCESSED_WIDTH, PROCESSED_HEIGHT),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    let mut normalized = Mat::default();
    core::normalize(
        &resized,
        &mut normalized,
        0.0,
        255.0,
        core::NORM_MINMAX,
        -1,
        &core::no_array(),
    )?;
    let mut prepped = Frame::from_mat(&normalized)?;
    prepped.captured_at = frame.captured_at;
    Ok(prepped)
}
