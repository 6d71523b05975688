// wastewatch-registry/src/lib.rs
// ============================================================
// Process-wide camera + detector-session registry for WasteWatch
// The single source of truth for "is camera X active" and "is a
// detector bound to camera X"; every start/stop goes through here
// so the two facts cannot drift apart.
// ============================================================

//! WasteWatch – registry layer
//!
//! [`CameraRegistry`] owns the maps from [`CameraId`] to running
//! [`CameraHandle`]s and bound [`DetectorSession`]s.  It is meant to be
//! constructed once and injected into whatever serves HTTP, with no
//! ambient globals.  Start/stop operations are idempotent; stats
//! queries never fail (an unbound camera yields an `active: false`
//! snapshot).  Unrelated cameras never share a lock on the data path:
//! the registry lock guards only the maps, each handle and session
//! owns its own synchronization.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use thiserror::Error;

use wastewatch_camera::{
    CameraError, CameraHandle, CameraId, CaptureConfig, Frame, FrameSource, SourceGeometry,
    VideoSource, DEFAULT_BACKENDS,
};
use wastewatch_detect::{Confidence, DetectError, DetectorSession, StatsSnapshot};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("camera {0} is not active")]
    NotActive(CameraId),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Detector(#[from] DetectError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Result of a frame fetch through the registry.
pub enum FrameFetch {
    /// Latest raw frame snapshot.
    Frame(Arc<Frame>),
    /// Latest raw frame, JPEG-encoded.
    Encoded(Vec<u8>),
    /// Camera registered but nothing captured yet; momentary, poll again.
    NotReady,
    /// Camera not registered.
    NotActive,
}

/// Opens and configures a device for `start_camera`; swapped out in
/// tests for synthetic sources.
type SourceOpener =
    dyn Fn(CameraId, &CaptureConfig) -> wastewatch_camera::Result<Box<dyn VideoSource>>
        + Send
        + Sync;

/// Builds a detector session for `start_detection`; swapped out in
/// tests for mock models.
type SessionFactory =
    dyn Fn(CameraId, &Path, Confidence) -> wastewatch_detect::Result<DetectorSession>
        + Send
        + Sync;

#[derive(Default)]
struct Entries {
    cameras: HashMap<CameraId, Arc<CameraHandle>>,
    detectors: HashMap<CameraId, Arc<DetectorSession>>,
}

pub struct CameraRegistry {
    entries: Mutex<Entries>,
    opener: Box<SourceOpener>,
    factory: Box<SessionFactory>,
}

impl Default for CameraRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraRegistry {
    /// Registry over real hardware: OpenCV backend probing and ONNX
    /// model loading.
    pub fn new() -> Self {
        Self::with_hooks(
            |id, config| {
                let mut source = FrameSource::open(id, DEFAULT_BACKENDS)?;
                source.configure(config)?;
                Ok(Box::new(source) as Box<dyn VideoSource>)
            },
            |id, model_path, threshold| DetectorSession::with_model(id, model_path, threshold),
        )
    }

    /// Registry with injected device/model constructors: the test
    /// seam, also handy for replaying recorded footage.
    pub fn with_hooks<O, F>(opener: O, factory: F) -> Self
    where
        O: Fn(CameraId, &CaptureConfig) -> wastewatch_camera::Result<Box<dyn VideoSource>>
            + Send
            + Sync
            + 'static,
        F: Fn(CameraId, &Path, Confidence) -> wastewatch_detect::Result<DetectorSession>
            + Send
            + Sync
            + 'static,
    {
        Self {
            entries: Mutex::new(Entries::default()),
            opener: Box::new(opener),
            factory: Box::new(factory),
        }
    }

    /// Open, configure, and start capturing from a camera.  Starting an
    /// already-active camera is a no-op success reporting the existing
    /// negotiated geometry.
    pub fn start_camera(&self, id: CameraId, config: CaptureConfig) -> Result<SourceGeometry> {
        let mut entries = lock(&self.entries);
        if let Some(existing) = entries.cameras.get(&id) {
            info!("camera {id} already active");
            return Ok(existing.geometry());
        }
        let source = (self.opener)(id, &config)?;
        let handle = CameraHandle::start(id, source, config)?;
        let geometry = handle.geometry();
        entries.cameras.insert(id, handle);
        info!(
            "camera {id} started at {}x{} @ {:.0}fps",
            geometry.width, geometry.height, geometry.fps
        );
        Ok(geometry)
    }

    /// Stop a camera and anything bound to it.  Stopping an inactive
    /// camera succeeds.
    pub fn stop_camera(&self, id: CameraId) -> Result<()> {
        let (camera, detector) = {
            let mut entries = lock(&self.entries);
            (entries.cameras.remove(&id), entries.detectors.remove(&id))
        };
        // The bound session goes first so it releases its camera
        // reference before the device winds down.
        if let Some(session) = detector {
            if let Err(err) = session.stop() {
                warn!("camera {id}: bound detector did not stop cleanly: {err}");
            }
        }
        match camera {
            Some(handle) => {
                handle.stop()?;
                info!("camera {id} stopped");
                Ok(())
            }
            None => {
                info!("camera {id} already stopped");
                Ok(())
            }
        }
    }

    pub fn is_active(&self, id: CameraId) -> bool {
        lock(&self.entries).cameras.contains_key(&id)
    }

    /// Handle for direct slot reads (stream viewers use this).
    pub fn camera(&self, id: CameraId) -> Option<Arc<CameraHandle>> {
        lock(&self.entries).cameras.get(&id).cloned()
    }

    /// Bound detector session, if any.
    pub fn session(&self, id: CameraId) -> Option<Arc<DetectorSession>> {
        lock(&self.entries).detectors.get(&id).cloned()
    }

    /// Latest frame from a camera, raw or JPEG-encoded.
    pub fn get_frame(&self, id: CameraId, encoded: bool, jpeg_quality: i32) -> FrameFetch {
        let Some(handle) = self.camera(id) else {
            return FrameFetch::NotActive;
        };
        let Some(frame) = handle.frame() else {
            return FrameFetch::NotReady;
        };
        if !encoded {
            return FrameFetch::Frame(frame);
        }
        match frame.encode_jpeg(jpeg_quality) {
            Ok(bytes) => FrameFetch::Encoded(bytes),
            Err(err) => {
                warn!("camera {id}: JPEG encode failed: {err}");
                FrameFetch::NotReady
            }
        }
    }

    /// Bind a detector session to an active camera.  The camera must
    /// already be registered; detection never implicitly starts a
    /// camera.  An existing session for the camera is stopped first.
    pub fn start_detection(
        &self,
        id: CameraId,
        confidence: f32,
        model_path: impl AsRef<Path>,
    ) -> Result<()> {
        let threshold = Confidence::new(confidence).map_err(RegistryError::Detector)?;
        let camera = self.camera(id).ok_or(RegistryError::NotActive(id))?;

        if let Some(previous) = {
            let mut entries = lock(&self.entries);
            entries.detectors.remove(&id)
        } {
            info!("camera {id}: replacing existing detector session");
            if let Err(err) = previous.stop() {
                warn!("camera {id}: previous session did not stop cleanly: {err}");
            }
        }

        let session = (self.factory)(id, model_path.as_ref(), threshold)?;
        session.start(camera)?;
        lock(&self.entries).detectors.insert(id, Arc::new(session));
        Ok(())
    }

    /// Stop the detector bound to a camera, if any.  Idempotent.
    pub fn stop_detection(&self, id: CameraId) -> Result<()> {
        let session = lock(&self.entries).detectors.remove(&id);
        match session {
            Some(session) => {
                session.stop()?;
                Ok(())
            }
            None => {
                info!("camera {id}: detection already stopped");
                Ok(())
            }
        }
    }

    /// Detection statistics for a camera.  Never fails: an unbound or
    /// unknown camera yields a well-formed `active: false` snapshot.
    pub fn detection_stats(&self, id: CameraId) -> StatsSnapshot {
        match self.session(id) {
            Some(session) => session.stats(),
            None => StatsSnapshot::inactive(),
        }
    }

    /// Ids of currently active cameras, for shutdown sweeps.
    pub fn active_cameras(&self) -> Vec<CameraId> {
        lock(&self.entries).cameras.keys().copied().collect()
    }

    /// Stop everything; used on process shutdown.
    pub fn shutdown(&self) {
        for id in self.active_cameras() {
            if let Err(err) = self.stop_camera(id) {
                warn!("camera {id}: shutdown stop failed: {err}");
            }
        }
    }
}

/// Model path plus the default confidence used when a start request
/// does not carry one.  Mirrors the original deployment defaults.
#[derive(Debug, Clone)]
pub struct DetectionDefaults {
    pub model_path: PathBuf,
    pub confidence: f32,
}

impl Default for DetectionDefaults {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/waste_detector.onnx"),
            confidence: 0.3,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
