// wastewatch-camera/src/source.rs
// Backend-probing device open + the read/close contract.

use log::{info, warn};
use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio;
use serde::Serialize;

use crate::{CameraError, CameraId, CaptureConfig, Frame, Result};

/// One OpenCV capture backend, in probe order.
#[derive(Debug, Clone, Copy)]
pub struct Backend {
    pub api: i32,
    pub name: &'static str,
}

/// Default probe order. `CAP_ANY` lets OpenCV pick; the explicit
/// entries cover the Linux capture stacks we deploy on.
pub const DEFAULT_BACKENDS: &[Backend] = &[
    Backend {
        api: videoio::CAP_ANY,
        name: "Any",
    },
    Backend {
        api: videoio::CAP_V4L2,
        name: "V4L2",
    },
    Backend {
        api: videoio::CAP_GSTREAMER,
        name: "GStreamer",
    },
];

/// Resolution/FPS the device actually negotiated.  Hardware may
/// silently ignore requested values, so callers must consult this,
/// never the requested configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceGeometry {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Probe result for one device, shaped for the camera-list endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CameraDescription {
    pub id: CameraId,
    pub name: String,
    pub resolution: String,
    pub fps: f64,
    pub backend: &'static str,
}

/// The seam between a physical device and the capture loop.  The
/// OpenCV implementation is [`FrameSource`]; tests drive the loop
/// with synthetic sources.
pub trait VideoSource: Send {
    /// Blocking read of the next frame. `DeviceDisconnected` when the
    /// device stops producing.
    fn read(&mut self) -> Result<Frame>;

    /// Actual negotiated geometry.
    fn geometry(&self) -> SourceGeometry;

    /// Idempotent release; safe to call repeatedly.
    fn close(&mut self);
}

/// Owns one `VideoCapture` handle.  Construction probes the backend
/// list in order; a backend is accepted only if the device reports
/// opened *and* a first test read yields a non-empty frame.
pub struct FrameSource {
    cap: Option<videoio::VideoCapture>,
    id: CameraId,
    backend: &'static str,
    actual: SourceGeometry,
}

impl FrameSource {
    pub fn open(id: CameraId, backends: &[Backend]) -> Result<Self> {
        for backend in backends {
            let mut cap = match videoio::VideoCapture::new(id.index(), backend.api) {
                Ok(cap) => cap,
                Err(err) => {
                    warn!("camera {id}: {} failed to construct: {err}", backend.name);
                    continue;
                }
            };
            if !cap.is_opened().unwrap_or(false) {
                continue;
            }
            // Opened is not enough: require one good read before accepting.
            let mut probe = Mat::default();
            match cap.read(&mut probe) {
                Ok(true) if !probe.empty() => {}
                _ => {
                    warn!("camera {id}: {} opened but produced no frame", backend.name);
                    let _ = cap.release();
                    continue;
                }
            }
            let mut source = Self {
                cap: Some(cap),
                id,
                backend: backend.name,
                actual: SourceGeometry {
                    width: 0,
                    height: 0,
                    fps: 0.0,
                },
            };
            source.refresh_geometry();
            info!(
                "camera {id}: opened via {} at {}x{} @ {:.0}fps",
                backend.name, source.actual.width, source.actual.height, source.actual.fps
            );
            return Ok(source);
        }
        Err(CameraError::DeviceUnavailable(id))
    }

    /// Best-effort configuration: the hardware may ignore any of these,
    /// so the negotiated geometry is re-read afterwards.
    pub fn configure(&mut self, config: &CaptureConfig) -> Result<()> {
        if let Some(cap) = self.cap.as_mut() {
            let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, config.buffer_depth as f64);
            let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64);
            let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64);
            let _ = cap.set(videoio::CAP_PROP_FPS, config.fps as f64);
            if let Ok(fourcc) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
                let _ = cap.set(videoio::CAP_PROP_FOURCC, fourcc as f64);
            }
        }
        self.refresh_geometry();
        info!(
            "camera {}: requested {}x{} @ {}fps, negotiated {}x{} @ {:.0}fps",
            self.id,
            config.width,
            config.height,
            config.fps,
            self.actual.width,
            self.actual.height,
            self.actual.fps
        );
        Ok(())
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Open a candidate device just long enough to describe it.
    pub fn probe(id: CameraId, backends: &[Backend]) -> Option<CameraDescription> {
        let mut source = Self::open(id, backends).ok()?;
        let geometry = source.geometry();
        let description = CameraDescription {
            id,
            name: if id.index() == 0 {
                "Integrated camera".to_string()
            } else {
                format!("USB camera {id}")
            },
            resolution: format!("{}x{}", geometry.width, geometry.height),
            fps: geometry.fps,
            backend: source.backend,
        };
        source.close();
        Some(description)
    }

    fn refresh_geometry(&mut self) {
        if let Some(cap) = self.cap.as_ref() {
            self.actual = SourceGeometry {
                width: cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as u32,
                height: cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as u32,
                fps: cap.get(videoio::CAP_PROP_FPS).unwrap_or(0.0),
            };
        }
    }
}

impl VideoSource for FrameSource {
    fn read(&mut self) -> Result<Frame> {
        let cap = self.cap.as_mut().ok_or(CameraError::DeviceDisconnected)?;
        let mut mat = Mat::default();
        match cap.read(&mut mat) {
            Ok(true) if !mat.empty() => Frame::from_mat(&mat),
            Ok(_) => Err(CameraError::DeviceDisconnected),
            Err(err) => {
                warn!("camera {}: read failed: {err}", self.id);
                Err(CameraError::DeviceDisconnected)
            }
        }
    }

    fn geometry(&self) -> SourceGeometry {
        self.actual
    }

    fn close(&mut self) {
        if let Some(mut cap) = self.cap.take() {
            let _ = cap.release();
            info!("camera {}: device released", self.id);
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sweep device indices `0..max` against the backend list, reporting
/// every camera that opens and reads.
pub fn list_cameras(max: u32, backends: &[Backend]) -> Vec<CameraDescription> {
    (0..max)
        .filter_map(|id| FrameSource::probe(CameraId::new(id), backends))
        .collect()
}
