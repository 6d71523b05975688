// wastewatch-camera/src/lib.rs
// ============================================================
// Camera capture layer for WasteWatch
// Probes OpenCV videoio backends, owns the capture thread, and
// publishes the latest raw + detection-ready frame snapshots.
// ------------------------------------------------------------
// Public API:
//   * FrameSource::open()   – backend-probing device open
//   * CameraHandle::start() – spawn the capture loop
//   * CameraHandle::frame() – latest raw frame snapshot
// ============================================================

//! WasteWatch – camera capture layer
//!
//! This crate owns everything that touches a physical capture device.
//! [`FrameSource`] negotiates a backend and exposes a blocking
//! read/close contract; [`CameraHandle`] drives it from a dedicated
//! thread at a bounded rate and publishes the newest [`Frame`] (and a
//! down-sampled, contrast-normalized variant for inference) through
//! single-writer [`FrameSlot`]s.  Readers always get an immutable
//! snapshot; the writer replaces slot contents wholesale, never edits
//! in place.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use opencv::core::{self, Mat};
use opencv::imgcodecs;
use opencv::prelude::*;
use serde::Serialize;
use thiserror::Error;

mod capture;
mod source;

pub use capture::{CameraHandle, CaptureConfig, PROCESSED_HEIGHT, PROCESSED_WIDTH};
pub use source::{
    list_cameras, Backend, CameraDescription, FrameSource, SourceGeometry, VideoSource,
    DEFAULT_BACKENDS,
};

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no backend could open camera {0}")]
    DeviceUnavailable(CameraId),
    #[error("device disconnected or returned an empty frame")]
    DeviceDisconnected,
    #[error("capture loop did not exit within the join budget")]
    LoopTimeout,
    #[error("backend error: {0}")]
    Backend(#[from] opencv::Error),
}

pub type Result<T> = std::result::Result<T, CameraError>;

/// Identifies one physical/logical camera. Small integer index as the
/// OS enumerates devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CameraId(u32);

impl CameraId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(&self) -> i32 {
        self.0 as i32
    }
}

impl From<u32> for CameraId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An owned BGR pixel buffer captured from a device.
///
/// Raw frames and processed frames are both immutable once published;
/// a new capture replaces the slot contents rather than mutating them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Capture timestamp, milliseconds since the Unix epoch.
    pub captured_at: u64,
}

impl Frame {
    pub const CHANNELS: usize = 3;

    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            captured_at: now_ms(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }

    /// Copy this frame into an OpenCV `Mat` (rows × cols, CV_8UC3).
    pub fn to_mat(&self) -> Result<Mat> {
        let flat = Mat::from_slice(&self.data)?;
        let shaped = flat.reshape(Self::CHANNELS as i32, self.height as i32)?;
        Ok(shaped.try_clone()?)
    }

    /// Snapshot a continuous BGR `Mat` into an owned frame.
    pub fn from_mat(mat: &Mat) -> Result<Self> {
        let data = mat.data_bytes()?.to_vec();
        Ok(Self::new(data, mat.cols() as u32, mat.rows() as u32))
    }

    /// Encode as JPEG at the given quality (1–100).
    pub fn encode_jpeg(&self, quality: i32) -> Result<Vec<u8>> {
        let mat = self.to_mat()?;
        let mut buf = core::Vector::<u8>::new();
        let mut params = core::Vector::<i32>::new();
        params.push(imgcodecs::IMWRITE_JPEG_QUALITY);
        params.push(quality.clamp(1, 100));
        imgcodecs::imencode(".jpg", &mat, &mut buf, &params)?;
        Ok(buf.to_vec())
    }
}

/// Single-writer / multi-reader cell holding the latest frame.
///
/// The capture loop is the only writer; any number of readers take
/// `Arc` snapshots and are unaffected by subsequent writes.  Empty
/// before the first capture and after [`FrameSlot::clear`].
#[derive(Default)]
pub struct FrameSlot {
    inner: Mutex<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Arc<Frame>) {
        *lock(&self.inner) = Some(frame);
    }

    pub fn snapshot(&self) -> Option<Arc<Frame>> {
        lock(&self.inner).clone()
    }

    pub fn clear(&self) {
        *lock(&self.inner) = None;
    }
}

/// Lock a mutex, recovering the guard if a writer panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
