// wastewatch-stream/src/lib.rs
// Per-viewer MJPEG streams: a producer thread per connection feeding a
// bounded channel, so a slow viewer only ever backpressures itself.

//! WasteWatch – streaming layer
//!
//! [`open_stream`] turns a registered camera into a lazy, unbounded
//! sequence of multipart JPEG payloads.  Every call starts its own
//! independent sequence from "now"; simultaneous viewers of one camera
//! are all independent slot readers and never disturb the capture or
//! detection loops.  A momentarily-empty camera is waited out; a
//! camera that leaves the registry ends the stream.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures_core::Stream;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use wastewatch_camera::CameraId;
use wastewatch_registry::CameraRegistry;

/// Content type the multipart payloads are served under.
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

// back-pressure: producer thread → channel → viewer
const DEPTH: usize = 4;

/// Wait between polls while the camera has no frame yet.
const EMPTY_POLL: Duration = Duration::from_millis(100);

/// Pacing between payloads; re-encoding the same slot faster than the
/// capture rate only burns CPU.
const FRAME_PACE: Duration = Duration::from_millis(33);

/// One viewer's infinite MJPEG sequence for `camera_id`.
///
/// With `annotate` set, frames pass through the bound detector
/// session's overlay; if no session is bound (or it goes away), the
/// stream ends, matching the plain stream's camera-gone behaviour.
pub fn open_stream(
    registry: Arc<CameraRegistry>,
    camera_id: CameraId,
    annotate: bool,
    jpeg_quality: i32,
) -> impl Stream<Item = Vec<u8>> {
    let (tx, rx) = mpsc::channel(DEPTH);

    thread::spawn(move || {
        stream_worker(registry, camera_id, annotate, jpeg_quality, tx);
    });

    ReceiverStream::new(rx)
}

/// Frame one JPEG as a multipart chunk.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::with_capacity(jpeg.len() + 64);
    chunk.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n\r\n");
    chunk
}

fn stream_worker(
    registry: Arc<CameraRegistry>,
    camera_id: CameraId,
    annotate: bool,
    jpeg_quality: i32,
    tx: mpsc::Sender<Vec<u8>>,
) {
    info!("stream for camera {camera_id} opened (annotate: {annotate})");
    loop {
        // Re-check registration every pass: a camera stopped mid-stream
        // terminates the viewer's sequence instead of stalling it.
        let Some(camera) = registry.camera(camera_id) else {
            info!("camera {camera_id} no longer registered, ending stream");
            break;
        };

        let Some(frame) = camera.frame() else {
            thread::sleep(EMPTY_POLL);
            continue;
        };

        let payload = if annotate {
            let Some(session) = registry.session(camera_id) else {
                info!("camera {camera_id} has no detector bound, ending annotated stream");
                break;
            };
            match session.render(&frame) {
                Ok(rendered) => rendered.encode_jpeg(jpeg_quality),
                Err(err) => {
                    warn!("camera {camera_id}: overlay failed: {err}");
                    frame.encode_jpeg(jpeg_quality)
                }
            }
        } else {
            frame.encode_jpeg(jpeg_quality)
        };

        let jpeg = match payload {
            Ok(jpeg) => jpeg,
            Err(err) => {
                warn!("camera {camera_id}: stream encode failed: {err}");
                thread::sleep(EMPTY_POLL);
                continue;
            }
        };

        if tx.blocking_send(multipart_chunk(&jpeg)).is_err() {
            debug!("viewer for camera {camera_id} disconnected");
            break;
        }
        thread::sleep(FRAME_PACE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_multipart_framed() {
        let chunk = multipart_chunk(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(chunk.ends_with(b"\r\n\r\n"));
    }
}
