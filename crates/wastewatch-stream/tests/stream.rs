// Viewer behaviour over a synthetic camera: frames flow, stopping the
// camera ends the stream instead of hanging it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use wastewatch_camera::{CameraId, CaptureConfig, Frame, SourceGeometry, VideoSource};
use wastewatch_detect::{Detector, DetectorSession, RawDetection};
use wastewatch_registry::{CameraRegistry, FrameFetch};
use wastewatch_stream::open_stream;

struct SyntheticSource;

impl VideoSource for SyntheticSource {
    fn read(&mut self) -> wastewatch_camera::Result<Frame> {
        Ok(Frame::new(vec![60; 320 * 240 * Frame::CHANNELS], 320, 240))
    }

    fn geometry(&self) -> SourceGeometry {
        SourceGeometry {
            width: 320,
            height: 240,
            fps: 30.0,
        }
    }

    fn close(&mut self) {}
}

struct PlasticEverywhere;

impl Detector for PlasticEverywhere {
    fn detect(&mut self, _frame: &Frame) -> wastewatch_detect::Result<Vec<RawDetection>> {
        Ok(vec![RawDetection {
            class_id: 4,
            confidence: 0.9,
            bbox: [20.0, 20.0, 80.0, 80.0],
        }])
    }
}

fn synthetic_registry() -> Arc<CameraRegistry> {
    Arc::new(CameraRegistry::with_hooks(
        |_id, _config| Ok(Box::new(SyntheticSource) as Box<dyn VideoSource>),
        |id, _model_path: &Path, threshold| {
            Ok(DetectorSession::new(
                id,
                Box::new(PlasticEverywhere),
                threshold,
            ))
        },
    ))
}

async fn wait_for_frame(registry: &CameraRegistry, id: CameraId) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if matches!(registry.get_frame(id, false, 80), FrameFetch::Frame(_)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("camera never produced a frame");
}

#[tokio::test]
async fn stream_yields_wellformed_chunks() {
    let registry = synthetic_registry();
    let id = CameraId::new(0);
    registry.start_camera(id, CaptureConfig::default()).unwrap();
    wait_for_frame(&registry, id).await;

    let mut stream = Box::pin(open_stream(registry.clone(), id, false, 80));
    let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("stream produced nothing")
        .expect("stream ended prematurely");

    let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    assert!(chunk.starts_with(header));
    // SOI marker right after the multipart header.
    assert_eq!(&chunk[header.len()..header.len() + 2], &[0xFF, 0xD8]);

    registry.stop_camera(id).unwrap();
}

#[tokio::test]
async fn two_viewers_do_not_interfere() {
    let registry = synthetic_registry();
    let id = CameraId::new(1);
    registry.start_camera(id, CaptureConfig::default()).unwrap();
    wait_for_frame(&registry, id).await;

    let mut first = Box::pin(open_stream(registry.clone(), id, false, 80));
    let mut second = Box::pin(open_stream(registry.clone(), id, false, 80));

    let a = tokio::time::timeout(Duration::from_secs(2), first.next())
        .await
        .expect("first viewer starved");
    let b = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .expect("second viewer starved");
    assert!(a.is_some());
    assert!(b.is_some());

    // Dropping one viewer leaves the other running.
    drop(first);
    let again = tokio::time::timeout(Duration::from_secs(2), second.next())
        .await
        .expect("surviving viewer starved");
    assert!(again.is_some());

    registry.stop_camera(id).unwrap();
}

#[tokio::test]
async fn stopping_the_camera_terminates_the_stream() {
    let registry = synthetic_registry();
    let id = CameraId::new(2);
    registry.start_camera(id, CaptureConfig::default()).unwrap();
    wait_for_frame(&registry, id).await;

    let mut stream = Box::pin(open_stream(registry.clone(), id, false, 80));
    assert!(tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("no first chunk")
        .is_some());

    registry.stop_camera(id).unwrap();

    // Drain whatever was buffered; the stream must then end rather
    // than stall forever.
    let ended = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(_chunk) = stream.next().await {}
    })
    .await;
    assert!(ended.is_ok(), "stream kept running after camera stop");
}

#[tokio::test]
async fn annotated_stream_draws_over_frames() {
    let registry = synthetic_registry();
    let id = CameraId::new(3);
    registry.start_camera(id, CaptureConfig::default()).unwrap();
    wait_for_frame(&registry, id).await;
    registry.start_detection(id, 0.5, "model.onnx").unwrap();

    let mut stream = Box::pin(open_stream(registry.clone(), id, true, 80));
    let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("annotated stream produced nothing")
        .expect("annotated stream ended prematurely");
    assert!(chunk.starts_with(b"--frame\r\n"));

    registry.stop_camera(id).unwrap();
}

#[tokio::test]
async fn annotated_stream_without_a_session_ends() {
    let registry = synthetic_registry();
    let id = CameraId::new(4);
    registry.start_camera(id, CaptureConfig::default()).unwrap();
    wait_for_frame(&registry, id).await;

    let mut stream = Box::pin(open_stream(registry.clone(), id, true, 80));
    let next = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("stream did not settle");
    assert!(next.is_none());

    registry.stop_camera(id).unwrap();
}
