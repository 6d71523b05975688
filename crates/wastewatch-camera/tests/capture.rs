// Capture-loop behaviour against a synthetic source: no hardware needed.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wastewatch_camera::{
    CameraHandle, CameraId, CaptureConfig, Frame, Result, SourceGeometry, VideoSource,
    PROCESSED_HEIGHT, PROCESSED_WIDTH,
};

/// Emits solid frames whose first byte is the frame counter, so tests
/// can tell captures apart.
struct SyntheticSource {
    width: u32,
    height: u32,
    counter: Arc<AtomicU32>,
    closed: Arc<AtomicU32>,
}

impl SyntheticSource {
    fn new(width: u32, height: u32) -> (Self, Arc<AtomicU32>, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(0));
        let closed = Arc::new(AtomicU32::new(0));
        (
            Self {
                width,
                height,
                counter: counter.clone(),
                closed: closed.clone(),
            },
            counter,
            closed,
        )
    }
}

impl VideoSource for SyntheticSource {
    fn read(&mut self) -> Result<Frame> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let mut data = vec![64u8; (self.width * self.height) as usize * Frame::CHANNELS];
        data[0] = (n % 251) as u8;
        Ok(Frame::new(data, self.width, self.height))
    }

    fn geometry(&self) -> SourceGeometry {
        SourceGeometry {
            width: self.width,
            height: self.height,
            fps: 100.0,
        }
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_for<F: Fn() -> bool>(budget: Duration, predicate: F) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn fast_config() -> CaptureConfig {
    CaptureConfig {
        width: 320,
        height: 240,
        fps: 100,
        ..CaptureConfig::default()
    }
}

#[test]
fn publishes_raw_and_processed_frames() {
    let (source, _, _) = SyntheticSource::new(320, 240);
    let handle = CameraHandle::start(CameraId::new(0), Box::new(source), fast_config()).unwrap();

    assert!(wait_for(Duration::from_secs(2), || handle.frame().is_some()));
    assert!(wait_for(Duration::from_secs(2), || handle
        .processed_frame()
        .is_some()));

    let raw = handle.frame().unwrap();
    assert_eq!((raw.width, raw.height), (320, 240));

    let prepped = handle.processed_frame().unwrap();
    assert_eq!(prepped.width, PROCESSED_WIDTH as u32);
    assert_eq!(prepped.height, PROCESSED_HEIGHT as u32);

    handle.stop().unwrap();
}

#[test]
fn stop_joins_clears_slots_and_releases_device() {
    let (source, _, closed) = SyntheticSource::new(64, 48);
    let handle = CameraHandle::start(CameraId::new(1), Box::new(source), fast_config()).unwrap();
    assert!(wait_for(Duration::from_secs(2), || handle.frame().is_some()));

    handle.stop().unwrap();
    assert!(!handle.is_running());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(handle.frame().is_none());
    assert!(handle.processed_frame().is_none());

    // Stopping again is a no-op success.
    handle.stop().unwrap();
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[test]
fn readers_are_isolated_from_later_writes() {
    let (source, counter, _) = SyntheticSource::new(64, 48);
    let handle = CameraHandle::start(CameraId::new(2), Box::new(source), fast_config()).unwrap();
    assert!(wait_for(Duration::from_secs(2), || handle.frame().is_some()));

    let snapshot = handle.frame().unwrap();
    let tag = snapshot.data[0];
    let seen = counter.load(Ordering::SeqCst);
    assert!(wait_for(Duration::from_secs(2), || {
        counter.load(Ordering::SeqCst) > seen + 2
    }));
    // The old snapshot is untouched by newer captures.
    assert_eq!(snapshot.data[0], tag);

    handle.stop().unwrap();
}

#[test]
fn jpeg_snapshot_is_encoded() {
    let (source, _, _) = SyntheticSource::new(64, 48);
    let handle = CameraHandle::start(CameraId::new(3), Box::new(source), fast_config()).unwrap();
    assert!(wait_for(Duration::from_secs(2), || handle.frame().is_some()));

    let jpeg = handle.jpeg(80).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    handle.stop().unwrap();
}
