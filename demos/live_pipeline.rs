//! End-to-end hardware demo: start camera 0, bind a detector, and
//! print detection stats for a while.
//!
//! Usage: cargo run --bin live_pipeline -- <model.onnx> [confidence]

use std::time::Duration;

use anyhow::{bail, Context, Result};
use wastewatch_camera::{CameraId, CaptureConfig};
use wastewatch_registry::CameraRegistry;

const RUN_FOR: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(model) = args.next() else {
        bail!("usage: live_pipeline <model.onnx> [confidence]");
    };
    let confidence: f32 = args
        .next()
        .map(|arg| arg.parse())
        .transpose()
        .context("confidence must be a float")?
        .unwrap_or(0.3);

    let registry = CameraRegistry::new();
    let id = CameraId::new(0);

    let geometry = registry
        .start_camera(id, CaptureConfig::default())
        .context("starting camera 0")?;
    println!(
        "Camera 0 up at {}x{} @ {:.0}fps",
        geometry.width, geometry.height, geometry.fps
    );

    registry
        .start_detection(id, confidence, &model)
        .context("starting detection")?;
    println!("Detection running (threshold {confidence:.2}) for {RUN_FOR:?} ...");

    let ticks = RUN_FOR.as_secs().max(1);
    for _ in 0..ticks {
        std::thread::sleep(Duration::from_secs(1));
        let stats = registry.detection_stats(id);
        println!(
            "  total {:>4}  organic {:>4}  inorganic {:>4}  ring {}",
            stats.total,
            stats.organic,
            stats.inorganic,
            stats.recent.len()
        );
        if !stats.active {
            println!("Detector stopped itself; see logs.");
            break;
        }
    }

    registry.stop_camera(id).context("stopping camera")?;
    println!("Done.");
    Ok(())
}
