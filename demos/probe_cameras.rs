//! Camera diagnostic: sweep device indices against the backend list
//! and report what opens, at which resolution, over which backend.
//!
//! Usage: cargo run --bin probe_cameras [max_index]

use anyhow::Result;
use wastewatch_camera::{list_cameras, DEFAULT_BACKENDS};

fn main() -> Result<()> {
    env_logger::init();

    let max = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);

    println!("Probing device indices 0..{max} ...");
    let cameras = list_cameras(max, DEFAULT_BACKENDS);

    if cameras.is_empty() {
        println!("No cameras found.");
        return Ok(());
    }
    for cam in &cameras {
        println!(
            "  #{} {}: {} @ {:.0}fps via {}",
            cam.id, cam.name, cam.resolution, cam.fps, cam.backend
        );
    }
    println!("{} camera(s) found.", cameras.len());
    Ok(())
}
