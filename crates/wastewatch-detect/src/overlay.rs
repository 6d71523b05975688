// wastewatch-detect/src/overlay.rs
// Draw ring contents + running counters onto a copy of a frame.

use opencv::core::{Point, Rect, Scalar};
use opencv::imgproc;

use wastewatch_camera::Frame;

use crate::{Detection, Result, Stats, WasteCategory};

const FONT: i32 = imgproc::FONT_HERSHEY_SIMPLEX;
const LABEL_SCALE: f64 = 0.5;
const COUNTER_SCALE: f64 = 0.7;
const TEXT_THICKNESS: i32 = 2;

// BGR: green for organic, red for inorganic.
fn category_color(category: WasteCategory) -> Scalar {
    match category {
        WasteCategory::Organic => Scalar::new(0.0, 255.0, 0.0, 0.0),
        WasteCategory::Inorganic => Scalar::new(0.0, 0.0, 255.0, 0.0),
    }
}

/// Produce an annotated copy of `frame`: every detection currently in
/// the ring gets a shadowed bounding box, a label with the mapped
/// category and the model's original label, and its confidence; the
/// running counters are pinned to the top-left corner.
///
/// Pure function of its inputs; the source frame is never mutated.
/// Note the whole ring is drawn, so boxes from recent earlier frames
/// stay visible until they are evicted.
pub fn render_detections(frame: &Frame, detections: &[Detection], stats: &Stats) -> Result<Frame> {
    let mut mat = frame.to_mat().map_err(crate::DetectError::Camera)?;
    let black = Scalar::new(0.0, 0.0, 0.0, 0.0);
    let white = Scalar::new(255.0, 255.0, 255.0, 0.0);

    for det in detections {
        let [x1, y1, x2, y2] = det.bbox;
        let bounds = Rect::new(x1, y1, x2 - x1, y2 - y1);
        let color = category_color(det.category);

        // Black outer border behind the colored one keeps boxes legible
        // on busy backgrounds.
        imgproc::rectangle(&mut mat, bounds, black, 4, imgproc::LINE_8, 0)?;
        imgproc::rectangle(&mut mat, bounds, color, 2, imgproc::LINE_8, 0)?;

        let label = format!("{} ({})", det.category, det.original_label);
        let conf_label = format!("{:.2}", det.confidence);

        let mut baseline = 0;
        let label_size =
            imgproc::get_text_size(&label, FONT, LABEL_SCALE, TEXT_THICKNESS, &mut baseline)?;
        let conf_size =
            imgproc::get_text_size(&conf_label, FONT, LABEL_SCALE, TEXT_THICKNESS, &mut baseline)?;

        let text_width = label_size.width.max(conf_size.width);
        let text_height = label_size.height + conf_size.height + 10;
        imgproc::rectangle(
            &mut mat,
            Rect::new(x1, y1 - text_height, text_width, text_height),
            black,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            &mut mat,
            &label,
            Point::new(x1, y1 - conf_size.height - 5),
            FONT,
            LABEL_SCALE,
            color,
            TEXT_THICKNESS,
            imgproc::LINE_8,
            false,
        )?;
        imgproc::put_text(
            &mut mat,
            &conf_label,
            Point::new(x1, y1 - 5),
            FONT,
            LABEL_SCALE,
            white,
            TEXT_THICKNESS,
            imgproc::LINE_8,
            false,
        )?;
    }

    let counter = format!(
        "Total: {} | Org: {} | Inorg: {}",
        stats.total, stats.organic, stats.inorganic
    );
    imgproc::put_text(
        &mut mat,
        &counter,
        Point::new(10, 30),
        FONT,
        COUNTER_SCALE,
        white,
        TEXT_THICKNESS,
        imgproc::LINE_8,
        false,
    )?;

    let mut annotated = Frame::from_mat(&mat).map_err(crate::DetectError::Camera)?;
    annotated.captured_at = frame.captured_at;
    Ok(annotated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_frame(w: u32, h: u32) -> Frame {
        Frame::new(vec![90; (w * h) as usize * Frame::CHANNELS], w, h)
    }

    fn plastic_at(bbox: [i32; 4]) -> Detection {
        Detection {
            timestamp: 0,
            category: WasteCategory::Inorganic,
            original_label: "plastic",
            confidence: 0.87,
            bbox,
        }
    }

    #[test]
    fn render_leaves_the_input_untouched() {
        let frame = gray_frame(320, 240);
        let before = frame.data.clone();
        let stats = Stats {
            total: 1,
            organic: 0,
            inorganic: 1,
        };
        let annotated =
            render_detections(&frame, &[plastic_at([60, 60, 160, 160])], &stats).unwrap();
        assert_eq!(frame.data, before);
        assert_eq!((annotated.width, annotated.height), (320, 240));
        assert_ne!(annotated.data, frame.data);
    }

    #[test]
    fn counter_is_drawn_even_with_an_empty_ring() {
        let frame = gray_frame(320, 240);
        let annotated = render_detections(&frame, &[], &Stats::default()).unwrap();
        assert_ne!(annotated.data, frame.data);
    }

    #[test]
    fn timestamp_is_carried_over() {
        let mut frame = gray_frame(64, 64);
        frame.captured_at = 1234;
        let annotated = render_detections(&frame, &[], &Stats::default()).unwrap();
        assert_eq!(annotated.captured_at, 1234);
    }
}
