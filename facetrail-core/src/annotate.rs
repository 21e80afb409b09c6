use crate::recognize::Detection;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_HEIGHT: u32 = 8;

/// Draw a 2px box per detection plus a solid label strip above it:
/// green for enrolled names, red for Unknown.
pub fn draw_detections(image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
        if detection.width == 0 || detection.height == 0 {
            continue;
        }
        let color = if detection.is_known() {
            KNOWN_COLOR
        } else {
            UNKNOWN_COLOR
        };

        let outer = Rect::at(detection.x, detection.y).of_size(detection.width, detection.height);
        draw_hollow_rect_mut(image, outer, color);
        if detection.width > 2 && detection.height > 2 {
            let inner = Rect::at(detection.x + 1, detection.y + 1)
                .of_size(detection.width - 2, detection.height - 2);
            draw_hollow_rect_mut(image, inner, color);
        }

        // Strip sits above the box, or inside it at the top edge of the frame
        let label_y = if detection.y >= LABEL_HEIGHT as i32 {
            detection.y - LABEL_HEIGHT as i32
        } else {
            detection.y
        };
        let strip = Rect::at(detection.x, label_y).of_size(detection.width, LABEL_HEIGHT);
        draw_filled_rect_mut(image, strip, color);
    }
}

/// Copy of `image` with detections drawn on it
pub fn annotated(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut out = image.clone();
    draw_detections(&mut out, detections);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::UNKNOWN;

    fn detection(name: &str) -> Detection {
        Detection {
            x: 10,
            y: 20,
            width: 20,
            height: 20,
            name: name.to_string(),
            distance: 0.1,
        }
    }

    #[test]
    fn test_box_colors() {
        let base = RgbImage::new(64, 64);

        let known = annotated(&base, &[detection("Alice")]);
        assert_eq!(known.get_pixel(10, 30), &KNOWN_COLOR);

        let unknown = annotated(&base, &[detection(UNKNOWN)]);
        assert_eq!(unknown.get_pixel(10, 30), &UNKNOWN_COLOR);
        assert_eq!(unknown.get_pixel(15, 14), &UNKNOWN_COLOR); // label strip
        assert_eq!(unknown.get_pixel(20, 30), &Rgb([0, 0, 0])); // interior untouched
    }

    #[test]
    fn test_boxes_outside_frame_are_clipped() {
        let mut image = RgbImage::new(16, 16);
        let mut far = detection("Alice");
        far.x = 100;
        far.y = -5;
        draw_detections(&mut image, &[far]);
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
    }
}
