//! Overlays for the operator preview: blob keypoints and the detected grid.

use dotgrid_detect::Keypoint;
use image::{Rgb, RgbImage};
use nalgebra::Point2;

const KEYPOINT: Rgb<u8> = Rgb([0, 255, 0]);

/// One color per pattern column, cycled.
const COLUMN_COLORS: [Rgb<u8>; 6] = [
    Rgb([255, 0, 0]),
    Rgb([255, 128, 0]),
    Rgb([200, 200, 0]),
    Rgb([0, 255, 0]),
    Rgb([0, 200, 255]),
    Rgb([160, 0, 255]),
];

/// Circle of the blob size around every keypoint.
pub fn draw_keypoints(img: &mut RgbImage, keypoints: &[Keypoint]) {
    for kp in keypoints {
        let c = to_pixel(kp.position);
        let radius = (kp.size / 2.0).round().max(1.0) as i32;
        draw_ring(img, c, radius, KEYPOINT);
        draw_ring(img, c, radius + 1, KEYPOINT);
    }
}

/// Grid points in pattern order, `rows` per column: every point gets a
/// marker, consecutive points are connected so the traversal order is
/// visible.
pub fn draw_grid(img: &mut RgbImage, points: &[Point2<f32>], rows: usize) {
    let rows = rows.max(1);
    let mut prev: Option<(i32, i32)> = None;
    for (idx, p) in points.iter().enumerate() {
        let color = COLUMN_COLORS[(idx / rows) % COLUMN_COLORS.len()];
        let c = to_pixel(*p);
        if let Some(prev) = prev {
            draw_line(img, prev, c, color);
        }
        draw_cross(img, c, 4, color);
        draw_ring(img, c, 5, color);
        prev = Some(c);
    }
}

fn to_pixel(p: Point2<f32>) -> (i32, i32) {
    (p.x.round() as i32, p.y.round() as i32)
}

fn put(img: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham line.
fn draw_line(img: &mut RgbImage, from: (i32, i32), to: (i32, i32), color: Rgb<u8>) {
    let (mut x0, mut y0) = from;
    let (x1, y1) = to;
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;

    loop {
        put(img, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Midpoint circle outline.
fn draw_ring(img: &mut RgbImage, (cx, cy): (i32, i32), radius: i32, color: Rgb<u8>) {
    let (mut x, mut y) = (radius, 0);
    let mut err = 1 - radius;
    while x >= y {
        for (dx, dy) in [(x, y), (y, x), (-y, x), (-x, y), (-x, -y), (-y, -x), (y, -x), (x, -y)] {
            put(img, cx + dx, cy + dy, color);
        }
        y += 1;
        if err < 0 {
            err += 2 * y + 1;
        } else {
            x -= 1;
            err += 2 * (y - x) + 1;
        }
    }
}

fn draw_cross(img: &mut RgbImage, (cx, cy): (i32, i32), half: i32, color: Rgb<u8>) {
    draw_line(img, (cx - half, cy - half), (cx + half, cy + half), color);
    draw_line(img, (cx - half, cy + half), (cx + half, cy - half), color);
}
