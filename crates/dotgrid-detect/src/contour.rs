//! Connected components and their outer contours on a thresholded image.

use dotgrid_core::GrayImageView;
use nalgebra::Point2;

/// 8-neighbourhood in clockwise order (image y axis points down), starting west.
const DIRS: [(i32, i32); 8] = [
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
];

/// Which side of the threshold counts as foreground.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Foreground {
    /// `value <= threshold`
    Dark,
    /// `value > threshold`
    Light,
}

/// Binary view of a gray image at one threshold.
#[derive(Clone, Copy)]
pub(crate) struct BinaryView<'a> {
    img: &'a GrayImageView<'a>,
    threshold: u8,
    foreground: Foreground,
}

impl<'a> BinaryView<'a> {
    pub(crate) fn new(img: &'a GrayImageView<'a>, threshold: u8, foreground: Foreground) -> Self {
        Self {
            img,
            threshold,
            foreground,
        }
    }

    #[inline]
    fn at(&self, idx: usize) -> bool {
        let v = self.img.data[idx];
        match self.foreground {
            Foreground::Dark => v <= self.threshold,
            Foreground::Light => v > self.threshold,
        }
    }

    #[inline]
    pub(crate) fn is_set(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x >= self.img.width as i32 || y >= self.img.height as i32 {
            return false;
        }
        self.at(y as usize * self.img.width + x as usize)
    }
}

/// Raw region statistics of one 8-connected component.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Region {
    /// First pixel in raster order (top-most, then left-most).
    pub start: (i32, i32),
    pub pixels: usize,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
}

impl Region {
    fn new(start: (i32, i32)) -> Self {
        Self {
            start,
            pixels: 0,
            sum_x: 0.0,
            sum_y: 0.0,
            sum_xx: 0.0,
            sum_yy: 0.0,
            sum_xy: 0.0,
        }
    }

    #[inline]
    fn add(&mut self, x: i32, y: i32) {
        let (xf, yf) = (x as f64, y as f64);
        self.pixels += 1;
        self.sum_x += xf;
        self.sum_y += yf;
        self.sum_xx += xf * xf;
        self.sum_yy += yf * yf;
        self.sum_xy += xf * yf;
    }

    pub fn centroid(&self) -> Point2<f64> {
        let n = self.pixels.max(1) as f64;
        Point2::new(self.sum_x / n, self.sum_y / n)
    }

    /// Ratio of the smaller to the larger principal second moment, in `[0, 1]`.
    pub fn inertia_ratio(&self) -> f64 {
        let n = self.pixels.max(1) as f64;
        let c = self.centroid();
        let mu20 = self.sum_xx / n - c.x * c.x;
        let mu02 = self.sum_yy / n - c.y * c.y;
        let mu11 = self.sum_xy / n - c.x * c.y;
        let denom = ((mu20 - mu02).powi(2) + 4.0 * mu11 * mu11).sqrt();
        if denom <= 1e-2 {
            return 1.0;
        }
        let i_max = 0.5 * (mu20 + mu02) + 0.5 * denom;
        let i_min = 0.5 * (mu20 + mu02) - 0.5 * denom;
        if i_max <= 0.0 {
            return 0.0;
        }
        (i_min / i_max).clamp(0.0, 1.0)
    }
}

/// Reusable scratch buffers for component labeling.
#[derive(Default)]
pub(crate) struct LabelScratch {
    stamp: Vec<u32>,
    generation: u32,
    stack: Vec<(i32, i32)>,
}

impl LabelScratch {
    fn begin(&mut self, len: usize) -> u32 {
        if self.stamp.len() != len || self.generation == u32::MAX {
            self.stamp.clear();
            self.stamp.resize(len, 0);
            self.generation = 0;
        }
        self.generation += 1;
        self.generation
    }
}

/// Label all 8-connected foreground components.
pub(crate) fn label_regions(bin: &BinaryView<'_>, scratch: &mut LabelScratch) -> Vec<Region> {
    let w = bin.img.width;
    let h = bin.img.height;
    let gen = scratch.begin(w * h);
    let mut regions = Vec::new();

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            if scratch.stamp[idx] == gen || !bin.at(idx) {
                continue;
            }

            let mut region = Region::new((x as i32, y as i32));
            scratch.stamp[idx] = gen;
            scratch.stack.push((x as i32, y as i32));

            while let Some((cx, cy)) = scratch.stack.pop() {
                region.add(cx, cy);
                for (dx, dy) in DIRS {
                    let nx = cx + dx;
                    let ny = cy + dy;
                    if !bin.is_set(nx, ny) {
                        continue;
                    }
                    let nidx = ny as usize * w + nx as usize;
                    if scratch.stamp[nidx] != gen {
                        scratch.stamp[nidx] = gen;
                        scratch.stack.push((nx, ny));
                    }
                }
            }

            regions.push(region);
        }
    }

    regions
}

/// Trace the outer contour of the component containing `start` (radial sweep).
///
/// `start` must be the first pixel of the component in raster order.
pub(crate) fn trace_contour(bin: &BinaryView<'_>, start: (i32, i32), max_steps: usize) -> Vec<Point2<f64>> {
    let mut contour = vec![Point2::new(start.0 as f64, start.1 as f64)];
    let mut cur = start;
    // Pixels west of and above `start` are background.
    let mut back_dir = 0usize;
    let mut first_move: Option<usize> = None;

    for _ in 0..max_steps {
        let next = (1..=8).map(|k| (back_dir + k) % 8).find_map(|d| {
            let (dx, dy) = DIRS[d];
            let p = (cur.0 + dx, cur.1 + dy);
            bin.is_set(p.0, p.1).then_some((p, d))
        });
        let Some((p, d)) = next else {
            break; // isolated pixel
        };

        if cur == start {
            match first_move {
                None => first_move = Some(d),
                Some(f) if f == d => break,
                Some(_) => {}
            }
        }

        cur = p;
        back_dir = (d + 4) % 8;
        if cur != start {
            contour.push(Point2::new(cur.0 as f64, cur.1 as f64));
        }
    }

    contour
}

/// Closed polygon length.
pub(crate) fn perimeter(poly: &[Point2<f64>]) -> f64 {
    if poly.len() < 2 {
        return 0.0;
    }
    poly.iter()
        .zip(poly.iter().cycle().skip(1))
        .map(|(a, b)| (b - a).norm())
        .sum()
}

/// Unsigned shoelace area of a closed polygon.
pub(crate) fn polygon_area(poly: &[Point2<f64>]) -> f64 {
    if poly.len() < 3 {
        return 0.0;
    }
    let twice: f64 = poly
        .iter()
        .zip(poly.iter().cycle().skip(1))
        .map(|(a, b)| a.x * b.y - b.x * a.y)
        .sum();
    0.5 * twice.abs()
}

fn cross(o: &Point2<f64>, a: &Point2<f64>, b: &Point2<f64>) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

/// Convex hull (Andrew's monotone chain), counter-clockwise, no repeated end point.
pub(crate) fn convex_hull(points: &[Point2<f64>]) -> Vec<Point2<f64>> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| {
        a.x.partial_cmp(&b.x)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.y.partial_cmp(&b.y).unwrap_or(std::cmp::Ordering::Equal))
    });
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut lower: Vec<Point2<f64>> = Vec::with_capacity(pts.len());
    for p in &pts {
        while lower.len() >= 2 && cross(&lower[lower.len() - 2], &lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(*p);
    }
    let mut upper: Vec<Point2<f64>> = Vec::with_capacity(pts.len());
    for p in pts.iter().rev() {
        while upper.len() >= 2 && cross(&upper[upper.len() - 2], &upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(*p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotgrid_core::GrayImage;

    fn disk_image(w: usize, h: usize, cx: f64, cy: f64, r: f64) -> GrayImage {
        let mut img = GrayImage::filled(w, h, 255);
        for y in 0..h {
            for x in 0..w {
                let d = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
                if d <= r {
                    img.data[y * w + x] = 0;
                }
            }
        }
        img
    }

    #[test]
    fn labels_separate_components() {
        let mut img = GrayImage::filled(10, 5, 255);
        for (x, y) in [(1, 1), (2, 1), (2, 2), (7, 3), (8, 3)] {
            img.data[y * 10 + x] = 0;
        }
        let view = img.view();
        let bin = BinaryView::new(&view, 100, Foreground::Dark);
        let mut scratch = LabelScratch::default();
        let regions = label_regions(&bin, &mut scratch);
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].pixels, 3);
        assert_eq!(regions[0].start, (1, 1));
        assert_eq!(regions[1].pixels, 2);

        // Scratch buffers are reusable across thresholds.
        let bin_light = BinaryView::new(&view, 100, Foreground::Light);
        let regions = label_regions(&bin_light, &mut scratch);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].pixels, 50 - 5);
    }

    #[test]
    fn disk_contour_is_round_and_convex() {
        let img = disk_image(64, 64, 31.3, 30.6, 12.0);
        let view = img.view();
        let bin = BinaryView::new(&view, 128, Foreground::Dark);
        let mut scratch = LabelScratch::default();
        let regions = label_regions(&bin, &mut scratch);
        assert_eq!(regions.len(), 1);

        let region = regions[0];
        let c = region.centroid();
        assert!((c.x - 31.3).abs() < 0.3 && (c.y - 30.6).abs() < 0.3);
        assert!(region.inertia_ratio() > 0.9);

        let contour = trace_contour(&bin, region.start, 4 * region.pixels + 8);
        let area = polygon_area(&contour);
        let per = perimeter(&contour);
        let circularity = 4.0 * std::f64::consts::PI * area / (per * per);
        let hull_area = polygon_area(&convex_hull(&contour));
        assert!(circularity > 0.8, "circularity {circularity}");
        assert!(area / hull_area > 0.95);
        assert!((area - std::f64::consts::PI * 11.5 * 11.5).abs() < 40.0, "area {area}");
    }

    #[test]
    fn single_pixel_contour() {
        let mut img = GrayImage::filled(3, 3, 255);
        img.data[4] = 0;
        let view = img.view();
        let bin = BinaryView::new(&view, 10, Foreground::Dark);
        let contour = trace_contour(&bin, (1, 1), 16);
        assert_eq!(contour.len(), 1);
        assert_eq!(polygon_area(&contour), 0.0);
    }

    #[test]
    fn hull_of_square_with_notch() {
        let pts = [
            Point2::new(0.0, 0.0),
            Point2::new(4.0, 0.0),
            Point2::new(2.0, 1.0),
            Point2::new(4.0, 4.0),
            Point2::new(0.0, 4.0),
        ];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!((polygon_area(&hull) - 16.0).abs() < 1e-12);
    }
}
